//! TaskGraph (§4.7): the concurrent, dependency-ordered, de-duplicating,
//! result-caching scheduler.
//!
//! Realised per §5 as a single `tokio` task owning all the mutable state
//! (`index`, `dependants`, `inProgress`, the caches), driven by an mpsc
//! command channel. Task bodies run on separate `tokio::spawn`ed tasks and
//! report back as commands — the pump itself never awaits external I/O.

pub mod cache;
pub mod task;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::error::{OrchestratorError, RuntimeError, TaskError};
use crate::events::{EventBus, SchedulerEvent};

use cache::ResultCache;
pub use task::{Task, TaskResult};
use task::Node;

const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

enum Command {
    AddTask {
        task: Arc<dyn Task>,
        parent_type: Option<Arc<str>>,
        respond: Option<oneshot::Sender<Result<TaskResult, String>>>,
    },
    TaskDone {
        key: Arc<str>,
        output: serde_json::Value,
        completed_at_ms: u64,
    },
    TaskFailed {
        key: Arc<str>,
        error: String,
    },
    Query {
        respond: oneshot::Sender<SchedulerSnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub in_graph: usize,
    pub in_progress: usize,
    pub cached_results: usize,
}

/// A handle to a running scheduler. Cheap to clone; every clone talks to
/// the same pump.
#[derive(Clone)]
pub struct TaskGraph {
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskGraph {
    pub fn new(global_concurrency_limit: usize, events: EventBus) -> Self {
        Self::with_cache_size(global_concurrency_limit, DEFAULT_MAX_CACHE_SIZE, events)
    }

    pub fn with_cache_size(global_concurrency_limit: usize, max_cache_size: usize, events: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = Pump::new(global_concurrency_limit, max_cache_size, events, tx.clone());
        tokio::spawn(pump.run(rx));
        Self { commands: tx }
    }

    /// Submit `tasks` and await each one's terminal `TaskResult`.
    pub async fn process(&self, tasks: Vec<Arc<dyn Task>>) -> Result<Vec<TaskResult>, OrchestratorError> {
        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(Command::AddTask { task, parent_type: None, respond: Some(tx) })
                .map_err(|_| RuntimeError("scheduler pump is no longer running".into()))?;
            receivers.push(rx);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(message)) => {
                    return Err(TaskError { base_key: String::new(), key: String::new(), message }.into())
                }
                Err(_) => return Err(RuntimeError("scheduler dropped before responding".into()).into()),
            }
        }
        Ok(results)
    }

    /// Like `process`, but unwraps each result's output directly.
    pub async fn resolve(&self, tasks: Vec<Arc<dyn Task>>) -> Result<Vec<serde_json::Value>, OrchestratorError> {
        let results = self.process(tasks).await?;
        Ok(results.into_iter().filter_map(|r| r.output).collect())
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Query { respond: tx })
            .map_err(|_| RuntimeError("scheduler pump is no longer running".into()))?;
        rx.await.map_err(|_| RuntimeError("scheduler dropped before responding".into()).into())
    }
}

struct StoredResult {
    result: TaskResult,
    remaining_consumers: usize,
}

struct Pump {
    index: HashMap<Arc<str>, Node>,
    in_progress: HashSet<Arc<str>>,
    results: HashMap<Arc<str>, StoredResult>,
    waiters: HashMap<Arc<str>, Vec<oneshot::Sender<Result<TaskResult, String>>>>,
    result_cache: ResultCache,
    global_limit: usize,
    events: EventBus,
    commands: mpsc::UnboundedSender<Command>,
    next_id: u64,
    graph_processing: bool,
}

impl Pump {
    fn new(global_limit: usize, max_cache_size: usize, events: EventBus, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            index: HashMap::new(),
            in_progress: HashSet::new(),
            results: HashMap::new(),
            waiters: HashMap::new(),
            result_cache: ResultCache::new(max_cache_size),
            global_limit,
            events,
            commands,
            next_id: 0,
            graph_processing: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::AddTask { task, parent_type, respond } => {
                    self.add_task(task, parent_type, respond);
                }
                Command::TaskDone { key, output, completed_at_ms } => {
                    self.on_task_done(key, output, completed_at_ms);
                }
                Command::TaskFailed { key, error } => {
                    self.on_task_failed(key, error);
                }
                Command::Query { respond } => {
                    let _ = respond.send(SchedulerSnapshot {
                        in_graph: self.index.len(),
                        in_progress: self.in_progress.len(),
                        cached_results: self.result_cache.len(),
                    });
                }
            }
            self.drive();
        }
    }

    /// Add a task to the graph (§4.7 "Adding a task").
    fn add_task(
        &mut self,
        task: Arc<dyn Task>,
        parent_type: Option<Arc<str>>,
        respond: Option<oneshot::Sender<Result<TaskResult, String>>>,
    ) -> Arc<str> {
        let key = task.key();

        if !task.force() {
            if let Some(cached) = self.result_cache.get(&key).cloned() {
                let result = TaskResult {
                    base_key: task.base_key(),
                    key: Arc::clone(&key),
                    id: self.next_id,
                    description: task.description(),
                    started_at_ms: cached.completed_at_ms,
                    completed_at_ms: Some(cached.completed_at_ms),
                    output: Some(cached.output.clone()),
                    error: None,
                    dependency_results: BTreeMap::new(),
                };
                self.next_id += 1;
                self.events.emit(SchedulerEvent::TaskComplete { key: Arc::clone(&key), output: cached.output });
                if let Some(tx) = respond {
                    let _ = tx.send(Ok(result));
                }
                return key;
            }
        }

        if self.index.contains_key(&key) {
            if let Some(tx) = respond {
                self.waiters.entry(Arc::clone(&key)).or_default().push(tx);
            }
            return key;
        }

        // Predecessor: same baseKey already indexed under a different key.
        // This node must never run concurrently with it, whether or not the
        // predecessor has started yet — so it always gets a dependency edge,
        // not just once it's already in progress.
        let predecessor = self
            .index
            .values()
            .find(|n| n.base_key == task.base_key() && n.key != key)
            .map(|n| n.key.clone());

        let mut dependency_keys = Vec::new();
        for dep in task.dependencies() {
            let dep_key = dep.key();
            if !dep.force() && self.result_cache.get(&dep_key).is_some() {
                // Already resolved — drop the edge rather than re-adding it.
                continue;
            }
            let added = self.add_task(dep, Some(Arc::from(task.type_name())), None);
            dependency_keys.push(added);
        }

        if let Some(pred_key) = predecessor {
            dependency_keys.push(pred_key);
        }

        let id = self.next_id;
        self.next_id += 1;

        let node = Node {
            id,
            base_key: task.base_key(),
            key: Arc::clone(&key),
            type_name: Arc::from(task.type_name()),
            version: task.version(),
            force: task.force(),
            concurrency_limit: task.concurrency_limit(),
            dependency_keys: dependency_keys.clone(),
            dependants: Vec::new(),
            parent_type,
            started_at_ms: None,
            task,
        };

        for dep_key in &dependency_keys {
            if let Some(dep_node) = self.index.get_mut(dep_key) {
                dep_node.dependants.push(Arc::clone(&key));
            }
        }

        self.index.insert(Arc::clone(&key), node);
        self.events.emit(SchedulerEvent::TaskPending { key: Arc::clone(&key) });
        if let Some(tx) = respond {
            self.waiters.entry(Arc::clone(&key)).or_default().push(tx);
        }
        key
    }

    fn can_start(&self, node: &Node) -> bool {
        if self.in_progress.len() >= self.global_limit {
            return false;
        }
        if let Some(limit) = node.concurrency_limit {
            let same_type_parent = node.parent_type.as_deref() == Some(node.type_name.as_ref());
            if !same_type_parent {
                let in_progress_of_type = self
                    .in_progress
                    .iter()
                    .filter(|k| self.index.get(*k).map(|n| n.type_name == node.type_name).unwrap_or(false))
                    .count();
                if in_progress_of_type >= limit {
                    return false;
                }
            }
        }
        true
    }

    /// The processing loop (§4.7): launches every eligible root, emits the
    /// graph-level lifecycle events.
    #[instrument(skip(self))]
    fn drive(&mut self) {
        if self.index.is_empty() {
            if self.graph_processing {
                self.events.emit(SchedulerEvent::TaskGraphComplete { completed_at_ms: now_ms() });
                self.graph_processing = false;
            }
            return;
        }

        if !self.graph_processing {
            self.events.emit(SchedulerEvent::TaskGraphProcessing { started_at_ms: now_ms() });
            self.graph_processing = true;
        }

        let roots: Vec<Arc<str>> = self
            .index
            .iter()
            .filter(|(key, n)| n.dependency_keys.is_empty() && !self.in_progress.contains(*key))
            .map(|(key, _)| Arc::clone(key))
            .collect();

        for key in roots {
            let eligible = match self.index.get(&key) {
                Some(node) => self.can_start(node),
                None => continue,
            };
            if !eligible {
                continue;
            }
            self.dispatch(&key);
        }
    }

    fn dispatch(&mut self, key: &Arc<str>) {
        let started_at_ms = now_ms();
        let (task, dependency_keys, version) = {
            let node = match self.index.get_mut(key) {
                Some(n) => n,
                None => return,
            };
            node.started_at_ms = Some(started_at_ms);
            (Arc::clone(&node.task), node.dependency_keys.clone(), node.version.version_string.clone())
        };

        let mut dependency_results = BTreeMap::new();
        for dep_key in &dependency_keys {
            if let Some(stored) = self.results.get_mut(dep_key) {
                dependency_results.insert(Arc::clone(dep_key), stored.result.clone());
                stored.remaining_consumers = stored.remaining_consumers.saturating_sub(1);
            }
        }
        self.results.retain(|_, v| v.remaining_consumers > 0);

        self.in_progress.insert(Arc::clone(key));
        self.events.emit(SchedulerEvent::TaskProcessing { key: Arc::clone(key), version });

        let commands = self.commands.clone();
        let task_key = Arc::clone(key);
        tokio::spawn(async move {
            match task.process(dependency_results).await {
                Ok(output) => {
                    let completed_at_ms = now_ms();
                    let _ = commands.send(Command::TaskDone { key: task_key, output, completed_at_ms });
                }
                Err(err) => {
                    let _ = commands.send(Command::TaskFailed { key: task_key, error: err.to_string() });
                }
            }
        });
    }

    fn on_task_done(&mut self, key: Arc<str>, output: serde_json::Value, completed_at_ms: u64) {
        self.in_progress.remove(&key);
        let node = match self.index.remove(&key) {
            Some(n) => n,
            None => return,
        };

        self.result_cache.put(Arc::clone(&key), output.clone(), completed_at_ms);

        let result = TaskResult {
            base_key: node.base_key,
            key: Arc::clone(&key),
            id: node.id,
            description: node.task.description(),
            started_at_ms: node.started_at_ms.unwrap_or(completed_at_ms),
            completed_at_ms: Some(completed_at_ms),
            output: Some(output.clone()),
            error: None,
            dependency_results: BTreeMap::new(),
        };

        let dependants_len = node.dependants.len();
        self.results.insert(
            Arc::clone(&key),
            StoredResult { result: result.clone(), remaining_consumers: dependants_len },
        );

        self.events.emit(SchedulerEvent::TaskComplete { key: Arc::clone(&key), output });

        if let Some(waiters) = self.waiters.remove(&key) {
            for tx in waiters {
                let _ = tx.send(Ok(result.clone()));
            }
        }
        if dependants_len == 0 {
            self.results.remove(&key);
        }

        for dependant_key in node.dependants {
            if let Some(dependant) = self.index.get_mut(&dependant_key) {
                dependant.dependency_keys.retain(|k| k != &key);
            }
        }
    }

    /// A failed task's transitive dependants are cancelled — removed from
    /// the graph without their `process` ever being invoked (§4.7, §8).
    fn on_task_failed(&mut self, key: Arc<str>, error: String) {
        self.in_progress.remove(&key);
        let node = match self.index.remove(&key) {
            Some(n) => n,
            None => return,
        };

        self.events.emit(SchedulerEvent::TaskError { key: Arc::clone(&key), error: error.clone() });
        if let Some(waiters) = self.waiters.remove(&key) {
            for tx in waiters {
                let _ = tx.send(Err(error.clone()));
            }
        }

        let mut stack = node.dependants;
        let mut cancelled = HashSet::new();
        while let Some(dependant_key) = stack.pop() {
            if !cancelled.insert(dependant_key.clone()) {
                continue;
            }
            if let Some(dependant) = self.index.remove(&dependant_key) {
                let message = format!("cancelled: dependency '{key}' failed: {error}");
                warn!(key = %dependant_key, "cancelling dependant of failed task");
                if let Some(waiters) = self.waiters.remove(&dependant_key) {
                    for tx in waiters {
                        let _ = tx.send(Err(message.clone()));
                    }
                }
                self.events.emit(SchedulerEvent::TaskError { key: dependant_key, error: message });
                stack.extend(dependant.dependants);
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::ModuleVersion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn version() -> ModuleVersion {
        ModuleVersion { version_string: "v1".into(), dirty_timestamp: None, dependency_versions: Default::default() }
    }

    struct SimpleTask {
        type_name: &'static str,
        name: &'static str,
        deps: Vec<Arc<dyn Task>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Task for SimpleTask {
        fn type_name(&self) -> &str {
            self.type_name
        }
        fn base_key(&self) -> Arc<str> {
            Arc::from(format!("{}.{}", self.type_name, self.name))
        }
        fn key(&self) -> Arc<str> {
            self.base_key()
        }
        fn version(&self) -> ModuleVersion {
            version()
        }
        fn dependencies(&self) -> Vec<Arc<dyn Task>> {
            self.deps.clone()
        }
        async fn process(
            &self,
            _dependency_results: BTreeMap<Arc<str>, TaskResult>,
        ) -> Result<serde_json::Value, OrchestratorError> {
            self.log.lock().unwrap().push(self.name.to_string());
            Ok(serde_json::json!(format!("result-{}", self.name)))
        }
    }

    struct FailingTask {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Task for FailingTask {
        fn type_name(&self) -> &str {
            "fails"
        }
        fn base_key(&self) -> Arc<str> {
            Arc::from("fails.b")
        }
        fn key(&self) -> Arc<str> {
            self.base_key()
        }
        fn version(&self) -> ModuleVersion {
            version()
        }
        async fn process(
            &self,
            _dependency_results: BTreeMap<Arc<str>, TaskResult>,
        ) -> Result<serde_json::Value, OrchestratorError> {
            self.log.lock().unwrap().push("b".to_string());
            Err(RuntimeError("boom".into()).into())
        }
    }

    #[tokio::test]
    async fn linear_chain_runs_dependencies_before_dependants() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Task> = Arc::new(SimpleTask { type_name: "t", name: "a", deps: vec![], log: Arc::clone(&log) });
        let b: Arc<dyn Task> = Arc::new(SimpleTask { type_name: "t", name: "b", deps: vec![Arc::clone(&a)], log: Arc::clone(&log) });

        let graph = TaskGraph::new(4, EventBus::new());
        let results = graph.process(vec![b]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(log.lock().unwrap().as_slice(), &["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn cached_non_error_result_short_circuits_reprocessing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Task> = Arc::new(SimpleTask { type_name: "t", name: "a", deps: vec![], log: Arc::clone(&log) });

        let graph = TaskGraph::new(4, EventBus::new());
        graph.process(vec![Arc::clone(&a)]).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);

        let a_again: Arc<dyn Task> = Arc::new(SimpleTask { type_name: "t", name: "a", deps: vec![], log: Arc::clone(&log) });
        graph.process(vec![a_again]).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1, "cached result must not re-invoke process");
    }

    #[tokio::test]
    async fn dependant_cancellation_on_dependency_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let b: Arc<dyn Task> = Arc::new(FailingTask { log: Arc::clone(&log) });
        let c: Arc<dyn Task> = Arc::new(SimpleTask { type_name: "t", name: "c", deps: vec![Arc::clone(&b)], log: Arc::clone(&log) });

        let graph = TaskGraph::new(4, EventBus::new());
        let err = graph.process(vec![c]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Task(_)));
        assert_eq!(log.lock().unwrap().as_slice(), &["b".to_string()], "cancelled dependant must never run");
    }

    #[tokio::test]
    async fn same_base_key_tasks_never_run_concurrently_even_if_predecessor_is_still_pending() {
        // A1 has an unresolved dependency, so it sits in `index` without ever
        // entering `in_progress`. A2 shares A1's base_key but is itself a
        // root — it must still wait for A1 rather than dispatching at once.
        let log = Arc::new(Mutex::new(Vec::new()));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        struct BlockedDep {
            gate: Arc<tokio::sync::Notify>,
        }

        #[async_trait]
        impl Task for BlockedDep {
            fn type_name(&self) -> &str {
                "dep"
            }
            fn base_key(&self) -> Arc<str> {
                Arc::from("dep.shared")
            }
            fn key(&self) -> Arc<str> {
                self.base_key()
            }
            fn version(&self) -> ModuleVersion {
                version()
            }
            async fn process(
                &self,
                _dependency_results: BTreeMap<Arc<str>, TaskResult>,
            ) -> Result<serde_json::Value, OrchestratorError> {
                self.gate.notified().await;
                Ok(serde_json::json!("dep-done"))
            }
        }

        struct SameBaseKeyTask {
            key: Arc<str>,
            deps: Vec<Arc<dyn Task>>,
            concurrent: Arc<AtomicUsize>,
            max_concurrent: Arc<AtomicUsize>,
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Task for SameBaseKeyTask {
            fn type_name(&self) -> &str {
                "shared"
            }
            fn base_key(&self) -> Arc<str> {
                Arc::from("shared.base")
            }
            fn key(&self) -> Arc<str> {
                Arc::clone(&self.key)
            }
            fn version(&self) -> ModuleVersion {
                version()
            }
            fn dependencies(&self) -> Vec<Arc<dyn Task>> {
                self.deps.clone()
            }
            async fn process(
                &self,
                _dependency_results: BTreeMap<Arc<str>, TaskResult>,
            ) -> Result<serde_json::Value, OrchestratorError> {
                let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_concurrent.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                self.log.lock().unwrap().push(self.key.to_string());
                Ok(serde_json::json!(self.key.to_string()))
            }
        }

        let gate = Arc::new(tokio::sync::Notify::new());
        let dep: Arc<dyn Task> = Arc::new(BlockedDep { gate: Arc::clone(&gate) });

        let a1: Arc<dyn Task> = Arc::new(SameBaseKeyTask {
            key: Arc::from("shared.a1"),
            deps: vec![Arc::clone(&dep)],
            concurrent: Arc::clone(&concurrent),
            max_concurrent: Arc::clone(&max_concurrent),
            log: Arc::clone(&log),
        });
        let a2: Arc<dyn Task> = Arc::new(SameBaseKeyTask {
            key: Arc::from("shared.a2"),
            deps: vec![],
            concurrent: Arc::clone(&concurrent),
            max_concurrent: Arc::clone(&max_concurrent),
            log: Arc::clone(&log),
        });

        let graph = TaskGraph::new(8, EventBus::new());
        let a1_handle = tokio::spawn({
            let graph = graph.clone();
            async move { graph.process(vec![a1]).await }
        });
        // Give A1 time to register (still blocked on its dependency) before
        // A2 — itself a root — is submitted.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let a2_handle = tokio::spawn({
            let graph = graph.clone();
            async move { graph.process(vec![a2]).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();

        a1_handle.await.unwrap().unwrap();
        a2_handle.await.unwrap().unwrap();

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "same-baseKey tasks ran concurrently");
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn global_concurrency_ceiling_is_respected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        struct TrackedTask {
            name: &'static str,
            counter: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Task for TrackedTask {
            fn type_name(&self) -> &str {
                "tracked"
            }
            fn base_key(&self) -> Arc<str> {
                Arc::from(format!("tracked.{}", self.name))
            }
            fn key(&self) -> Arc<str> {
                self.base_key()
            }
            fn version(&self) -> ModuleVersion {
                version()
            }
            async fn process(
                &self,
                _dependency_results: BTreeMap<Arc<str>, TaskResult>,
            ) -> Result<serde_json::Value, OrchestratorError> {
                let current = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.counter.fetch_sub(1, Ordering::SeqCst);
                self.log.lock().unwrap().push(self.name.to_string());
                Ok(serde_json::json!(self.name))
            }
        }

        let tasks: Vec<Arc<dyn Task>> = (0..6)
            .map(|i| {
                Arc::new(TrackedTask {
                    name: Box::leak(format!("t{i}").into_boxed_str()),
                    counter: Arc::clone(&counter),
                    max_seen: Arc::clone(&max_seen),
                    log: Arc::clone(&log),
                }) as Arc<dyn Task>
            })
            .collect();

        let graph = TaskGraph::new(2, EventBus::new());
        graph.process(tasks).await.unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(log.lock().unwrap().len(), 6);
    }
}
