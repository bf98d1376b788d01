//! The `Task` contract and the scheduler's internal result/node records
//! (§3 TaskNode/TaskResult, §4.7).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::model::ModuleVersion;
use crate::error::OrchestratorError;

/// A unit of work the scheduler can run. Implementors describe their own
/// identity (`base_key`/`key`), declare their prerequisites up front via
/// `dependencies()`, and do the actual work in `process`.
#[async_trait]
pub trait Task: Send + Sync {
    /// The task family this instance belongs to (e.g. `"build"`,
    /// `"deployService"`) — used for per-type concurrency ceilings.
    fn type_name(&self) -> &str;

    /// `type.name` — identifies *what* this task targets, independent of
    /// its parameters.
    fn base_key(&self) -> Arc<str>;

    /// `baseKey.paramsHash8` — identifies this specific invocation.
    /// Two `Task`s with equal `key()` are treated as the same work.
    fn key(&self) -> Arc<str>;

    fn version(&self) -> ModuleVersion;

    /// When true, bypasses the result cache for this node.
    fn force(&self) -> bool {
        false
    }

    /// Per-type concurrency ceiling, if any.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }

    /// This task's prerequisites. Must be deterministic for a given
    /// `key()` — the scheduler memoises the resulting dependency set.
    fn dependencies(&self) -> Vec<Arc<dyn Task>> {
        Vec::new()
    }

    fn description(&self) -> String {
        self.key().to_string()
    }

    async fn process(
        &self,
        dependency_results: BTreeMap<Arc<str>, TaskResult>,
    ) -> Result<Value, OrchestratorError>;
}

/// The outcome of one `key`'s execution (or cache hit), as handed back to
/// callers and folded into a dependant's `dependency_results`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub base_key: Arc<str>,
    pub key: Arc<str>,
    pub id: u64,
    pub description: String,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub dependency_results: BTreeMap<Arc<str>, TaskResult>,
}

/// Scheduler-internal wrapper around a submitted `Task` (§3 TaskNode).
pub(crate) struct Node {
    pub id: u64,
    pub task: Arc<dyn Task>,
    pub base_key: Arc<str>,
    pub key: Arc<str>,
    pub type_name: Arc<str>,
    pub version: ModuleVersion,
    pub force: bool,
    pub concurrency_limit: Option<usize>,
    /// Keys this node is still waiting on. Shrinks as dependencies
    /// complete; the node is a root once this is empty.
    pub dependency_keys: Vec<Arc<str>>,
    /// Keys waiting on this node, for the completion/cancellation fan-out.
    pub dependants: Vec<Arc<str>>,
    /// Type of the task that caused this node to be added — used only for
    /// the same-type concurrency-ceiling exception (§4.7).
    pub parent_type: Option<Arc<str>>,
    pub started_at_ms: Option<u64>,
}
