//! End-to-end coverage across ConfigGraph, VersionResolver, ProviderRegistry,
//! ActionDispatcher and the TaskGraph scheduler working together, mirroring
//! the literal scenarios a caller drives this core through.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::config::model::{BuildSpec, Module, ServiceConfig, TaskConfig};
use orchestrator_core::{
    ConfigGraph, DependencyRef, EventBus, ModuleVersion, NodeKind, OrchestratorError,
    ProviderRegistry, SchedulerEvent, Task, TaskGraph, TaskResult,
};

fn module(name: &str, services: Vec<ServiceConfig>, tasks: Vec<TaskConfig>) -> Module {
    Module {
        name: name.into(),
        module_type: "service".into(),
        path: std::path::PathBuf::from(format!("/proj/{name}")),
        description: None,
        repository_url: None,
        allow_publish: false,
        build: BuildSpec::default(),
        services,
        tasks,
        tests: Vec::new(),
        spec: serde_json::Value::Null,
        outputs: Default::default(),
    }
}

#[test]
fn config_graph_wires_service_dependencies_across_modules() {
    let db = module("db", vec![ServiceConfig { name: "db".into(), source_module: None, dependencies: vec![], spec: serde_json::Value::Null }], vec![]);
    let api = module(
        "api",
        vec![ServiceConfig {
            name: "api".into(),
            source_module: None,
            dependencies: vec![DependencyRef::Service { name: "db".into() }],
            spec: serde_json::Value::Null,
        }],
        vec![],
    );

    let graph = ConfigGraph::build(&[db, api]).expect("acyclic, fully-resolved graph");

    let api_node = orchestrator_core::NodeId::new(NodeKind::Service, "api");
    let deps = graph.get_dependencies(&api_node, true);
    assert!(deps.iter().any(|n| n.name.as_ref() == "db"));
}

#[test]
fn circular_service_dependency_is_rejected() {
    let a = module(
        "a",
        vec![ServiceConfig { name: "a".into(), source_module: None, dependencies: vec![DependencyRef::Service { name: "b".into() }], spec: serde_json::Value::Null }],
        vec![],
    );
    let b = module(
        "b",
        vec![ServiceConfig { name: "b".into(), source_module: None, dependencies: vec![DependencyRef::Service { name: "a".into() }], spec: serde_json::Value::Null }],
        vec![],
    );

    let err = ConfigGraph::build(&[a, b]).unwrap_err();
    assert!(matches!(err, orchestrator_core::error::ConfigError::Cycle(_)));
}

struct BuildTask {
    name: &'static str,
    deps: Vec<Arc<dyn Task>>,
}

#[async_trait]
impl Task for BuildTask {
    fn type_name(&self) -> &str {
        "build"
    }
    fn base_key(&self) -> Arc<str> {
        Arc::from(format!("build.{}", self.name))
    }
    fn key(&self) -> Arc<str> {
        self.base_key()
    }
    fn version(&self) -> ModuleVersion {
        ModuleVersion { version_string: "v1".into(), dirty_timestamp: None, dependency_versions: BTreeMap::new() }
    }
    fn dependencies(&self) -> Vec<Arc<dyn Task>> {
        self.deps.clone()
    }
    async fn process(&self, _dependency_results: BTreeMap<Arc<str>, TaskResult>) -> Result<serde_json::Value, OrchestratorError> {
        Ok(serde_json::json!({ "built": self.name }))
    }
}

#[tokio::test]
async fn scheduler_emits_a_full_lifecycle_for_a_linear_chain() {
    let events = EventBus::new();
    let graph = TaskGraph::new(4, events.clone());

    let db: Arc<dyn Task> = Arc::new(BuildTask { name: "db", deps: vec![] });
    let api: Arc<dyn Task> = Arc::new(BuildTask { name: "api", deps: vec![Arc::clone(&db)] });

    let results = graph.process(vec![api]).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].output, Some(serde_json::json!({ "built": "api" })));

    let kinds: Vec<_> = events
        .events()
        .into_iter()
        .map(|e| match e.event {
            SchedulerEvent::TaskPending { .. } => "pending",
            SchedulerEvent::TaskProcessing { .. } => "processing",
            SchedulerEvent::TaskComplete { .. } => "complete",
            SchedulerEvent::TaskError { .. } => "error",
            SchedulerEvent::TaskGraphProcessing { .. } => "graph_start",
            SchedulerEvent::TaskGraphComplete { .. } => "graph_end",
        })
        .collect();
    assert!(kinds.contains(&"graph_start"));
    assert!(kinds.contains(&"graph_end"));
    assert!(kinds.iter().filter(|k| **k == "complete").count() >= 2);
}

struct EchoingFactory;
impl orchestrator_core::PluginFactory for EchoingFactory {
    fn create(&self, _project_name: &str) -> Result<orchestrator_core::PluginDescriptor, String> {
        let mut module_actions: BTreeMap<String, BTreeMap<String, orchestrator_core::provider::HandlerFn>> = BTreeMap::new();
        let mut build_actions: BTreeMap<String, orchestrator_core::provider::HandlerFn> = BTreeMap::new();
        build_actions.insert("build".to_string(), Arc::new(|_ctx, input| Box::pin(async move { Ok(input) })));
        module_actions.insert("service".to_string(), build_actions);
        Ok(orchestrator_core::PluginDescriptor { module_actions, ..Default::default() })
    }
}

#[tokio::test]
async fn dispatcher_routes_module_actions_through_the_registered_plugin() {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_plugin("exec", &EchoingFactory, "proj", serde_json::Value::Null).unwrap();
    let dispatcher = orchestrator_core::ActionDispatcher::new(registry);

    let out = dispatcher
        .dispatch_module_action("build", "service", None, serde_json::json!({"cmd": "cargo build"}), None)
        .await
        .unwrap();
    assert_eq!(out, serde_json::json!({"cmd": "cargo build"}));
}
