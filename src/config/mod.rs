//! Configuration loading and the resolved data model (§3, §4.1, §6).

pub mod loader;
pub mod local_store;
pub mod model;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use loader::{ConfigLoader, LoadedConfig, NullSourceResolver, SourceResolver};
pub use local_store::{LocalConfigStore, LocalConfigStoreData};
pub use model::{
    BuildDependency, BuildSpec, CopySpec, DependencyRef, Module, ModuleVersion, ProjectConfig,
    ProviderInstance, ServiceConfig, SourceRef, TaskConfig, TestConfig,
};

use crate::error::OrchestratorError;
use crate::graph::ConfigGraph;
use crate::template::context::{ContextNode, ModuleContext, ModuleContextEntry, ProjectContext, ProviderContext};
use crate::template::TemplateEngine;

/// Compose a [`LoadedConfig`] into a validated [`ConfigGraph`] (§4.1 → §4.2 →
/// §4.3): build the `ProjectContext` → `ProviderContext` → `ModuleContext`
/// layers, resolve every module's templated fields against them, and only
/// then hand the fully-resolved modules to `ConfigGraph::build`.
///
/// Without this step a templated `spec.build.command` (or any other
/// templated field) reaches `ConfigGraph::build` as a raw `${...}` string —
/// the graph itself never looks at template expressions, so a cycle between
/// two modules' templates would otherwise go entirely undetected.
pub fn resolve_config_graph(loaded: &LoadedConfig) -> Result<ConfigGraph, OrchestratorError> {
    let project_ctx = ProjectContext::new();
    let provider_ctx = ProviderContext::new(
        project_ctx.as_node(),
        loaded.project.default_environment.clone().unwrap_or_default(),
        BTreeMap::new(),
        loaded.project.variables.clone(),
    );

    let mut module_entries = BTreeMap::new();
    for module in &loaded.modules {
        module_entries.insert(
            module.name.to_string(),
            ModuleContextEntry {
                path: module.path.display().to_string(),
                build_path: module.path.display().to_string(),
                outputs: module.outputs.clone(),
                version: String::new(),
                services: BTreeMap::new(),
            },
        );
    }
    let module_ctx = ModuleContext::new(Arc::new(provider_ctx) as Arc<dyn ContextNode>, module_entries);
    let root: &dyn ContextNode = &module_ctx;

    let mut resolved_modules = Vec::with_capacity(loaded.modules.len());
    for module in &loaded.modules {
        let mut resolved = module.clone();

        if let Some(command) = &module.build.command {
            resolved.build.command = Some(TemplateEngine::resolve_string(command, root)?);
        }
        resolved.spec = resolve_json_templates(&module.spec, root)?;

        for (src, dst) in module.services.iter().zip(resolved.services.iter_mut()) {
            dst.spec = resolve_json_templates(&src.spec, root)?;
        }
        for (src, dst) in module.tasks.iter().zip(resolved.tasks.iter_mut()) {
            dst.spec = resolve_json_templates(&src.spec, root)?;
        }
        for (src, dst) in module.tests.iter().zip(resolved.tests.iter_mut()) {
            dst.spec = resolve_json_templates(&src.spec, root)?;
        }

        resolved_modules.push(resolved);
    }

    Ok(ConfigGraph::build(&resolved_modules)?)
}

/// Recursively resolve `${...}` expressions in every string leaf of a JSON
/// value, leaving non-string leaves untouched.
fn resolve_json_templates(
    value: &serde_json::Value,
    ctx: &dyn ContextNode,
) -> Result<serde_json::Value, crate::error::TemplateError> {
    match value {
        serde_json::Value::String(s) => {
            Ok(serde_json::Value::String(TemplateEngine::resolve_string(s, ctx)?))
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_json_templates(item, ctx)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_json_templates(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::BuildSpec;
    use crate::error::TemplateError;
    use std::path::PathBuf;

    fn module(name: &str, command: Option<&str>, outputs: BTreeMap<String, serde_json::Value>) -> Module {
        Module {
            name: Arc::from(name),
            module_type: "service".into(),
            path: PathBuf::from(format!("/tmp/{name}")),
            description: None,
            repository_url: None,
            allow_publish: false,
            build: BuildSpec {
                command: command.map(String::from),
                dependencies: vec![],
            },
            services: vec![],
            tasks: vec![],
            tests: vec![],
            spec: serde_json::Value::Null,
            outputs,
        }
    }

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: Arc::from("demo"),
            default_environment: None,
            environment_defaults: BTreeMap::new(),
            environments: vec![],
            sources: vec![],
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn resolves_build_command_templates_before_graph_construction() {
        let mut outputs = BTreeMap::new();
        outputs.insert("url".to_string(), serde_json::json!("https://internal/api"));
        let api = module("api", Some("deploy ${modules.api.outputs.url}"), outputs);

        let loaded = LoadedConfig { project: project(), modules: vec![api] };
        let graph = resolve_config_graph(&loaded).unwrap();
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn circular_build_command_templates_across_modules_fail_graph_construction() {
        let mut a_outputs = BTreeMap::new();
        a_outputs.insert("ref".to_string(), serde_json::json!("${modules.b.outputs.ref}"));
        let mut b_outputs = BTreeMap::new();
        b_outputs.insert("ref".to_string(), serde_json::json!("${modules.a.outputs.ref}"));

        let a = module("a", Some("build ${modules.a.outputs.ref}"), a_outputs);
        let b = module("b", None, b_outputs);

        let loaded = LoadedConfig { project: project(), modules: vec![a, b] };
        let err = resolve_config_graph(&loaded).unwrap_err();
        match err {
            OrchestratorError::Template(TemplateError::CircularReference(cycle)) => {
                assert!(cycle.contains("modules.a.outputs.ref"));
                assert!(cycle.contains("modules.b.outputs.ref"));
            }
            other => panic!("expected a circular template reference, got {other:?}"),
        }
    }
}
