//! Typed records produced by [`super::loader::ConfigLoader`].
//!
//! These are the fully-resolved (post-template) shapes the rest of the
//! crate operates on; the raw, not-yet-resolved wire shapes live in
//! [`super::loader`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A build-time dependency on another module, with an optional file-copy spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDependency {
    pub name: Arc<str>,
    #[serde(default)]
    pub copy: Vec<CopySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySpec {
    pub source: String,
    pub destination: String,
}

/// A reference to a service or task that something depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DependencyRef {
    Service { name: Arc<str> },
    Task { name: Arc<str> },
}

impl DependencyRef {
    pub fn name(&self) -> &str {
        match self {
            DependencyRef::Service { name } | DependencyRef::Task { name } => name,
        }
    }
}

/// The unit of code and artifact (§3 Module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: Arc<str>,
    #[serde(rename = "type")]
    pub module_type: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub allow_publish: bool,
    #[serde(default)]
    pub build: BuildSpec,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub tests: Vec<TestConfig>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<BuildDependency>,
}

/// A long-running deployable defined by a module (§3 Service).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: Arc<str>,
    #[serde(default)]
    pub source_module: Option<Arc<str>>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A one-shot runnable defined by a module (§3 Task).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub name: Arc<str>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A module-scoped test suite (§3 TestConfig). Key is `<module>.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    pub name: Arc<str>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl TestConfig {
    pub fn key(&self, module: &str) -> String {
        format!("{module}.{}", self.name)
    }
}

/// `{versionString, dirtyTimestamp?, dependencyVersions}` (§3 ModuleVersion).
///
/// `versionString` must be identical for two modules with identical source
/// and identical dependency versions — see [`crate::version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub version_string: String,
    pub dirty_timestamp: Option<u64>,
    pub dependency_versions: BTreeMap<String, String>,
}

/// A project-level declaration (`kind: Project` or `project:`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: Arc<str>,
    #[serde(default)]
    pub default_environment: Option<String>,
    #[serde(default)]
    pub environment_defaults: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub name: String,
    #[serde(default)]
    pub repository_url: Option<String>,
}

/// A configured plugin instance (§3 Provider). `outputs` populate after
/// `prepareEnvironment`; see [`crate::provider::ProviderRegistry`].
#[derive(Debug, Clone, Default)]
pub struct ProviderInstance {
    pub name: Arc<str>,
    pub dependencies: Vec<Arc<str>>,
    pub config: serde_json::Value,
    pub outputs: BTreeMap<String, serde_json::Value>,
}
