//! ConfigContext (§4.2): the lazy, heterogeneous tree the template engine
//! resolves paths against.
//!
//! Modelled per the design notes as a capability: a node's `get` returns
//! either a primitive, a nested context to keep walking, or a lazy callable
//! to invoke before continuing. Layers (`ProjectContext` → `ProviderContext`
//! → `ModuleContext`) delegate to their parent for keys they don't own,
//! rather than copying data down.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    String(String),
    Number(f64),
    Bool(bool),
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Primitive::String(s) => write!(f, "{s}"),
            Primitive::Number(n) => write!(f, "{n}"),
            Primitive::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// What `ContextNode::get` (or a `LazyCallable::call`) hands back for one
/// path segment.
pub enum Resolved {
    Primitive(Primitive),
    Context(Arc<dyn ContextNode>),
    Lazy(Arc<dyn LazyCallable>),
}

impl Resolved {
    pub fn string(s: impl Into<String>) -> Self {
        Resolved::Primitive(Primitive::String(s.into()))
    }

    pub fn number(n: f64) -> Self {
        Resolved::Primitive(Primitive::Number(n))
    }

    pub fn bool(b: bool) -> Self {
        Resolved::Primitive(Primitive::Bool(b))
    }
}

/// A node in the ConfigContext tree.
pub trait ContextNode: Send + Sync {
    /// Look up one path segment. Keys beginning with `_` are private and
    /// must resolve to `None` regardless of whether they're otherwise held.
    fn get(&self, key: &str) -> Option<Resolved>;
}

/// A value that must be invoked to produce its `Resolved` — e.g. a
/// provider's `getOutputs`, or a service's lazily-computed outputs map.
pub trait LazyCallable: Send + Sync {
    fn call(&self) -> Result<Resolved, TemplateError>;
}

fn is_private(key: &str) -> bool {
    key.starts_with('_')
}

/// A plain, in-memory branch of the context tree — the composition
/// primitive the layered contexts below are built from.
#[derive(Default)]
pub struct MapNode {
    entries: BTreeMap<String, ResolvedSlot>,
}

enum ResolvedSlot {
    String(String),
    Number(f64),
    Bool(bool),
    Context(Arc<dyn ContextNode>),
    Lazy(Arc<dyn LazyCallable>),
}

impl MapNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), ResolvedSlot::String(value.into()));
        self
    }

    pub fn with_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.entries.insert(key.into(), ResolvedSlot::Bool(value));
        self
    }

    pub fn with_number(mut self, key: impl Into<String>, value: f64) -> Self {
        self.entries.insert(key.into(), ResolvedSlot::Number(value));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Arc<dyn ContextNode>) -> Self {
        self.entries.insert(key.into(), ResolvedSlot::Context(value));
        self
    }

    pub fn with_lazy(mut self, key: impl Into<String>, value: Arc<dyn LazyCallable>) -> Self {
        self.entries.insert(key.into(), ResolvedSlot::Lazy(value));
        self
    }
}

impl ContextNode for MapNode {
    fn get(&self, key: &str) -> Option<Resolved> {
        if is_private(key) {
            return None;
        }
        self.entries.get(key).map(|slot| match slot {
            ResolvedSlot::String(s) => Resolved::string(s.clone()),
            ResolvedSlot::Number(n) => Resolved::number(*n),
            ResolvedSlot::Bool(b) => Resolved::bool(*b),
            ResolvedSlot::Context(c) => Resolved::Context(Arc::clone(c)),
            ResolvedSlot::Lazy(l) => Resolved::Lazy(Arc::clone(l)),
        })
    }
}

/// A node that owns its keys but falls back to `parent` for anything it
/// doesn't recognise — the "extends" relationship from §4.2.
pub struct LayeredNode {
    own: MapNode,
    parent: Arc<dyn ContextNode>,
}

impl LayeredNode {
    pub fn new(own: MapNode, parent: Arc<dyn ContextNode>) -> Self {
        Self { own, parent }
    }
}

impl ContextNode for LayeredNode {
    fn get(&self, key: &str) -> Option<Resolved> {
        if is_private(key) {
            return None;
        }
        self.own.get(key).or_else(|| self.parent.get(key))
    }
}

/// Convert a `serde_json::Value` leaf into a `Resolved`, for merged
/// project/environment `variables`. Non-scalar values are dropped — a
/// reference into them later fails with `KeyNotFoundError` rather than
/// `NonPrimitive`, since the key itself isn't exposed.
pub fn json_scalar_to_resolved(value: &serde_json::Value) -> Option<Resolved> {
    match value {
        serde_json::Value::String(s) => Some(Resolved::string(s.clone())),
        serde_json::Value::Bool(b) => Some(Resolved::bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(Resolved::number),
        _ => None,
    }
}

/// `ProjectContext`: exposes `local.env` (process environment) and
/// `local.platform`.
pub struct ProjectContext {
    root: Arc<MapNode>,
}

impl ProjectContext {
    pub fn new() -> Self {
        let env_node: Arc<dyn ContextNode> = Arc::new(EnvNode);
        let local = MapNode::new()
            .with_context("env", env_node)
            .with_string("platform", std::env::consts::OS);
        let root = MapNode::new().with_context("local", Arc::new(local));
        Self {
            root: Arc::new(root),
        }
    }

    pub fn as_node(&self) -> Arc<dyn ContextNode> {
        Arc::clone(&self.root) as Arc<dyn ContextNode>
    }
}

impl Default for ProjectContext {
    fn default() -> Self {
        Self::new()
    }
}

struct EnvNode;

impl ContextNode for EnvNode {
    fn get(&self, key: &str) -> Option<Resolved> {
        if is_private(key) {
            return None;
        }
        std::env::var(key).ok().map(Resolved::string)
    }
}

/// `ProviderContext` (extends `ProjectContext`): adds `environment.name`,
/// `providers.<name>` (lazy), and merged `variables.*`.
pub struct ProviderContext {
    node: LayeredNode,
}

impl ProviderContext {
    pub fn new(
        parent: Arc<dyn ContextNode>,
        environment_name: impl Into<String>,
        providers: BTreeMap<String, Arc<dyn LazyCallable>>,
        variables: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let environment = MapNode::new().with_string("name", environment_name.into());

        let mut providers_node = MapNode::new();
        for (name, callable) in providers {
            providers_node = providers_node.with_lazy(name, callable);
        }

        let mut variables_node = MapNode::new();
        for (name, value) in &variables {
            match value {
                serde_json::Value::String(s) => {
                    variables_node = variables_node.with_string(name.clone(), s.clone());
                }
                serde_json::Value::Bool(b) => {
                    variables_node = variables_node.with_bool(name.clone(), *b);
                }
                serde_json::Value::Number(n) => {
                    if let Some(f) = n.as_f64() {
                        variables_node = variables_node.with_number(name.clone(), f);
                    }
                }
                _ => {}
            }
        }

        let own = MapNode::new()
            .with_context("environment", Arc::new(environment))
            .with_context("providers", Arc::new(providers_node))
            .with_context("variables", Arc::new(variables_node));

        Self {
            node: LayeredNode::new(own, parent),
        }
    }
}

impl ContextNode for ProviderContext {
    fn get(&self, key: &str) -> Option<Resolved> {
        self.node.get(key)
    }
}

/// One module's slice of `ModuleContext.modules.<name>`.
pub struct ModuleContextEntry {
    pub path: String,
    pub build_path: String,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub version: String,
    pub services: BTreeMap<String, Arc<dyn LazyCallable>>,
}

/// `ModuleContext` (extends `ProviderContext`): adds
/// `modules.<name>.{path, buildPath, outputs, version, services.<name>.outputs}`.
pub struct ModuleContext {
    node: LayeredNode,
}

impl ModuleContext {
    pub fn new(
        parent: Arc<dyn ContextNode>,
        modules: BTreeMap<String, ModuleContextEntry>,
    ) -> Self {
        let mut modules_node = MapNode::new();
        for (name, entry) in modules {
            let mut outputs_node = MapNode::new();
            for (k, v) in &entry.outputs {
                if let Some(r) = json_scalar_to_resolved(v) {
                    outputs_node = match r {
                        Resolved::Primitive(Primitive::String(s)) => outputs_node.with_string(k.clone(), s),
                        Resolved::Primitive(Primitive::Bool(b)) => outputs_node.with_bool(k.clone(), b),
                        Resolved::Primitive(Primitive::Number(n)) => outputs_node.with_number(k.clone(), n),
                        _ => outputs_node,
                    };
                }
            }

            let mut services_node = MapNode::new();
            for (svc_name, callable) in entry.services {
                let svc_entry = MapNode::new().with_lazy("outputs", callable);
                services_node = services_node.with_context(svc_name, Arc::new(svc_entry));
            }

            let module_node = MapNode::new()
                .with_string("path", entry.path)
                .with_string("buildPath", entry.build_path)
                .with_string("version", entry.version)
                .with_context("outputs", Arc::new(outputs_node))
                .with_context("services", Arc::new(services_node));

            modules_node = modules_node.with_context(name, Arc::new(module_node));
        }

        let own = MapNode::new().with_context("modules", Arc::new(modules_node));
        Self {
            node: LayeredNode::new(own, parent),
        }
    }
}

impl ContextNode for ModuleContext {
    fn get(&self, key: &str) -> Option<Resolved> {
        self.node.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_keys_are_never_visible() {
        let node = MapNode::new().with_string("_secret", "hidden");
        assert!(node.get("_secret").is_none());
    }

    #[test]
    fn project_context_exposes_platform() {
        let ctx = ProjectContext::new();
        let root = ctx.as_node();
        let local = root.get("local");
        assert!(matches!(local, Some(Resolved::Context(_))));
    }

    #[test]
    fn layered_node_falls_back_to_parent() {
        let parent: Arc<dyn ContextNode> = Arc::new(MapNode::new().with_string("a", "1"));
        let own = MapNode::new().with_string("b", "2");
        let layered = LayeredNode::new(own, parent);
        assert!(matches!(layered.get("b"), Some(Resolved::Primitive(Primitive::String(ref s))) if s == "2"));
        assert!(matches!(layered.get("a"), Some(Resolved::Primitive(Primitive::String(ref s))) if s == "1"));
        assert!(layered.get("c").is_none());
    }
}
