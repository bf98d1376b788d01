//! ProviderRegistry (§4.5): loads plugin factories, validates their
//! descriptors and configs, and maintains the action-handler dispatch
//! tables that [`crate::dispatch::ActionDispatcher`] reads from.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::model::ProviderInstance;
use crate::error::{OrchestratorError, PluginError};

/// A plugin action handler: takes the invocation context and validated
/// input, returns a (not-yet-output-validated) JSON value.
pub type HandlerFn =
    Arc<dyn Fn(PluginContext, Value) -> BoxFuture<'static, Result<Value, OrchestratorError>> + Send + Sync>;

/// Injected into every handler invocation (§4.6): which plugin is handling
/// the call, under what name it was registered.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_name: Arc<str>,
}

/// What a plugin factory hands back (§6 Plugin interface).
#[derive(Default)]
pub struct PluginDescriptor {
    pub config_schema: Option<Value>,
    pub dependencies: Vec<String>,
    pub modules: Vec<String>,
    pub actions: BTreeMap<String, HandlerFn>,
    pub module_actions: BTreeMap<String, BTreeMap<String, HandlerFn>>,
}

/// `(projectName, log) → PluginDescriptor` (§6). `log` is the ambient
/// `tracing` span the caller is already inside; factories don't take one
/// explicitly here — they just emit `tracing` events like everything else.
pub trait PluginFactory: Send + Sync {
    fn create(&self, project_name: &str) -> Result<PluginDescriptor, String>;
}

const BUILTIN_DEFAULTS: &str = "__builtin_defaults__";

/// Owns every loaded plugin's merged config and its installed handlers.
/// Frozen (stop installing new plugins) before scheduling begins, per §5 —
/// enforced by convention here, not by a type-level lock, since reads and
/// writes both go through the same `DashMap`.
pub struct ProviderRegistry {
    plugin_actions: DashMap<String, Vec<(Arc<str>, HandlerFn)>>,
    module_actions: DashMap<(String, String), Vec<(Arc<str>, HandlerFn)>>,
    configs: DashMap<String, Value>,
    instances: DashMap<String, ProviderInstance>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let registry = Self {
            plugin_actions: DashMap::new(),
            module_actions: DashMap::new(),
            configs: DashMap::new(),
            instances: DashMap::new(),
        };
        registry.seed_defaults();
        registry
    }

    fn seed_defaults(&self) {
        self.install_plugin_action(
            "publishModule",
            BUILTIN_DEFAULTS,
            Arc::new(|_ctx, _input| Box::pin(async { Ok(serde_json::json!({"published": false})) })),
        );
        self.install_plugin_action(
            "pushModule",
            BUILTIN_DEFAULTS,
            Arc::new(|_ctx, _input| Box::pin(async { Ok(serde_json::json!({"pushed": false})) })),
        );
        self.install_plugin_action(
            "getTestResult",
            BUILTIN_DEFAULTS,
            Arc::new(|_ctx, _input| Box::pin(async { Ok(Value::Null) })),
        );
        self.install_plugin_action(
            "getBuildStatus",
            BUILTIN_DEFAULTS,
            Arc::new(|_ctx, _input| Box::pin(async { Ok(Value::Null) })),
        );
    }

    /// Load and install a plugin (§4.5 steps 1-5).
    #[instrument(skip(self, factory, declared_config), fields(plugin = %name))]
    pub fn register_plugin(
        &self,
        name: &str,
        factory: &dyn PluginFactory,
        project_name: &str,
        declared_config: Value,
    ) -> Result<(), PluginError> {
        let descriptor = factory
            .create(project_name)
            .map_err(|e| PluginError::FactoryFailed(name.to_string(), e))?;

        if let Some(schema) = &descriptor.config_schema {
            compile_schema(schema)
                .map_err(|e| PluginError::InvalidDescriptor(name.to_string(), e))?;
        }

        let existing = self.configs.get(name).map(|v| v.clone());
        let merged = merge_config(existing, declared_config);

        if let Some(schema) = &descriptor.config_schema {
            validate_json(schema, &merged)
                .map_err(|(path, message)| PluginError::ConfigValidation {
                    plugin: name.to_string(),
                    path,
                    message,
                })?;
        }

        self.configs.insert(name.to_string(), merged.clone());
        self.instances.insert(
            name.to_string(),
            ProviderInstance {
                name: Arc::from(name),
                dependencies: descriptor.dependencies.iter().map(|d| Arc::from(d.as_str())).collect(),
                config: merged,
                outputs: Default::default(),
            },
        );

        for (action_type, handler) in descriptor.actions {
            debug!(action_type, "installing plugin action");
            self.install_plugin_action(&action_type, name, handler);
        }
        for (module_type, actions) in descriptor.module_actions {
            for (action_type, handler) in actions {
                debug!(action_type, module_type, "installing module action");
                self.install_module_action(&action_type, &module_type, name, handler);
            }
        }

        Ok(())
    }

    fn install_plugin_action(&self, action_type: &str, plugin: &str, handler: HandlerFn) {
        let mut entry = self.plugin_actions.entry(action_type.to_string()).or_default();
        entry.retain(|(n, _)| n.as_ref() != plugin);
        entry.push((Arc::from(plugin), handler));
    }

    fn install_module_action(&self, action_type: &str, module_type: &str, plugin: &str, handler: HandlerFn) {
        let key = (action_type.to_string(), module_type.to_string());
        let mut entry = self.module_actions.entry(key).or_default();
        entry.retain(|(n, _)| n.as_ref() != plugin);
        entry.push((Arc::from(plugin), handler));
    }

    /// Selects by `(actionType, pluginName)`; without a name, the
    /// last-registered handler wins (§4.6).
    pub fn plugin_handler(&self, action_type: &str, plugin_name: Option<&str>) -> Option<(Arc<str>, HandlerFn)> {
        let list = self.plugin_actions.get(action_type)?;
        match plugin_name {
            Some(name) => list.iter().find(|(n, _)| n.as_ref() == name).cloned(),
            None => list.last().cloned(),
        }
    }

    /// Selects by `(actionType, moduleType, pluginName?)`.
    pub fn module_handler(
        &self,
        action_type: &str,
        module_type: &str,
        plugin_name: Option<&str>,
    ) -> Option<(Arc<str>, HandlerFn)> {
        let key = (action_type.to_string(), module_type.to_string());
        let list = self.module_actions.get(&key)?;
        match plugin_name {
            Some(name) => list.iter().find(|(n, _)| n.as_ref() == name).cloned(),
            None => list.last().cloned(),
        }
    }

    /// Last resort for [`crate::dispatch::ActionDispatcher::dispatch_module_action`]:
    /// the builtin fallbacks (`publishModule`, `pushModule`, `getTestResult`,
    /// `getBuildStatus`) are module actions per §4.6 but are seeded once,
    /// under every module type, by registering them in `plugin_actions`
    /// under [`BUILTIN_DEFAULTS`] rather than once per module type (module
    /// types are open-ended, so there's no fixed set to register against).
    pub fn builtin_module_fallback(&self, action_type: &str) -> Option<(Arc<str>, HandlerFn)> {
        let list = self.plugin_actions.get(action_type)?;
        list.iter().find(|(n, _)| n.as_ref() == BUILTIN_DEFAULTS).cloned()
    }

    /// Every plugin currently providing `action_type`, registration order
    /// preserved — used for fan-out aggregate calls.
    pub fn plugin_handlers_for(&self, action_type: &str) -> Vec<(Arc<str>, HandlerFn)> {
        self.plugin_actions
            .get(action_type)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn provider_instance(&self, name: &str) -> Option<ProviderInstance> {
        self.instances.get(name).map(|r| r.clone())
    }

    pub fn plugin_count(&self) -> usize {
        self.instances.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-wins for scalars, recursive merge for objects, replace for arrays.
fn merge_config(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(overlay)) => {
            for (k, v) in overlay {
                let merged = merge_config(base.remove(&k), v);
                base.insert(k, merged);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

fn compile_schema(schema: &Value) -> Result<jsonschema::JSONSchema, String> {
    jsonschema::JSONSchema::compile(schema).map_err(|e| e.to_string())
}

/// Validate `value` against `schema`, returning the first violation's
/// fully-qualified path and message (§7: "fully qualified paths are
/// rendered with the exact dotted key that failed").
pub(crate) fn validate_json(schema: &Value, value: &Value) -> Result<(), (String, String)> {
    let compiled = compile_schema(schema).map_err(|e| (String::new(), e))?;
    if let Err(mut errors) = compiled.validate(value) {
        if let Some(first) = errors.next() {
            return Err((first.instance_path.to_string(), first.to_string()));
        }
    }
    Ok(())
}
