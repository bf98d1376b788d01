//! ActionDispatcher (§4.6): typed invocation of plugin handlers with
//! schema-validated input/output and default-handler fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::{NoHandlerError, OrchestratorError, PluginError};
use crate::provider::{HandlerFn, PluginContext, ProviderRegistry};

#[derive(Default, Clone)]
struct ActionSchema {
    input: Option<Value>,
    output: Option<Value>,
}

/// Routes action invocations to the correct provider handler, validating
/// input/output against per-action schemas registered via
/// [`ActionDispatcher::register_schema`].
pub struct ActionDispatcher {
    registry: Arc<ProviderRegistry>,
    schemas: DashMap<String, ActionSchema>,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            schemas: DashMap::new(),
        }
    }

    /// Register the input/output JSON schemas an action's params and
    /// result must satisfy. Actions with no registered schema skip
    /// validation rather than failing closed.
    pub fn register_schema(&self, action_type: &str, input: Option<Value>, output: Option<Value>) {
        self.schemas.insert(action_type.to_string(), ActionSchema { input, output });
    }

    /// Plugin-level action (`getEnvironmentStatus`, `prepareEnvironment`,
    /// `getSecret`, ...): selected by `(actionType, pluginName)`.
    #[instrument(skip(self, input, default_handler), fields(action_type))]
    pub async fn dispatch_plugin_action(
        &self,
        action_type: &str,
        plugin_name: Option<&str>,
        input: Value,
        default_handler: Option<HandlerFn>,
    ) -> Result<Value, OrchestratorError> {
        let resolved = self
            .registry
            .plugin_handler(action_type, plugin_name)
            .or_else(|| default_handler.map(|h| (Arc::from("default"), h)));

        self.invoke(action_type, plugin_name, resolved, input).await
    }

    /// Module-level action (`build`, `configure`, `runModule`, ...):
    /// selected by `(actionType, moduleType, pluginName?)`.
    #[instrument(skip(self, input, default_handler), fields(action_type, module_type))]
    pub async fn dispatch_module_action(
        &self,
        action_type: &str,
        module_type: &str,
        plugin_name: Option<&str>,
        input: Value,
        default_handler: Option<HandlerFn>,
    ) -> Result<Value, OrchestratorError> {
        let resolved = self
            .registry
            .module_handler(action_type, module_type, plugin_name)
            .or_else(|| self.registry.builtin_module_fallback(action_type))
            .or_else(|| default_handler.map(|h| (Arc::from("default"), h)));

        self.invoke(action_type, plugin_name, resolved, input).await
    }

    /// Service/task action (`deployService`, `runTask`, ...): the caller
    /// derives `moduleType` from the service/task's owning module, so this
    /// is a thin alias over module-action dispatch (§4.6).
    pub async fn dispatch_service_task_action(
        &self,
        action_type: &str,
        owning_module_type: &str,
        plugin_name: Option<&str>,
        input: Value,
        default_handler: Option<HandlerFn>,
    ) -> Result<Value, OrchestratorError> {
        self.dispatch_module_action(action_type, owning_module_type, plugin_name, input, default_handler)
            .await
    }

    /// Fan out a pluginless call (e.g. `getEnvironmentStatus`) over every
    /// plugin providing `action_type`, keyed by plugin name.
    pub async fn dispatch_aggregate(
        &self,
        action_type: &str,
        input: Value,
    ) -> Result<BTreeMap<String, Value>, OrchestratorError> {
        let handlers = self.registry.plugin_handlers_for(action_type);
        let mut out = BTreeMap::new();
        for (name, handler) in handlers {
            let ctx = PluginContext { plugin_name: Arc::clone(&name) };
            let result = handler(ctx, input.clone()).await?;
            out.insert(name.to_string(), result);
        }
        Ok(out)
    }

    async fn invoke(
        &self,
        action_type: &str,
        requested_plugin: Option<&str>,
        resolved: Option<(Arc<str>, HandlerFn)>,
        input: Value,
    ) -> Result<Value, OrchestratorError> {
        let (plugin_name, handler) = resolved.ok_or_else(|| NoHandlerError {
            action: action_type.to_string(),
            plugin: requested_plugin.map(String::from),
        })?;

        if let Some(schema) = self.schemas.get(action_type).and_then(|s| s.input.clone()) {
            crate::provider::validate_json(&schema, &input).map_err(|(path, message)| {
                PluginError::InputValidation {
                    plugin: plugin_name.to_string(),
                    path,
                    message,
                }
            })?;
        }

        let ctx = PluginContext { plugin_name: Arc::clone(&plugin_name) };
        let output = handler(ctx, input).await?;

        if let Some(schema) = self.schemas.get(action_type).and_then(|s| s.output.clone()) {
            crate::provider::validate_json(&schema, &output).map_err(|(path, message)| {
                warn!(plugin = %plugin_name, path, "handler output failed schema validation");
                PluginError::OutputValidation {
                    plugin: plugin_name.to_string(),
                    path,
                    message,
                }
            })?;
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{PluginDescriptor, PluginFactory};

    struct EchoFactory;
    impl PluginFactory for EchoFactory {
        fn create(&self, _project_name: &str) -> Result<PluginDescriptor, String> {
            let mut actions: BTreeMap<String, HandlerFn> = BTreeMap::new();
            actions.insert(
                "prepareEnvironment".to_string(),
                Arc::new(|_ctx, input| Box::pin(async move { Ok(input) })),
            );
            Ok(PluginDescriptor { actions, ..Default::default() })
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_plugin_action() {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register_plugin("aws", &EchoFactory, "proj", Value::Null)
            .unwrap();
        let dispatcher = ActionDispatcher::new(registry);

        let out = dispatcher
            .dispatch_plugin_action("prepareEnvironment", None, serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn missing_handler_without_default_is_an_error() {
        let registry = Arc::new(ProviderRegistry::new());
        let dispatcher = ActionDispatcher::new(registry);

        let err = dispatcher
            .dispatch_plugin_action("noSuchAction", None, Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoHandler(_)));
    }

    #[tokio::test]
    async fn missing_handler_falls_back_to_caller_supplied_default() {
        let registry = Arc::new(ProviderRegistry::new());
        let dispatcher = ActionDispatcher::new(registry);

        let default: HandlerFn = Arc::new(|_ctx, _input| Box::pin(async { Ok(serde_json::json!({"fallback": true})) }));
        let out = dispatcher
            .dispatch_plugin_action("noSuchAction", None, Value::Null, Some(default))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"fallback": true}));
    }

    #[tokio::test]
    async fn input_failing_schema_is_rejected_before_invocation() {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register_plugin("aws", &EchoFactory, "proj", Value::Null)
            .unwrap();
        let dispatcher = ActionDispatcher::new(registry);
        dispatcher.register_schema(
            "prepareEnvironment",
            Some(serde_json::json!({"type": "object", "required": ["region"]})),
            None,
        );

        let err = dispatcher
            .dispatch_plugin_action("prepareEnvironment", None, serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Plugin(PluginError::InputValidation { .. })));
    }

    #[tokio::test]
    async fn builtin_defaults_answer_module_action_dispatch_with_no_handler_registered() {
        let registry = Arc::new(ProviderRegistry::new());
        let dispatcher = ActionDispatcher::new(registry);

        let out = dispatcher
            .dispatch_module_action("publishModule", "service", None, Value::Null, None)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"published": false}));
    }

    #[tokio::test]
    async fn aggregate_fans_out_over_every_plugin() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_plugin("aws", &EchoFactory, "proj", Value::Null).unwrap();
        registry.register_plugin("gcp", &EchoFactory, "proj", Value::Null).unwrap();
        let dispatcher = ActionDispatcher::new(registry);

        let out = dispatcher
            .dispatch_aggregate("prepareEnvironment", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("aws"));
        assert!(out.contains_key("gcp"));
    }
}
