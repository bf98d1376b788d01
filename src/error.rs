//! Unified error taxonomy for the orchestrator core.
//!
//! Each subsystem owns its own `thiserror` enum; [`OrchestratorError`] wraps
//! them with `#[from]` so `?` composes across module boundaries. Errors that
//! carry a key path render it verbatim so callers don't have to re-derive it.

/// Implemented by every subsystem error to surface a short remediation hint.
///
/// Mirrors this codebase's existing error-presentation convention: the
/// message states what went wrong, the suggestion states what to do next.
pub trait FixSuggestion {
    fn suggestion(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    ParseError(String),

    #[error("unknown declaration kind '{0}'")]
    UnknownKind(String),

    #[error("multiple Project declarations found: {0} and {1}")]
    DuplicateProject(String, String),

    #[error("module name '{0}' declared more than once ({1} and {2})")]
    ModuleNameCollision(String, String, String),

    #[error("unknown dependency reference '{path}'")]
    UnknownReference { path: String },

    #[error("cycle detected in config graph: {0}")]
    Cycle(String),

    #[error("service and task names collide: '{0}'")]
    ServiceTaskNameCollision(String),

    #[error("name '{0}' is not globally unique")]
    DuplicateName(String),
}

impl FixSuggestion for ConfigError {
    fn suggestion(&self) -> Option<String> {
        match self {
            ConfigError::UnknownKind(k) => {
                Some(format!("'{k}' is not 'Project' or 'Module' — check the `kind:` field"))
            }
            ConfigError::ModuleNameCollision(name, ..) => {
                Some(format!("rename one of the modules declaring '{name}'"))
            }
            ConfigError::Cycle(path) => Some(format!("break the cycle at {path}")),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("key not found: {path}")]
    KeyNotFound { path: String },

    #[error("circular template reference: {0}")]
    CircularReference(String),

    #[error("template at '{path}' resolved to a non-primitive value")]
    NonPrimitive { path: String },
}

impl FixSuggestion for TemplateError {
    fn suggestion(&self) -> Option<String> {
        match self {
            TemplateError::KeyNotFound { path } => {
                Some(format!("no such key '{path}' in the config context — check for typos"))
            }
            TemplateError::CircularReference(cycle) => {
                Some(format!("remove one edge from the cycle {cycle}"))
            }
            TemplateError::NonPrimitive { path } => Some(format!(
                "'{path}' must resolve to a string, number, or boolean"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{name}'")]
pub struct ParameterError {
    pub kind: &'static str,
    pub name: String,
}

impl FixSuggestion for ParameterError {}

#[derive(Debug, thiserror::Error)]
#[error("no handler for action '{action}'{}", pluginish(.plugin))]
pub struct NoHandlerError {
    pub action: String,
    pub plugin: Option<String>,
}

fn pluginish(plugin: &Option<String>) -> String {
    plugin
        .as_ref()
        .map(|p| format!(" on plugin '{p}'"))
        .unwrap_or_default()
}

impl FixSuggestion for NoHandlerError {
    fn suggestion(&self) -> Option<String> {
        Some("register a plugin providing this action, or pass a defaultHandler".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin '{0}' factory failed: {1}")]
    FactoryFailed(String, String),

    #[error("plugin '{0}' descriptor rejected: {1}")]
    InvalidDescriptor(String, String),

    #[error("plugin '{plugin}' handler input failed validation at '{path}': {message}")]
    InputValidation {
        plugin: String,
        path: String,
        message: String,
    },

    #[error("plugin '{plugin}' handler output failed validation at '{path}': {message}")]
    OutputValidation {
        plugin: String,
        path: String,
        message: String,
    },

    #[error("plugin '{plugin}' config rejected at '{path}': {message}")]
    ConfigValidation {
        plugin: String,
        path: String,
        message: String,
    },
}

impl FixSuggestion for PluginError {}

#[derive(Debug, thiserror::Error)]
#[error("task '{base_key}' failed: {message}")]
pub struct TaskError {
    pub base_key: String,
    pub key: String,
    pub message: String,
}

impl FixSuggestion for TaskError {}

#[derive(Debug, thiserror::Error)]
#[error("task '{key}' timed out after {elapsed_ms}ms")]
pub struct TimeoutError {
    pub key: String,
    pub elapsed_ms: u64,
}

impl FixSuggestion for TimeoutError {}

#[derive(Debug, thiserror::Error)]
#[error("runtime prerequisite unmet: {0}")]
pub struct RuntimeError(pub String);

impl FixSuggestion for RuntimeError {}

/// Top-level error type returned by the orchestrator's public API.
///
/// One variant per taxonomy entry in the spec; each wraps its subsystem's
/// own error type via `#[from]` so call sites propagate with plain `?`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    NoHandler(#[from] NoHandlerError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FixSuggestion for OrchestratorError {
    fn suggestion(&self) -> Option<String> {
        match self {
            OrchestratorError::Config(e) => e.suggestion(),
            OrchestratorError::Template(e) => e.suggestion(),
            OrchestratorError::Parameter(e) => e.suggestion(),
            OrchestratorError::NoHandler(e) => e.suggestion(),
            OrchestratorError::Plugin(e) => e.suggestion(),
            OrchestratorError::Task(e) => e.suggestion(),
            OrchestratorError::Timeout(e) => e.suggestion(),
            OrchestratorError::Runtime(e) => e.suggestion(),
            OrchestratorError::Io(_) | OrchestratorError::Yaml(_) => None,
        }
    }
}

/// Render an error together with its suggestion, one per line.
pub fn format_error_with_suggestion(err: &(impl std::error::Error + FixSuggestion)) -> String {
    match err.suggestion() {
        Some(hint) => format!("{err}\n  hint: {hint}"),
        None => err.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
