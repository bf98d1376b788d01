//! # orchestrator-core
//!
//! The execution core of a developer-workflow orchestrator: turning
//! declarative on-disk module configs into a validated dependency graph,
//! resolving module versions, dispatching provider actions, and scheduling
//! the resulting units of work with de-duplication, result caching, and
//! cascading cancellation.
//!
//! ## Architecture
//!
//! ```text
//! ConfigLoader -> ConfigContext/TemplateEngine -> ConfigGraph (validated, acyclic)
//!                                                       |
//!                                            callers derive task lists
//!                                                       v
//!                                                  TaskGraph (scheduler)
//!                                                       |
//!                                        each task's process() calls
//!                                                       v
//!                                    ActionDispatcher -> ProviderRegistry handlers
//!                                                       |
//!                                          results cached, emitted on EventBus
//! ```
//!
//! This crate is the core only: the CLI surface, the dashboard, TTY
//! rendering, and individual provider plugins (container, helm, kubernetes,
//! exec, ...) are external collaborators that consume the contracts here.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod provider;
pub mod scheduler;
pub mod telemetry;
pub mod template;
pub mod version;
pub mod watcher;

pub use config::{
    resolve_config_graph, BuildDependency, BuildSpec, ConfigLoader, CopySpec, DependencyRef,
    LoadedConfig, LocalConfigStore, LocalConfigStoreData, Module, ModuleVersion,
    NullSourceResolver, ProjectConfig, ProviderInstance, ServiceConfig, SourceRef, SourceResolver,
    TaskConfig, TestConfig,
};
pub use dispatch::ActionDispatcher;
pub use error::{OrchestratorError, Result};
pub use events::{EventBus, SchedulerEvent};
pub use graph::{ConfigGraph, NodeId, NodeKind};
pub use provider::{PluginContext, PluginDescriptor, PluginFactory, ProviderRegistry};
pub use scheduler::{Task, TaskGraph, TaskResult};
pub use telemetry::init_tracing;
pub use template::{context::ProjectContext, TemplateEngine};
pub use version::{FilesystemVersionSource, VersionResolver, VersionSource};
pub use watcher::{affected_modules, Debouncer, WatchSource};
