//! ConfigLoader (§4.1): scans a project root for declaration documents and
//! parses them into typed [`ProjectConfig`]/[`Module`] records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::config::local_store::LocalConfigStoreData;
use crate::config::model::{Module, ProjectConfig};
use crate::error::ConfigError;

/// Conventional filename scanned in every directory under the project root.
pub const CONFIG_FILENAME: &str = "orchestrator.yaml";

/// Filename holding VCS-style ignore patterns at the project root.
pub const IGNORE_FILENAME: &str = ".orchestratorignore";

/// Requests a local checkout of a remote source, honouring any
/// [`crate::config::local_store::LocalConfigStore`] link override.
///
/// Out of scope per the spec: only this contract is consumed here, the VCS
/// mechanics themselves live in an external collaborator.
pub trait SourceResolver: Send + Sync {
    fn ensure_remote_source(&self, repository_url: &str) -> Result<PathBuf, ConfigError>;
}

/// A `SourceResolver` that never resolves — used when no remote sources are
/// declared, so callers don't have to thread an `Option` everywhere.
#[derive(Default)]
pub struct NullSourceResolver;

impl SourceResolver for NullSourceResolver {
    fn ensure_remote_source(&self, repository_url: &str) -> Result<PathBuf, ConfigError> {
        Err(ConfigError::ParseError(format!(
            "no SourceResolver configured to fetch '{repository_url}'"
        )))
    }
}

enum RawDeclaration {
    Project(serde_yaml::Value),
    Module(serde_yaml::Value),
}

/// Normalize one document, in either the flat (`kind: Project|Module`) or
/// nested (`project:`/`module:`) wire shape, into its declarations.
///
/// `kind` is inspected directly on the parsed mapping rather than through an
/// untagged enum: an untagged `Nested` fallback with all-optional fields
/// would happily match a document carrying an unrecognised `kind` (every
/// field just defaults to `None`), silently discarding it instead of
/// reporting [`ConfigError::UnknownKind`].
fn normalize_value(value: serde_yaml::Value) -> Result<Vec<RawDeclaration>, ConfigError> {
    if matches!(value, serde_yaml::Value::Null) {
        return Ok(Vec::new());
    }
    let mapping = value
        .as_mapping()
        .ok_or_else(|| ConfigError::ParseError("expected a mapping at the document root".into()))?;

    if let Some(kind_value) = mapping.get(&serde_yaml::Value::String("kind".into())) {
        let kind = kind_value
            .as_str()
            .ok_or_else(|| ConfigError::UnknownKind(format!("{kind_value:?}")))?;
        return match kind {
            "Project" => Ok(vec![RawDeclaration::Project(value)]),
            "Module" => Ok(vec![RawDeclaration::Module(value)]),
            other => Err(ConfigError::UnknownKind(other.to_string())),
        };
    }

    let mut decls = Vec::with_capacity(2);
    if let Some(p) = mapping.get(&serde_yaml::Value::String("project".into())) {
        decls.push(RawDeclaration::Project(p.clone()));
    }
    if let Some(m) = mapping.get(&serde_yaml::Value::String("module".into())) {
        decls.push(RawDeclaration::Module(m.clone()));
    }
    Ok(decls)
}

/// Result of a full project scan: one project plus any number of modules.
pub struct LoadedConfig {
    pub project: ProjectConfig,
    pub modules: Vec<Module>,
}

pub struct ConfigLoader {
    source_resolver: Arc<dyn SourceResolver>,
    local_overrides: LocalConfigStoreData,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            source_resolver: Arc::new(NullSourceResolver),
            local_overrides: LocalConfigStoreData::default(),
        }
    }

    pub fn with_source_resolver(resolver: Arc<dyn SourceResolver>) -> Self {
        Self {
            source_resolver: resolver,
            local_overrides: LocalConfigStoreData::default(),
        }
    }

    /// Wire in a [`LocalConfigStore`](crate::config::local_store::LocalConfigStore)
    /// snapshot so `linkedModuleSources` overrides preempt a remote checkout
    /// for the modules they name.
    pub fn with_local_overrides(mut self, overrides: LocalConfigStoreData) -> Self {
        self.local_overrides = overrides;
        self
    }

    /// Scan `root` for [`CONFIG_FILENAME`] documents, honouring
    /// [`IGNORE_FILENAME`] patterns, and resolving `repositoryUrl` modules
    /// into local checkouts before continuing the scan inside them.
    #[instrument(skip(self))]
    pub fn load(&self, root: &Path) -> Result<LoadedConfig, ConfigError> {
        let ignore = load_ignore_patterns(root)?;
        let mut project: Option<(ProjectConfig, PathBuf)> = None;
        let mut modules: Vec<Module> = Vec::new();
        let mut seen_names: HashMap<Arc<str>, PathBuf> = HashMap::new();

        self.scan_dir(root, &ignore, &mut project, &mut modules, &mut seen_names)?;

        let (project, _) = project.ok_or_else(|| {
            ConfigError::ParseError("no Project declaration found under project root".into())
        })?;

        Ok(LoadedConfig { project, modules })
    }

    fn scan_dir(
        &self,
        dir: &Path,
        ignore: &[glob::Pattern],
        project: &mut Option<(ProjectConfig, PathBuf)>,
        modules: &mut Vec<Module>,
        seen_names: &mut HashMap<Arc<str>, PathBuf>,
    ) -> Result<(), ConfigError> {
        for entry in WalkDir::new(dir)
            .into_iter()
            .filter_entry(|e| !is_ignored(e.path(), dir, ignore))
        {
            let entry = entry.map_err(|e| ConfigError::ParseError(e.to_string()))?;
            if entry.file_name() != CONFIG_FILENAME {
                continue;
            }
            let file_dir = entry.path().parent().unwrap_or(dir).to_path_buf();
            self.load_file(entry.path(), &file_dir, project, modules, seen_names)?;
        }
        Ok(())
    }

    fn load_file(
        &self,
        path: &Path,
        dir: &Path,
        project: &mut Option<(ProjectConfig, PathBuf)>,
        modules: &mut Vec<Module>,
        seen_names: &mut HashMap<Arc<str>, PathBuf>,
    ) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

        for raw_doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(raw_doc)
                .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
            for decl in normalize_value(value)? {
                match decl {
                    RawDeclaration::Project(value) => {
                        let parsed: ProjectConfig = serde_yaml::from_value(value)
                            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                        if let Some((_, existing_path)) = project {
                            return Err(ConfigError::DuplicateProject(
                                existing_path.display().to_string(),
                                path.display().to_string(),
                            ));
                        }
                        *project = Some((parsed, path.to_path_buf()));
                    }
                    RawDeclaration::Module(value) => {
                        let mut parsed: Module = serde_yaml::from_value(value)
                            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                        parsed.path = dir.to_path_buf();

                        if let Some(existing) = seen_names.get(&parsed.name) {
                            return Err(ConfigError::ModuleNameCollision(
                                parsed.name.to_string(),
                                existing.display().to_string(),
                                path.display().to_string(),
                            ));
                        }
                        seen_names.insert(Arc::clone(&parsed.name), path.to_path_buf());

                        if let Some(url) = parsed.repository_url.clone() {
                            let linked = self
                                .local_overrides
                                .linked_module_sources
                                .iter()
                                .find(|l| l.name.as_str() == parsed.name.as_ref());
                            let checkout = match linked {
                                Some(link) => {
                                    debug!(
                                        module = %parsed.name,
                                        path = %link.local_path.display(),
                                        "using linked local source override"
                                    );
                                    link.local_path.clone()
                                }
                                None => {
                                    let checkout = self.source_resolver.ensure_remote_source(&url)?;
                                    debug!(module = %parsed.name, %url, path = %checkout.display(), "resolved remote source");
                                    checkout
                                }
                            };
                            let ignore = load_ignore_patterns(&checkout)?;
                            self.scan_dir(&checkout, &ignore, project, modules, seen_names)?;
                        }

                        modules.push(parsed);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_ignore_patterns(root: &Path) -> Result<Vec<glob::Pattern>, ConfigError> {
    let ignore_path = root.join(IGNORE_FILENAME);
    if !ignore_path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&ignore_path)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", ignore_path.display())))?;
    let mut patterns = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match glob::Pattern::new(line) {
            Ok(p) => patterns.push(p),
            Err(e) => warn!(pattern = line, error = %e, "skipping invalid ignore pattern"),
        }
    }
    Ok(patterns)
}

fn is_ignored(path: &Path, root: &Path, patterns: &[glob::Pattern]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    patterns.iter().any(|p| p.matches_path(relative))
}
