//! VersionResolver (§4.4): combines a module's source-tree digest with its
//! build dependencies' versions into a stable, deterministic version string.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::config::model::{Module, ModuleVersion};
use crate::error::{ConfigError, OrchestratorError};

/// The VCS collaborator's contract (§1, §4.4): everything else about source
/// control is out of scope here.
pub trait VersionSource: Send + Sync {
    /// A digest over the module's tracked files, stable under reordering,
    /// plus the latest dirty (uncommitted-change) timestamp if any.
    fn tree_digest(&self, module: &Module) -> Result<TreeDigest, OrchestratorError>;
}

pub struct TreeDigest {
    pub hash: String,
    pub dirty_timestamp: Option<u64>,
}

/// A filesystem-only `VersionSource` for when no VCS collaborator is wired
/// in: hashes every regular file under the module's path. Never reports a
/// dirty timestamp (it has no notion of "uncommitted").
pub struct FilesystemVersionSource;

impl VersionSource for FilesystemVersionSource {
    fn tree_digest(&self, module: &Module) -> Result<TreeDigest, OrchestratorError> {
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        for entry in walkdir::WalkDir::new(&module.path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&module.path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let content = std::fs::read(entry.path())?;
            entries.push((relative, content));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (path, content) in &entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
            hasher.update([0u8]);
        }
        Ok(TreeDigest {
            hash: hex(&hasher.finalize()),
            dirty_timestamp: None,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct CacheEntry {
    version: ModuleVersion,
    invalidation_paths: Vec<PathBuf>,
}

/// Memoises `resolve` results per `(moduleName, sorted-dep-name-list)`,
/// invalidated by path prefix rather than by a global clear (§4.4).
pub struct VersionResolver {
    cache: DashMap<String, CacheEntry>,
}

impl VersionResolver {
    pub fn new() -> Self {
        Self { cache: DashMap::new() }
    }

    /// Resolve `module`'s version, recursing into its build dependencies
    /// via `modules`. A build-dependency cycle (which `ConfigGraph::build`
    /// should already have rejected) surfaces here too, defensively.
    pub fn resolve(
        &self,
        module: &Module,
        modules: &BTreeMap<Arc<str>, Module>,
        source: &dyn VersionSource,
    ) -> Result<ModuleVersion, OrchestratorError> {
        let mut stack = Vec::new();
        self.resolve_inner(module, modules, source, &mut stack)
    }

    fn resolve_inner(
        &self,
        module: &Module,
        modules: &BTreeMap<Arc<str>, Module>,
        source: &dyn VersionSource,
        stack: &mut Vec<Arc<str>>,
    ) -> Result<ModuleVersion, OrchestratorError> {
        if stack.contains(&module.name) {
            let mut cycle: Vec<String> = stack.iter().map(|n| n.to_string()).collect();
            cycle.push(module.name.to_string());
            return Err(ConfigError::Cycle(cycle.join(" → ")).into());
        }

        let mut dep_names: Vec<Arc<str>> =
            module.build.dependencies.iter().map(|d| Arc::clone(&d.name)).collect();
        dep_names.sort();

        let cache_key = format!(
            "{}::{}",
            module.name,
            dep_names.iter().map(|n| n.as_ref()).collect::<Vec<_>>().join(",")
        );
        if let Some(entry) = self.cache.get(&cache_key) {
            return Ok(entry.version.clone());
        }

        stack.push(Arc::clone(&module.name));

        let mut dep_versions = BTreeMap::new();
        let mut max_dirty: Option<u64> = None;
        let mut invalidation_paths = vec![module.path.clone()];

        for dep_name in &dep_names {
            let dep_module = modules.get(dep_name).ok_or_else(|| ConfigError::UnknownReference {
                path: format!("modules.{}.build.dependencies.{}", module.name, dep_name),
            })?;
            let dep_version = self.resolve_inner(dep_module, modules, source, stack)?;
            max_dirty = max_opt(max_dirty, dep_version.dirty_timestamp);
            dep_versions.insert(dep_name.to_string(), dep_version.version_string.clone());
            invalidation_paths.push(dep_module.path.clone());
        }

        stack.pop();

        let tree = source.tree_digest(module)?;
        max_dirty = max_opt(max_dirty, tree.dirty_timestamp);

        let mut hasher = Sha256::new();
        hasher.update(tree.hash.as_bytes());
        for (name, version_string) in &dep_versions {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(version_string.as_bytes());
            hasher.update([0u8]);
        }

        let version = ModuleVersion {
            version_string: hex(&hasher.finalize()),
            dirty_timestamp: max_dirty,
            dependency_versions: dep_versions,
        };

        self.cache.insert(
            cache_key,
            CacheEntry { version: version.clone(), invalidation_paths },
        );

        Ok(version)
    }

    /// Drop every cached entry whose module or dependency path is a prefix
    /// of (or equal to) `changed_path` — called by the watcher hook.
    pub fn invalidate(&self, changed_path: &Path) {
        self.cache
            .retain(|_, entry| !entry.invalidation_paths.iter().any(|p| changed_path.starts_with(p)));
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
