//! Watcher hook (§4.10): contract only. The filesystem-watching mechanism
//! itself (inotify/kqueue/polling) is an external driver's concern; this
//! module only debounces a burst of reported paths into one re-drive set
//! and maps it onto the modules [`ConfigGraph::with_dependant_modules`]
//! says need re-processing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::model::Module;
use crate::graph::ConfigGraph;

/// Something that can report paths it has observed change since it was
/// last asked. Polled or pushed by an external driver — this core never
/// calls into the filesystem itself.
pub trait WatchSource: Send + Sync {
    fn changed_paths(&self) -> Vec<PathBuf>;
}

/// Coalesces a burst of path-change notifications arriving within
/// `window` of each other into a single flush, instead of re-driving the
/// scheduler once per individual filesystem event.
pub struct Debouncer {
    window: Duration,
    pending: HashSet<PathBuf>,
    last_seen: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashSet::new(), last_seen: None }
    }

    /// Record newly-changed paths. Call `flush` to check whether the
    /// quiet window has elapsed.
    pub fn record(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.pending.extend(paths);
        self.last_seen = Some(Instant::now());
    }

    /// Returns the accumulated path set and clears it, but only once
    /// `window` has elapsed since the last `record` — otherwise returns
    /// `None` so the caller keeps accumulating.
    pub fn flush(&mut self) -> Option<HashSet<PathBuf>> {
        let quiet_for = self.last_seen.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if self.pending.is_empty() || quiet_for < self.window {
            return None;
        }
        self.last_seen = None;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Maps a debounced set of changed filesystem paths onto the set of
/// module names that need re-processing: every module whose own path
/// was touched, plus (via the graph) every module that transitively
/// depends on one of those.
pub fn affected_modules(
    changed_paths: &HashSet<PathBuf>,
    modules: &[Module],
    graph: &ConfigGraph,
) -> HashSet<std::sync::Arc<str>> {
    let directly_touched: HashSet<std::sync::Arc<str>> = modules
        .iter()
        .filter(|m| changed_paths.iter().any(|p| path_is_within(p, &m.path)))
        .map(|m| std::sync::Arc::clone(&m.name))
        .collect();

    graph.with_dependant_modules(&directly_touched)
}

fn path_is_within(changed: &Path, module_path: &Path) -> bool {
    changed.starts_with(module_path)
}
