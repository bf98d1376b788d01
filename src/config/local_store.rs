//! LocalConfigStore (§6): per-project user preferences, strictly validated.
//!
//! Read-modify-write is serialised by an in-process mutex plus an atomic
//! rename on write, so concurrent writers within one process never
//! interleave and a crash mid-write never leaves a truncated file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ConfigError;

const MAX_PREVIOUS_USERNAMES: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfigStoreData {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub previous_usernames: Vec<String>,
    #[serde(default)]
    pub linked_project_sources: Vec<LinkedSource>,
    #[serde(default)]
    pub linked_module_sources: Vec<LinkedSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LinkedSource {
    pub name: String,
    pub local_path: PathBuf,
}

impl LocalConfigStoreData {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.previous_usernames.len() > MAX_PREVIOUS_USERNAMES {
            return Err(ConfigError::ParseError(format!(
                "previous-usernames exceeds the maximum of {MAX_PREVIOUS_USERNAMES} entries"
            )));
        }
        Ok(())
    }
}

/// Guards a `.orchestrator/local.yaml` document against concurrent
/// in-process writers. Overrides in `linked*Sources` preempt a
/// [`crate::config::loader::SourceResolver`] checkout for the same name.
pub struct LocalConfigStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl LocalConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn read(&self) -> Result<LocalConfigStoreData, ConfigError> {
        let _guard = self.lock.lock().await;
        self.read_locked()
    }

    fn read_locked(&self) -> Result<LocalConfigStoreData, ConfigError> {
        if !self.path.exists() {
            return Ok(LocalConfigStoreData::default());
        }
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", self.path.display())))?;
        let data: LocalConfigStoreData = serde_yaml::from_str(&text)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", self.path.display())))?;
        data.validate()?;
        Ok(data)
    }

    /// Apply `mutator` to the current contents and persist the result
    /// atomically (write-to-temp then rename).
    pub async fn modify(
        &self,
        mutator: impl FnOnce(&mut LocalConfigStoreData),
    ) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().await;
        let mut data = self.read_locked()?;
        mutator(&mut data);
        data.validate()?;
        self.write_locked(&data)
    }

    fn write_locked(&self, data: &LocalConfigStoreData) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(data)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".local.yaml.tmp".to_string());
    tmp.set_file_name(file_name);
    tmp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_empty_default_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalConfigStore::new(tmp.path().join("local.yaml"));
        let data = store.read().await.unwrap();
        assert_eq!(data, LocalConfigStoreData::default());
    }

    #[tokio::test]
    async fn modify_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("local.yaml");
        let store = LocalConfigStore::new(&path);

        store
            .modify(|d| d.username = Some("ada".to_string()))
            .await
            .unwrap();

        let reloaded = LocalConfigStore::new(&path).read().await.unwrap();
        assert_eq!(reloaded.username.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn rejects_too_many_previous_usernames() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalConfigStore::new(tmp.path().join("local.yaml"));
        let err = store
            .modify(|d| {
                d.previous_usernames = (0..6).map(|i| format!("user{i}")).collect();
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("local.yaml");
        std::fs::write(&path, "unexpectedField: true\n").unwrap();
        let store = LocalConfigStore::new(&path);
        assert!(store.read().await.is_err());
    }
}
