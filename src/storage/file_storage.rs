use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::debug;

use crate::AppSettings;
use crate::store::PersistedStore;

pub struct FileStorage {
    base: PathBuf,
}

impl FileStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .await
            .with_context(|| format!("creating {}", self.base.display()))
    }

    fn settings_path(&self) -> PathBuf {
        self.base.join("settings.json")
    }

    fn playground_path(&self) -> PathBuf {
        self.base.join("playground-store.json")
    }

    pub fn datasets_path(&self) -> PathBuf {
        self.base.join("datasets.json")
    }

    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        // replaced atomically
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("wrote {}", path.display());
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: PathBuf) -> Result<Option<T>> {
        match fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl super::Storage for FileStorage {
    async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        self.write_json(self.settings_path(), settings).await
    }

    async fn load_settings(&self) -> Result<Option<AppSettings>> {
        self.read_json(self.settings_path()).await
    }

    async fn save_playground(&self, store: &PersistedStore) -> Result<()> {
        self.write_json(self.playground_path(), store).await
    }

    async fn load_playground(&self) -> Result<Option<PersistedStore>> {
        self.read_json(self.playground_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::storage::Storage;
    use crate::store::{PlaygroundStore, StoreConfig};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn playground_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));
        storage.ensure_dir().await.unwrap();
        assert!(storage.load_playground().await.unwrap().is_none());
        assert!(storage.load_settings().await.unwrap().is_none());

        let store = PlaygroundStore::new(StoreConfig::default());
        store.add_message(Message::user("hi"));
        store.set_auto_execute_tools(true);
        storage.save_playground(&store.persisted()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("nested/playground-store.json")).unwrap();
        assert!(raw.contains("\"currentTabId\""));
        assert!(raw.contains("\"autoExecuteTools\": true"));

        let back = storage.load_playground().await.unwrap().unwrap();
        assert_eq!(back.current_tab_id, Some(store.current_tab_id()));
        assert_eq!(back.tabs[0].state.messages[0].text(), "hi");
    }

    #[tokio::test]
    async fn corrupt_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.load_settings().await.is_err());
    }
}
