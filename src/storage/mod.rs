use async_trait::async_trait;

use crate::AppSettings;
use crate::store::PersistedStore;

mod file_storage;
mod memory_storage;

pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_settings(&self, settings: &AppSettings) -> anyhow::Result<()>;
    async fn load_settings(&self) -> anyhow::Result<Option<AppSettings>>;
    /// Writes the `playground-store` blob.
    async fn save_playground(&self, store: &PersistedStore) -> anyhow::Result<()>;
    async fn load_playground(&self) -> anyhow::Result<Option<PersistedStore>>;
}

pub async fn get_storage() -> anyhow::Result<FileStorage> {
    use directories_next::ProjectDirs;
    use std::path::PathBuf;

    let base = if let Some(proj_dirs) = ProjectDirs::from("com", "N K", "mcp-playground") {
        proj_dirs.config_dir().to_path_buf()
        // Lin: /home/alice/.config/mcp-playground
        // Mac: /Users/Alice/Library/Application Support/com.N-K.mcp-playground
    } else {
        PathBuf::from(".")
    };
    let storage = FileStorage::new(base);
    storage.ensure_dir().await?;
    Ok(storage)
}
