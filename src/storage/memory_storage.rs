use anyhow::Result;
use parking_lot::Mutex;

use crate::AppSettings;
use crate::store::PersistedStore;

/// Keeps everything in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    settings: Mutex<Option<AppSettings>>,
    playground: Mutex<Option<PersistedStore>>,
    saves: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of playground writes so far.
    pub fn playground_saves(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait::async_trait]
impl super::Storage for MemoryStorage {
    async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }

    async fn load_settings(&self) -> Result<Option<AppSettings>> {
        Ok(self.settings.lock().clone())
    }

    async fn save_playground(&self, store: &PersistedStore) -> Result<()> {
        *self.playground.lock() = Some(store.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn load_playground(&self) -> Result<Option<PersistedStore>> {
        Ok(self.playground.lock().clone())
    }
}
