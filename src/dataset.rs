//! Evaluation datasets built from playground conversations.
//!
//! Every [`DatasetClient`] call answers with an [`Envelope`] so callers can
//! show `message` when `success` is false. Storage and IO failures are
//! returned as errors instead.
//!
//! [`FileDatasets`] keeps everything in one JSON file:
//! ```json
//! {
//!   "datasets": [{ "id": "...", "name": "...", "createdAt": "...", "updatedAt": "..." }],
//!   "items": { "<dataset id>": [{ "id": "...", "messages": [] }] }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::Message;
use crate::tab::{ModelSettings, TabState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// The payload, or the envelope's message as an error.
    pub fn into_result(self) -> anyhow::Result<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(anyhow::anyhow!(self.message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub settings: ModelSettings,
    pub messages: Vec<Message>,
    /// provider id -> tool names that were enabled
    #[serde(default)]
    pub tools: BTreeMap<String, Vec<String>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl DatasetItem {
    /// Snapshot of a conversation. Only the selected range is taken when cut
    /// mode is on.
    pub fn capture(state: &TabState, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            model: state.model.clone(),
            system_prompt: state.system_prompt.clone(),
            settings: state.settings.clone(),
            messages: state.cut_messages().to_vec(),
            tools: state.enabled_tools.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait::async_trait]
pub trait DatasetClient: Send + Sync {
    async fn list_datasets(&self) -> anyhow::Result<Envelope<Vec<Dataset>>>;
    async fn create_dataset(&self, name: &str, description: &str) -> anyhow::Result<Envelope<Dataset>>;
    async fn delete_dataset(&self, dataset_id: &str) -> anyhow::Result<Envelope<()>>;
    async fn list_items(&self, dataset_id: &str) -> anyhow::Result<Envelope<Vec<DatasetItem>>>;
    async fn add_item(&self, dataset_id: &str, item: DatasetItem) -> anyhow::Result<Envelope<DatasetItem>>;
    async fn update_item(&self, dataset_id: &str, item: DatasetItem) -> anyhow::Result<Envelope<DatasetItem>>;
    async fn delete_item(&self, dataset_id: &str, item_id: &str) -> anyhow::Result<Envelope<()>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatasetFile {
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    items: BTreeMap<String, Vec<DatasetItem>>,
}

impl DatasetFile {
    fn dataset_mut(&mut self, id: &str) -> Option<&mut Dataset> {
        self.datasets.iter_mut().find(|d| d.id == id)
    }

    fn touch(&mut self, id: &str) {
        if let Some(d) = self.dataset_mut(id) {
            d.updated_at = Utc::now();
        }
    }
}

pub struct FileDatasets {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

fn not_found<T>(dataset_id: &str) -> Envelope<T> {
    Envelope::failure(format!("Dataset {dataset_id} not found"))
}

impl FileDatasets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> anyhow::Result<DatasetFile> {
        match fs::read_to_string(&self.path).await {
            Ok(data) => serde_json::from_str(&data).with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DatasetFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, file: &DatasetFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(file)?).await?;
        debug!("wrote {}", self.path.display());
        Ok(())
    }
}

#[async_trait::async_trait]
impl DatasetClient for FileDatasets {
    async fn list_datasets(&self) -> anyhow::Result<Envelope<Vec<Dataset>>> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(Envelope::ok(format!("{} datasets", file.datasets.len()), file.datasets))
    }

    async fn create_dataset(&self, name: &str, description: &str) -> anyhow::Result<Envelope<Dataset>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Envelope::failure("Dataset name is required"));
        }
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.datasets.iter().any(|d| d.name == name) {
            return Ok(Envelope::failure(format!("Dataset {name} already exists")));
        }
        let now = Utc::now();
        let dataset = Dataset {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };
        file.datasets.push(dataset.clone());
        self.save(&file).await?;
        info!("created dataset {name}");
        Ok(Envelope::ok("Dataset created", dataset))
    }

    async fn delete_dataset(&self, dataset_id: &str) -> anyhow::Result<Envelope<()>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let before = file.datasets.len();
        file.datasets.retain(|d| d.id != dataset_id);
        if file.datasets.len() == before {
            return Ok(not_found(dataset_id));
        }
        file.items.remove(dataset_id);
        self.save(&file).await?;
        Ok(Envelope::ok("Dataset deleted", ()))
    }

    async fn list_items(&self, dataset_id: &str) -> anyhow::Result<Envelope<Vec<DatasetItem>>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.dataset_mut(dataset_id).is_none() {
            return Ok(not_found(dataset_id));
        }
        let items = file.items.remove(dataset_id).unwrap_or_default();
        Ok(Envelope::ok(format!("{} items", items.len()), items))
    }

    async fn add_item(&self, dataset_id: &str, mut item: DatasetItem) -> anyhow::Result<Envelope<DatasetItem>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.dataset_mut(dataset_id).is_none() {
            return Ok(not_found(dataset_id));
        }
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        item.created_at = now;
        item.updated_at = now;
        file.items.entry(dataset_id.to_string()).or_default().push(item.clone());
        file.touch(dataset_id);
        self.save(&file).await?;
        Ok(Envelope::ok("Item added", item))
    }

    async fn update_item(&self, dataset_id: &str, mut item: DatasetItem) -> anyhow::Result<Envelope<DatasetItem>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.dataset_mut(dataset_id).is_none() {
            return Ok(not_found(dataset_id));
        }
        let items = file.items.entry(dataset_id.to_string()).or_default();
        let Some(existing) = items.iter_mut().find(|i| i.id == item.id) else {
            return Ok(Envelope::failure(format!("Item {} not found", item.id)));
        };
        item.created_at = existing.created_at;
        item.updated_at = Utc::now();
        *existing = item.clone();
        file.touch(dataset_id);
        self.save(&file).await?;
        Ok(Envelope::ok("Item updated", item))
    }

    async fn delete_item(&self, dataset_id: &str, item_id: &str) -> anyhow::Result<Envelope<()>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let Some(items) = file.items.get_mut(dataset_id) else {
            return Ok(not_found(dataset_id));
        };
        let before = items.len();
        items.retain(|i| i.id != item_id);
        if items.len() == before {
            return Ok(Envelope::failure(format!("Item {item_id} not found")));
        }
        file.touch(dataset_id);
        self.save(&file).await?;
        Ok(Envelope::ok("Item deleted", ()))
    }
}
