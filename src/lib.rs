pub mod agent;
pub mod app_settings;
pub mod approval;
pub mod dataset;
pub mod llm;
pub mod mcp;
pub mod message;
pub mod playground;
pub mod storage;
pub mod store;
pub mod tab;
pub mod tool_override;
pub mod toolbox;
pub mod toolset;

pub use agent::{AgentRunner, RunOutcome};
pub use app_settings::{AppSettings, PlaygroundConfig, ProviderSettings};
pub use playground::{Playground, spawn_drive, spawn_persistence};
pub use store::{PlaygroundStore, Resolution, StoreConfig};
