//! Configuration for the voice agent
//!
//! Layered settings: `config/default.yaml`, then `config/{env}.yaml`, then
//! environment variables. Deployment environments mostly configure through
//! the flat env keys read by the serde default functions (`BUS_EPHEMERAL_URL`,
//! `DB_URL`, `EMBEDDING_DIM`, ...).

mod settings;

pub use settings::{
    load_settings, BusSettings, LlmSettings, MemorySettings, ObservabilitySettings,
    PipelineSettings, RuntimeEnvironment, ServerSettings, Settings, TimeoutSettings,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
