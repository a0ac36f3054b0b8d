//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ConfigError;

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_environment")]
    pub environment: RuntimeEnvironment,

    /// Service name stamped on envelopes and heartbeats.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Reasoning agent variant identifier.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub memory: MemorySettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Messaging fabric endpoints and knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_ephemeral_url")]
    pub ephemeral_url: String,
    #[serde(default = "default_durable_url")]
    pub durable_url: String,
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect: usize,
    /// Timeout for durable operations (stream provisioning, publish acks).
    #[serde(default = "default_durable_operation_ms")]
    pub durable_operation_ms: u64,
    /// Redeliveries before a message is dead-lettered.
    #[serde(default = "default_redeliver_max")]
    pub redeliver_max: u32,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
}

/// Memory store configuration: row store + ANN index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Row store contact points, comma-separated in `DB_URL`.
    #[serde(default = "default_db_hosts")]
    pub db_hosts: Vec<String>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_qdrant_collection")]
    pub qdrant_collection: String,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// `cosine` or `l2`.
    #[serde(default = "default_distance")]
    pub distance: String,
    /// Top-k for context retrieval.
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
}

/// LLM capability endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_url")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Embedding endpoint; defaults to the LLM endpoint.
    #[serde(default)]
    pub embedding_endpoint: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

/// STT/TTS wrapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// STT capability endpoint; empty disables the HTTP backend.
    #[serde(default)]
    pub stt_endpoint: Option<String>,
    /// TTS capability endpoint; empty disables the HTTP backend.
    #[serde(default)]
    pub tts_endpoint: Option<String>,
    #[serde(default = "default_vad_threshold")]
    pub vad_energy_threshold: f32,
    /// Silence hangover before a final transcript is emitted.
    #[serde(default = "default_hangover_ms")]
    pub hangover_ms: u64,
    #[serde(default = "default_max_concurrent_tts")]
    pub max_concurrent_tts: usize,
    #[serde(default = "default_tts_sample_rate")]
    pub tts_sample_rate: u32,
}

/// Per-stage and per-turn deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_turn_ms")]
    pub turn_ms: u64,
    #[serde(default = "default_reason_ms")]
    pub reason_ms: u64,
    #[serde(default = "default_stt_ms")]
    pub stt_ms: u64,
    #[serde(default = "default_tts_first_chunk_ms")]
    pub tts_first_chunk_ms: u64,
    #[serde(default = "default_ephemeral_request_ms")]
    pub ephemeral_request_ms: u64,
}

impl TimeoutSettings {
    pub fn turn(&self) -> Duration {
        Duration::from_millis(self.turn_ms)
    }
    pub fn reason(&self) -> Duration {
        Duration::from_millis(self.reason_ms)
    }
    pub fn stt(&self) -> Duration {
        Duration::from_millis(self.stt_ms)
    }
    pub fn tts_first_chunk(&self) -> Duration {
        Duration::from_millis(self.tts_first_chunk_ms)
    }
    pub fn ephemeral_request(&self) -> Duration {
        Duration::from_millis(self.ephemeral_request_ms)
    }
}

/// Logging and trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub tracing_enabled: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn default_environment() -> RuntimeEnvironment {
    match std::env::var("ENVIRONMENT").as_deref() {
        Ok("production") => RuntimeEnvironment::Production,
        Ok("staging") => RuntimeEnvironment::Staging,
        _ => RuntimeEnvironment::Development,
    }
}

fn default_service_name() -> String {
    std::env::var("SERVICE_NAME").unwrap_or_else(|_| "colloquy-agent".to_string())
}

fn default_agent_id() -> String {
    std::env::var("AGENT_ID").unwrap_or_else(|_| "colloquy-voice".to_string())
}

fn default_port() -> u16 {
    env_or("PORT", 8080)
}

fn default_ephemeral_url() -> String {
    std::env::var("BUS_EPHEMERAL_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_durable_url() -> String {
    std::env::var("BUS_DURABLE_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_max_reconnect() -> usize {
    10
}

fn default_durable_operation_ms() -> u64 {
    env_or("DURABLE_OPERATION_MS", 30_000)
}

fn default_redeliver_max() -> u32 {
    env_or("REDELIVER_MAX", 3)
}

fn default_heartbeat_interval_s() -> u64 {
    10
}

fn default_db_hosts() -> Vec<String> {
    std::env::var("DB_URL")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["127.0.0.1:9042".to_string()])
}

fn default_keyspace() -> String {
    std::env::var("DB_KEYSPACE").unwrap_or_else(|_| "colloquy".to_string())
}

fn default_replication_factor() -> u8 {
    1
}

fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6334".to_string())
}

fn default_qdrant_collection() -> String {
    std::env::var("QDRANT_COLLECTION").unwrap_or_else(|_| "conversation_turns".to_string())
}

fn default_embedding_dim() -> usize {
    env_or("EMBEDDING_DIM", 384)
}

fn default_distance() -> String {
    std::env::var("MEMORY_DISTANCE").unwrap_or_else(|_| "cosine".to_string())
}

fn default_retrieval_k() -> usize {
    env_or("RETRIEVAL_K", 5)
}

fn default_llm_url() -> String {
    std::env::var("LLM_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

fn default_llm_model() -> String {
    std::env::var("LLM_MODEL").unwrap_or_else(|_| "qwen3:4b-instruct".to_string())
}

fn default_max_tokens() -> usize {
    env_or("LLM_MAX_TOKENS", 150)
}

fn default_temperature() -> f32 {
    env_or("LLM_TEMPERATURE", 0.7)
}

fn default_embedding_model() -> String {
    std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "all-minilm:l6-v2".to_string())
}

fn default_vad_threshold() -> f32 {
    env_or("VAD_ENERGY_THRESHOLD", 0.01)
}

fn default_hangover_ms() -> u64 {
    env_or("STT_HANGOVER_MS", 400)
}

fn default_max_concurrent_tts() -> usize {
    env_or("MAX_CONCURRENT_TTS", 4)
}

fn default_tts_sample_rate() -> u32 {
    22_050
}

fn default_turn_ms() -> u64 {
    env_or("T_TURN_MS", 7_000)
}

fn default_reason_ms() -> u64 {
    env_or("T_REASON_MS", 5_000)
}

fn default_stt_ms() -> u64 {
    env_or("T_STT_MS", 3_000)
}

fn default_tts_first_chunk_ms() -> u64 {
    env_or("T_TTS_FIRST_CHUNK_MS", 1_000)
}

fn default_ephemeral_request_ms() -> u64 {
    env_or("EPHEMERAL_REQUEST_MS", 2_000)
}

fn default_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn default_otlp_endpoint() -> Option<String> {
    std::env::var("OTEL_ENDPOINT").ok()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            ephemeral_url: default_ephemeral_url(),
            durable_url: default_durable_url(),
            max_reconnect: default_max_reconnect(),
            durable_operation_ms: default_durable_operation_ms(),
            redeliver_max: default_redeliver_max(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            db_hosts: default_db_hosts(),
            keyspace: default_keyspace(),
            replication_factor: default_replication_factor(),
            qdrant_url: default_qdrant_url(),
            qdrant_collection: default_qdrant_collection(),
            qdrant_api_key: None,
            embedding_dim: default_embedding_dim(),
            distance: default_distance(),
            retrieval_k: default_retrieval_k(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_url(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            embedding_endpoint: None,
            embedding_model: default_embedding_model(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stt_endpoint: std::env::var("STT_URL").ok(),
            tts_endpoint: std::env::var("TTS_URL").ok(),
            vad_energy_threshold: default_vad_threshold(),
            hangover_ms: default_hangover_ms(),
            max_concurrent_tts: default_max_concurrent_tts(),
            tts_sample_rate: default_tts_sample_rate(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            turn_ms: default_turn_ms(),
            reason_ms: default_reason_ms(),
            stt_ms: default_stt_ms(),
            tts_first_chunk_ms: default_tts_first_chunk_ms(),
            ephemeral_request_ms: default_ephemeral_request_ms(),
        }
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            otlp_endpoint: default_otlp_endpoint(),
            tracing_enabled: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            service_name: default_service_name(),
            agent_id: default_agent_id(),
            server: ServerSettings::default(),
            bus: BusSettings::default(),
            memory: MemorySettings::default(),
            llm: LlmSettings::default(),
            pipeline: PipelineSettings::default(),
            timeouts: TimeoutSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings, rejecting values that would break invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.embedding_dim < 384 {
            return Err(ConfigError::InvalidValue {
                field: "memory.embedding_dim".to_string(),
                message: "embedding dimension must be at least 384".to_string(),
            });
        }
        if !matches!(self.memory.distance.as_str(), "cosine" | "l2") {
            return Err(ConfigError::InvalidValue {
                field: "memory.distance".to_string(),
                message: format!("unknown distance metric: {}", self.memory.distance),
            });
        }
        if self.pipeline.max_concurrent_tts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.max_concurrent_tts".to_string(),
                message: "TTS concurrency cap must be positive".to_string(),
            });
        }
        if self.timeouts.reason_ms > self.timeouts.turn_ms {
            return Err(ConfigError::InvalidValue {
                field: "timeouts.reason_ms".to_string(),
                message: "reasoning deadline cannot exceed the turn deadline".to_string(),
            });
        }
        if self.service_name.is_empty() || self.agent_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "service_name".to_string(),
                message: "service_name and agent_id must be non-empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Load settings from config files and environment.
///
/// Priority: env vars > `config/{env}.yaml` > `config/default.yaml` > defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if Path::new("config/default.yaml").exists() {
        builder = builder.add_source(File::with_name("config/default").required(false));
    }
    if let Some(env) = env {
        builder = builder.add_source(File::with_name(&format!("config/{}", env)).required(false));
    }
    builder = builder.add_source(Environment::with_prefix("COLLOQUY").separator("__"));

    let settings: Settings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.memory.embedding_dim, 384);
        assert_eq!(settings.timeouts.turn_ms, 7_000);
        assert_eq!(settings.timeouts.reason_ms, 5_000);
        assert_eq!(settings.timeouts.stt_ms, 3_000);
        assert_eq!(settings.timeouts.tts_first_chunk_ms, 1_000);
        assert_eq!(settings.pipeline.max_concurrent_tts, 4);
        assert_eq!(settings.bus.redeliver_max, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_dim() {
        let mut settings = Settings::default();
        settings.memory.embedding_dim = 128;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_distance() {
        let mut settings = Settings::default();
        settings.memory.distance = "manhattan".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_deadlines() {
        let mut settings = Settings::default();
        settings.timeouts.reason_ms = 10_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_timeout_durations() {
        let t = TimeoutSettings::default();
        assert_eq!(t.reason(), Duration::from_secs(5));
        assert_eq!(t.ephemeral_request(), Duration::from_secs(2));
    }
}
