//! Server configuration loading from file and environment variables.

use callbridge_context::{EmbeddingConfig, PineconeConfig};
use callbridge_types::CONTEXT_TOP_K;
use callbridge_voice::{DeepgramConfig, ElevenLabsConfig, OpenAiConfig, RecognizerConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream speech and language backends.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Conversation context index.
    #[serde(default)]
    pub context: ContextConfig,

    /// Per-call pipeline deadlines and recovery.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file holding the local context index.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub deepgram: DeepgramConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
}

/// Which vector index backs the context store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextBackend {
    /// Local SQLite index in the configured database.
    #[default]
    Sqlite,
    /// Hosted Pinecone index.
    Pinecone,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub backend: ContextBackend,

    /// Prior turns retrieved per utterance.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub pinecone: PineconeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for a whole generation, first request to last token.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,

    /// Deadline for a whole synthesis, request to last audio chunk.
    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,

    /// Deadline for each context retrieve or store.
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,

    /// Promote a trailing interim utterance to final after this much
    /// recognizer silence. 0 disables promotion.
    #[serde(default = "default_interim_finalize_after_ms")]
    pub interim_finalize_after_ms: u64,

    /// Minimum spacing between recognizer reopen attempts.
    #[serde(default = "default_reopen_backoff_ms")]
    pub reopen_backoff_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> String {
    "callbridge.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_top_k() -> usize {
    CONTEXT_TOP_K
}

fn default_generation_timeout_ms() -> u64 {
    60_000
}

fn default_synthesis_timeout_ms() -> u64 {
    60_000
}

fn default_context_timeout_ms() -> u64 {
    5_000
}

fn default_interim_finalize_after_ms() -> u64 {
    2_000
}

fn default_reopen_backoff_ms() -> u64 {
    1_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: ContextBackend::default(),
            top_k: default_top_k(),
            embedding: EmbeddingConfig::default(),
            pinecone: PineconeConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: default_generation_timeout_ms(),
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
            context_timeout_ms: default_context_timeout_ms(),
            interim_finalize_after_ms: default_interim_finalize_after_ms(),
            reopen_backoff_ms: default_reopen_backoff_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn interim_finalize_after(&self) -> Option<Duration> {
        (self.interim_finalize_after_ms > 0)
            .then(|| Duration::from_millis(self.interim_finalize_after_ms))
    }

    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLBRIDGE_HOST` overrides `server.host`
/// - `CALLBRIDGE_PORT` overrides `server.port`
/// - `CALLBRIDGE_DB_PATH` overrides `database.path`
/// - `CALLBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `CALLBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `DEEPGRAM_API_KEY`, `ELEVENLABS_API_KEY` set the backend keys
/// - `OPENAI_API_KEY` sets the chat key and, unless configured, the embedding key
/// - `PINECONE_API_KEY`, `PINECONE_HOST` configure the hosted index
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the selected context backend is missing required settings.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Applies overrides from `lookup`; empty values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(host) = var("CALLBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("CALLBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("CALLBRIDGE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("CALLBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("CALLBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    if let Some(key) = var("DEEPGRAM_API_KEY") {
        config.voice.deepgram.api_key = key;
    }
    if let Some(key) = var("OPENAI_API_KEY") {
        if config.context.embedding.api_key.is_empty() {
            config.context.embedding.api_key = key.clone();
        }
        config.voice.openai.api_key = key;
    }
    if let Some(key) = var("ELEVENLABS_API_KEY") {
        config.voice.elevenlabs.api_key = key;
    }
    if let Some(key) = var("PINECONE_API_KEY") {
        config.context.pinecone.api_key = key;
    }
    if let Some(host) = var("PINECONE_HOST") {
        config.context.pinecone.host = host;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.context.backend == ContextBackend::Pinecone
        && config.context.pinecone.host.trim().is_empty()
    {
        return Err(ConfigError::Invalid(
            "context.backend = \"pinecone\" requires context.pinecone.host or PINECONE_HOST"
                .to_string(),
        ));
    }
    for (name, key) in [
        ("DEEPGRAM_API_KEY", &config.voice.deepgram.api_key),
        ("OPENAI_API_KEY", &config.voice.openai.api_key),
        ("ELEVENLABS_API_KEY", &config.voice.elevenlabs.api_key),
    ] {
        if key.is_empty() {
            tracing::warn!(key = name, "backend api key is not configured");
        }
    }
    Ok(())
}
