use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_deepgram_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_encoding() -> String {
    "linear16".to_string()
}

fn default_channels() -> u16 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_response_timeout_ms() -> u64 {
    15_000
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-2024-11-20".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_elevenlabs_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_voice_id() -> String {
    "21m00Tcm4TlvDq8ikWAM".to_string()
}

fn default_tts_model_id() -> String {
    "eleven_turbo_v2".to_string()
}

fn default_output_format() -> String {
    "pcm_16000".to_string()
}

fn default_stability() -> f32 {
    0.75
}

fn default_similarity_boost() -> f32 {
    0.8
}

/// Per-stream recognizer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub punctuate: bool,
    /// Emit interim (non-final) hypotheses as they refine.
    pub interim_results: bool,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            punctuate: true,
            interim_results: true,
        }
    }
}

/// Streaming speech-to-text backend (Deepgram live API).
#[derive(Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    #[serde(default = "default_deepgram_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Optional model name (e.g. "nova-2-phonecall").
    #[serde(default)]
    pub model: Option<String>,
    /// Sample rate of the inbound gateway audio, in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Maximum wait for any recognizer event after audio was sent.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Keep-alive cadence while no audio is flowing.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            url: default_deepgram_url(),
            api_key: String::new(),
            model: None,
            sample_rate: default_sample_rate(),
            encoding: default_encoding(),
            channels: default_channels(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl fmt::Debug for DeepgramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("sample_rate", &self.sample_rate)
            .field("encoding", &self.encoding)
            .field("channels", &self.channels)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("response_timeout_ms", &self.response_timeout_ms)
            .field("keepalive_interval_ms", &self.keepalive_interval_ms)
            .finish()
    }
}

impl DeepgramConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}

/// Chat-completion backend (OpenAI-compatible API).
#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Deadline for the response headers; the token stream is bounded by the
    /// caller.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: String::new(),
            model: default_chat_model(),
            temperature: None,
            max_tokens: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Streaming text-to-speech backend (ElevenLabs API).
#[derive(Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    #[serde(default = "default_elevenlabs_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_tts_model_id")]
    pub model_id: String,
    /// Audio format requested from the backend, e.g. "pcm_16000" or "ulaw_8000".
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            base_url: default_elevenlabs_base_url(),
            api_key: String::new(),
            voice_id: default_voice_id(),
            model_id: default_tts_model_id(),
            output_format: default_output_format(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("output_format", &self.output_format)
            .field("stability", &self.stability)
            .field("similarity_boost", &self.similarity_boost)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Builds the shared HTTP client used for streaming upstream calls.
///
/// Only the connect phase is bounded here: a whole-request timeout would cut
/// off long token and audio streams.
pub(crate) fn build_http_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("callbridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}
