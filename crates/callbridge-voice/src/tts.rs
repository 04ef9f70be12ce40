use crate::config::{build_http_client, ElevenLabsConfig};
use crate::error::VoiceError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Ordered, finite sequence of opaque audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, VoiceError>> + Send>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Converts complete text into streamed audio. Empty text is rejected with
    /// [`VoiceError::EmptyInput`].
    async fn synthesize(&self, text: &str) -> Result<AudioStream, VoiceError>;
}

#[derive(Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// ElevenLabs streaming text-to-speech.
#[derive(Debug, Clone)]
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: ElevenLabsConfig) -> Self {
        let client = build_http_client(Duration::from_millis(config.request_timeout_ms));
        Self { client, config }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id
        )
    }
}

/// Rejects input the synthesizer must never be asked to render.
pub(crate) fn validate_text(text: &str) -> Result<(), VoiceError> {
    if text.trim().is_empty() {
        return Err(VoiceError::EmptyInput(
            "synthesis text is empty".to_string(),
        ));
    }
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::InputTooLarge(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, VoiceError> {
        validate_text(text)?;

        let body = SynthesisBody {
            text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(self.stream_url())
                .query(&[("output_format", self.config.output_format.as_str())])
                .header("xi-api-key", &self.config.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| {
            VoiceError::Timeout(format!(
                "TTS request timed out after {} ms",
                timeout.as_millis()
            ))
        })??;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Connectivity(format!(
                "TTS upstream returned {}: {}",
                status, detail
            )));
        }

        tracing::debug!(chars = text.len(), "TTS stream started");

        let chunks = response
            .bytes_stream()
            .filter(|chunk| {
                let keep = chunk.as_ref().map_or(true, |bytes| !bytes.is_empty());
                async move { keep }
            })
            .map(|chunk| chunk.map_err(VoiceError::from));
        Ok(Box::pin(chunks))
    }
}
