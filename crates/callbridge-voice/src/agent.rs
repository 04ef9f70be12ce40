//! Streaming response generation against a chat-completion backend.
//!
//! The backend answers with a server-sent-event body: one `data: {json}` line
//! per token delta, terminated by `data: [DONE]`. Tokens are yielded as soon
//! as their line is complete, and completion is reported as a separate
//! [`GenerationEvent::Done`] so callers can tell "finished with no tokens"
//! apart from "still running".

use crate::config::{build_http_client, OpenAiConfig};
use crate::error::VoiceError;
use async_trait::async_trait;
use callbridge_types::{ChatMessage, GenerationRequest};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffered generation events between the upstream reader and the caller.
const DEFAULT_GENERATION_CHANNEL_CAPACITY: usize = 128;

const DONE_SENTINEL: &str = "[DONE]";

/// One step of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// A non-empty token delta, in generation order.
    Token(String),
    /// The model marked the stream complete.
    Done,
}

/// Lazy token sequence. Ends after `Done` or after the first error.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationEvent, VoiceError>> + Send>>;

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, VoiceError>;
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Interpretation of one complete SSE line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Token(String),
    Done,
    Skip,
}

/// Parses a single SSE line from a chat-completion stream.
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, VoiceError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        // Blank separators, comments, and `event:`/`id:` fields carry no tokens.
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();

    if payload == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(payload)
        .map_err(|e| VoiceError::Protocol(format!("malformed completion chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(VoiceError::Protocol(format!(
            "completion stream reported an error: {}",
            error
        )));
    }

    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
    {
        Some(token) if !token.is_empty() => Ok(SseLine::Token(token)),
        _ => Ok(SseLine::Skip),
    }
}

/// Splits a byte stream into complete lines, holding partial lines (and
/// partial UTF-8 sequences) until the rest arrives.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Returns whatever trailing text never got a newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// OpenAI-compatible streaming chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = build_http_client(Duration::from_millis(config.request_timeout_ms));
        Self { client, config }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, VoiceError> {
        let body = CompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(self.completions_url())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| {
            VoiceError::Timeout(format!(
                "completion request timed out after {} ms",
                timeout.as_millis()
            ))
        })??;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Connectivity(format!(
                "completion upstream returned {}: {}",
                status, detail
            )));
        }

        let (tx, rx) = mpsc::channel(DEFAULT_GENERATION_CHANNEL_CAPACITY);
        tokio::spawn(pump_completion(response.bytes_stream(), tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Decodes an SSE body into generation events until `[DONE]` or an error.
pub(crate) async fn pump_completion<S, B, E>(
    body: S,
    tx: mpsc::Sender<Result<GenerationEvent, VoiceError>>,
) where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Into<VoiceError> + Send,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = LineDecoder::default();
    let mut tokens = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        for line in decoder.push(chunk.as_ref()) {
            match parse_sse_line(&line) {
                Ok(SseLine::Token(token)) => {
                    tokens += 1;
                    if tx.send(Ok(GenerationEvent::Token(token))).await.is_err() {
                        return;
                    }
                }
                Ok(SseLine::Done) => {
                    tracing::debug!(tokens, "completion stream finished");
                    let _ = tx.send(Ok(GenerationEvent::Done)).await;
                    return;
                }
                Ok(SseLine::Skip) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    // A final line without a trailing newline may still carry the sentinel.
    if let Some(line) = decoder.finish() {
        match parse_sse_line(&line) {
            Ok(SseLine::Done) => {
                let _ = tx.send(Ok(GenerationEvent::Done)).await;
                return;
            }
            Ok(SseLine::Token(token)) => {
                let _ = tx.send(Ok(GenerationEvent::Token(token))).await;
            }
            Ok(SseLine::Skip) => {}
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    let _ = tx
        .send(Err(VoiceError::Protocol(
            "completion stream ended without a completion marker".to_string(),
        )))
        .await;
}
