//! Streaming speech-to-text.
//!
//! A recognizer stream is duplex: raw audio goes in through a
//! [`RecognizerHandle`] in arrival order, and [`Utterance`] events come out of
//! an [`UtteranceStream`]. Interim hypotheses precede the final utterance they
//! refine. Once the stream ends (close, upstream error, or timeout) it cannot
//! be restarted; callers open a new one.

use crate::config::{DeepgramConfig, RecognizerConfig};
use crate::error::VoiceError;
use async_trait::async_trait;
use bytes::Bytes;
use callbridge_types::Utterance;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Buffered audio chunks between the session and the upstream writer.
const AUDIO_CHANNEL_CAPACITY: usize = 256;

/// Buffered recognizer events between the upstream reader and the session.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;
const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;

/// Lazy, unbounded sequence of recognizer events. Ends after the first error.
pub type UtteranceStream = Pin<Box<dyn Stream<Item = Result<Utterance, VoiceError>> + Send>>;

/// Write side of a live recognizer stream.
#[derive(Debug)]
pub struct RecognizerHandle {
    audio_tx: Option<mpsc::Sender<Bytes>>,
}

impl RecognizerHandle {
    pub fn new(audio_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            audio_tx: Some(audio_tx),
        }
    }

    /// Queues one audio chunk for the recognizer, preserving arrival order.
    pub async fn push_audio(&self, chunk: Bytes) -> Result<(), VoiceError> {
        let tx = self.audio_tx.as_ref().ok_or(VoiceError::Closed)?;
        tx.send(chunk).await.map_err(|_| VoiceError::Closed)
    }

    /// Finalizes the stream. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.audio_tx.take().is_some() {
            tracing::debug!("recognizer stream finalized");
        }
    }

    /// True once closed locally or once the upstream side has gone away.
    pub fn is_closed(&self) -> bool {
        self.audio_tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// An opened recognizer stream: the audio handle plus its event sequence.
pub struct RecognizerStream {
    pub handle: RecognizerHandle,
    pub utterances: UtteranceStream,
}

impl RecognizerStream {
    /// Wires a stream from raw channels. Backends spawn a task that drains
    /// `audio_rx` and feeds `event_tx`.
    pub fn channel() -> (
        Self,
        mpsc::Receiver<Bytes>,
        mpsc::Sender<Result<Utterance, VoiceError>>,
    ) {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stream = Self {
            handle: RecognizerHandle::new(audio_tx),
            utterances: Box::pin(ReceiverStream::new(event_rx)),
        };
        (stream, audio_rx, event_tx)
    }
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Opens one live transcription stream.
    async fn open(&self, config: &RecognizerConfig) -> Result<RecognizerStream, VoiceError>;
}

/// Deepgram live transcription over WebSocket.
#[derive(Debug, Clone)]
pub struct DeepgramRecognizer {
    config: DeepgramConfig,
}

impl DeepgramRecognizer {
    pub fn new(config: DeepgramConfig) -> Self {
        Self { config }
    }

    fn listen_url(&self, options: &RecognizerConfig) -> Result<reqwest::Url, VoiceError> {
        let mut url = reqwest::Url::parse(&self.config.url)
            .map_err(|e| VoiceError::Config(format!("invalid recognizer url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("punctuate", &options.punctuate.to_string())
                .append_pair("interim_results", &options.interim_results.to_string())
                .append_pair("encoding", &self.config.encoding)
                .append_pair("sample_rate", &self.config.sample_rate.to_string())
                .append_pair("channels", &self.config.channels.to_string());
            if let Some(model) = &self.config.model {
                query.append_pair("model", model);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn open(&self, options: &RecognizerConfig) -> Result<RecognizerStream, VoiceError> {
        let url = self.listen_url(options)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Config(format!("invalid recognizer request: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|_| VoiceError::Config("recognizer api key is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let connect_timeout = self.config.connect_timeout();
        let (socket, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    VoiceError::Timeout(format!(
                        "recognizer connect timed out after {} ms",
                        connect_timeout.as_millis()
                    ))
                })?
                .map_err(|e| VoiceError::Connectivity(format!("recognizer connect failed: {}", e)))?;

        tracing::info!(
            sample_rate = self.config.sample_rate,
            interim_results = options.interim_results,
            "recognizer stream opened"
        );

        let (stream, audio_rx, event_tx) = RecognizerStream::channel();
        tokio::spawn(run_stream(
            socket,
            audio_rx,
            event_tx,
            self.config.keepalive_interval(),
            self.config.response_timeout(),
        ));
        Ok(stream)
    }
}

/// Pumps audio up and transcripts down until either side finishes.
async fn run_stream(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<Result<Utterance, VoiceError>>,
    keepalive_interval: Duration,
    response_timeout: Duration,
) {
    let (mut sink, mut source) = socket.split();
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    let mut audio_open = true;
    let mut last_audio = Instant::now();
    // Set when audio (or the close request) went out and nothing has come back yet.
    let mut awaiting_since: Option<Instant> = None;

    loop {
        let deadline = awaiting_since.map(|since| since + response_timeout);

        tokio::select! {
            chunk = audio_rx.recv(), if audio_open => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send(Message::binary(chunk)).await {
                        let _ = event_tx
                            .send(Err(VoiceError::Connectivity(format!("recognizer send failed: {}", e))))
                            .await;
                        break;
                    }
                    last_audio = Instant::now();
                    awaiting_since.get_or_insert(last_audio);
                }
                None => {
                    audio_open = false;
                    if sink.send(Message::text(CLOSE_STREAM_MESSAGE)).await.is_err() {
                        break;
                    }
                    awaiting_since = Some(Instant::now());
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    awaiting_since = None;
                    match parse_results(text.as_str()) {
                        Ok(Some(utterance)) => {
                            if event_tx.send(Ok(utterance)).await.is_err() {
                                // Nobody is listening anymore.
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = event_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = event_tx
                        .send(Err(VoiceError::Connectivity(format!("recognizer receive failed: {}", e))))
                        .await;
                    break;
                }
            },
            _ = keepalive.tick(), if audio_open => {
                if last_audio.elapsed() >= keepalive_interval
                    && sink.send(Message::text(KEEPALIVE_MESSAGE)).await.is_err()
                {
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let _ = event_tx
                    .send(Err(VoiceError::Timeout(format!(
                        "no recognizer response within {} ms",
                        response_timeout.as_millis()
                    ))))
                    .await;
                break;
            }
        }
    }

    let _ = sink.close().await;
    tracing::debug!("recognizer stream ended");
}

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

/// Parses one recognizer message. Non-result messages and empty transcripts
/// yield `Ok(None)`.
pub(crate) fn parse_results(text: &str) -> Result<Option<Utterance>, VoiceError> {
    let message: DeepgramMessage = serde_json::from_str(text)
        .map_err(|e| VoiceError::Protocol(format!("malformed recognizer event: {}", e)))?;

    match message.kind.as_deref() {
        Some("Results") | None => {}
        Some("Error") => {
            return Err(VoiceError::Protocol(
                message
                    .description
                    .unwrap_or_else(|| "recognizer reported an error".to_string()),
            ))
        }
        Some(_) => return Ok(None),
    }

    let transcript = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default();

    if transcript.is_empty() {
        return Ok(None);
    }

    Ok(Some(if message.is_final {
        Utterance::final_text(transcript)
    } else {
        Utterance::interim(transcript)
    }))
}
