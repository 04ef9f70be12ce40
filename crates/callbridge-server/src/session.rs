//! Per-connection call orchestration.
//!
//! A [`CallSession`] sits between one gateway socket and the three speech
//! upstreams. Inbound audio goes to a live recognizer stream. Final
//! utterances are queued to a single pipeline worker that runs
//! retrieve → generate → synthesize → store for one utterance at a time, in
//! arrival order. Every outbound byte goes through one ordered channel to
//! the socket writer.
//!
//! Upstream failures never end the session: each becomes at most one plain
//! text notice to the gateway, and a failed recognizer is reopened on the
//! next inbound frame.

use crate::config::PipelineConfig;
use crate::Services;
use bytes::Bytes;
use callbridge_types::{
    CallMetadata, ConnectionState, ContextRecord, GenerationRequest, Persona, Role, Utterance,
};
use callbridge_voice::{
    GenerationEvent, RecognizerHandle, UtteranceStream, VoiceError,
};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// End-of-text marker sent after the last token of a reply.
pub const TEXT_DONE_SENTINEL: &str = "[DONE]";
/// End-of-audio marker sent after the last audio chunk of a reply.
pub const AUDIO_DONE_SENTINEL: &str = "[TTS_DONE]";

pub const GENERATION_FAILED_NOTICE: &str = "Error occurred while generating a response.";
pub const SYNTHESIS_FAILED_NOTICE: &str = "Error occurred while synthesizing speech.";
pub const TRANSCRIPTION_FAILED_NOTICE: &str = "Error occurred while transcribing audio.";

/// A frame queued for the gateway socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// One reply token, sent as a text frame.
    Token(String),
    /// [`TEXT_DONE_SENTINEL`].
    TextDone,
    /// One synthesized audio chunk, sent as a binary frame.
    Audio(Bytes),
    /// [`AUDIO_DONE_SENTINEL`].
    AudioDone,
    /// Plain-text error notice.
    Notice(String),
}

/// A frame received from the gateway socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// JSON metadata, `{call_id?, agent?}`.
    Text(String),
    /// Raw PCM audio.
    Binary(Bytes),
    Close,
}

/// Mutable call metadata, readable from every session task.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallMeta {
    call_id: String,
    persona: Persona,
}

/// Sends to the socket writer until the session starts closing; after that
/// frames are discarded.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<OutboundFrame>,
    closing: Arc<AtomicBool>,
}

impl Outbound {
    async fn send(&self, frame: OutboundFrame) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if self.tx.send(frame).await.is_err() {
            tracing::trace!("gateway writer gone, frame dropped");
        }
    }

    async fn notice(&self, message: &str) {
        self.send(OutboundFrame::Notice(message.to_string())).await;
    }
}

/// The live recognizer stream, tagged so a stale listener cannot clear a
/// newer stream.
type RecognizerSlot = Arc<Mutex<Option<(u64, RecognizerHandle)>>>;

pub struct CallSession {
    services: Arc<Services>,
    meta_tx: watch::Sender<CallMeta>,
    state: ConnectionState,
    outbound: Outbound,
    recognizer: RecognizerSlot,
    generation: Arc<AtomicU64>,
    last_open_attempt: Option<Instant>,
    pipeline_tx: Option<mpsc::UnboundedSender<String>>,
    listener: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CallSession {
    /// Creates a session writing to `outbound`. Without a `call_id` a UUID v4
    /// is assigned.
    pub fn new(
        services: Arc<Services>,
        outbound: mpsc::Sender<OutboundFrame>,
        call_id: Option<String>,
    ) -> Self {
        let call_id = call_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (meta_tx, _) = watch::channel(CallMeta {
            call_id,
            persona: Persona::default(),
        });

        Self {
            services,
            meta_tx,
            state: ConnectionState::Connecting,
            outbound: Outbound {
                tx: outbound,
                closing: Arc::new(AtomicBool::new(false)),
            },
            recognizer: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            last_open_attempt: None,
            pipeline_tx: None,
            listener: None,
            worker: None,
        }
    }

    pub fn call_id(&self) -> String {
        self.meta_tx.borrow().call_id.clone()
    }

    pub fn persona(&self) -> Persona {
        self.meta_tx.borrow().persona
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Activates the session: starts the pipeline worker and opens the first
    /// recognizer stream.
    pub async fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.state = ConnectionState::Active;

        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        self.pipeline_tx = Some(pipeline_tx);
        self.worker = Some(tokio::spawn(run_worker(
            pipeline_rx,
            self.services.clone(),
            self.meta_tx.subscribe(),
            self.outbound.clone(),
        )));

        tracing::info!(call_id = %self.call_id(), "call session opened");
        self.open_recognizer().await;
    }

    pub async fn on_inbound_message(&mut self, frame: InboundFrame) {
        if self.state != ConnectionState::Active {
            return;
        }
        match frame {
            InboundFrame::Text(text) => self.apply_metadata(&text).await,
            InboundFrame::Binary(audio) => self.forward_audio(audio).await,
            InboundFrame::Close => {}
        }
    }

    /// Finalizes the recognizer, stops listening, and waits for a running
    /// pipeline to finish. Queued utterances that have not started are
    /// dropped and nothing more reaches the gateway.
    pub async fn on_close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.state = ConnectionState::Closing;
        self.outbound.closing.store(true, Ordering::Release);

        if let Some((_, mut handle)) = self.recognizer.lock().await.take() {
            handle.close();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }

        self.pipeline_tx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!(call_id = %self.call_id(), "pipeline worker ended abnormally: {}", e);
            }
        }

        self.state = ConnectionState::Closed;
        tracing::info!(call_id = %self.call_id(), "call session closed");
    }

    async fn apply_metadata(&mut self, text: &str) {
        let metadata = match CallMetadata::parse(text) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id(), "ignoring malformed metadata frame: {}", e);
                return;
            }
        };

        self.meta_tx.send_modify(|meta| {
            if let Some(call_id) = metadata.call_id.filter(|id| !id.trim().is_empty()) {
                meta.call_id = call_id;
            }
            if let Some(agent) = metadata.agent.as_deref() {
                meta.persona = Persona::from_name(agent);
            }
        });
        tracing::info!(
            call_id = %self.call_id(),
            persona = self.persona().name(),
            "call metadata updated"
        );

        if !self.recognizer_live().await {
            self.reopen_recognizer().await;
        }
    }

    async fn forward_audio(&mut self, audio: Bytes) {
        let bytes = audio.len();
        let pushed = {
            let mut slot = self.recognizer.lock().await;
            match slot.as_ref() {
                Some((_, handle)) if !handle.is_closed() => {
                    match handle.push_audio(audio).await {
                        Ok(()) => true,
                        Err(_) => {
                            *slot = None;
                            false
                        }
                    }
                }
                _ => false,
            }
        };

        if !pushed {
            tracing::debug!(call_id = %self.call_id(), bytes, "no live recognizer, audio frame dropped");
            self.reopen_recognizer().await;
        }
    }

    async fn recognizer_live(&self) -> bool {
        self.recognizer
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_closed())
    }

    async fn reopen_recognizer(&mut self) {
        let backoff = self.services.pipeline.reopen_backoff();
        if self
            .last_open_attempt
            .is_some_and(|at| at.elapsed() < backoff)
        {
            return;
        }
        self.open_recognizer().await;
    }

    async fn open_recognizer(&mut self) {
        self.last_open_attempt = Some(Instant::now());
        let call_id = self.call_id();

        let stream = match self.services.recognizer.open(&self.services.recognizer_config).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "failed to open recognizer stream: {}", e);
                self.outbound.notice(TRANSCRIPTION_FAILED_NOTICE).await;
                return;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((_, mut stale)) = self
            .recognizer
            .lock()
            .await
            .replace((generation, stream.handle))
        {
            stale.close();
        }
        if let Some(previous) = self.listener.take() {
            previous.abort();
        }

        let Some(pipeline_tx) = self.pipeline_tx.clone() else {
            return;
        };
        self.listener = Some(tokio::spawn(run_listener(
            stream.utterances,
            generation,
            self.recognizer.clone(),
            pipeline_tx,
            self.outbound.clone(),
            call_id.clone(),
            self.services.pipeline.interim_finalize_after(),
        )));
        tracing::info!(call_id = %call_id, generation, "recognizer stream live");
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Reads one recognizer stream and queues final utterances.
///
/// A trailing interim with no newer event within `finalize_after` is
/// promoted to final. Whatever the recognizer then sends for the same turn
/// (interims and the final that extend the promoted words) is absorbed, so
/// the turn runs once.
async fn run_listener(
    mut utterances: UtteranceStream,
    generation: u64,
    slot: RecognizerSlot,
    pipeline_tx: mpsc::UnboundedSender<String>,
    outbound: Outbound,
    call_id: String,
    finalize_after: Option<Duration>,
) {
    let mut pending: Option<(String, Instant)> = None;
    let mut promoted: Option<String> = None;
    let mut failed = false;

    loop {
        let deadline = pending
            .as_ref()
            .zip(finalize_after)
            .map(|((_, at), after)| *at + after);

        let event = tokio::select! {
            event = utterances.next() => event,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((text, _)) = pending.take() {
                    tracing::debug!(call_id = %call_id, "promoting stale interim utterance to final");
                    promoted = Some(text.clone());
                    if pipeline_tx.send(text).is_err() {
                        break;
                    }
                }
                continue;
            }
        };

        match event {
            Some(Ok(Utterance { text, is_final: true, .. })) => {
                pending = None;
                if promoted.take().is_some_and(|p| extends_turn(&p, &text)) {
                    tracing::debug!(call_id = %call_id, "final utterance refines a promoted turn, skipped");
                    continue;
                }
                tracing::info!(call_id = %call_id, chars = text.len(), "final utterance");
                if pipeline_tx.send(text).is_err() {
                    break;
                }
            }
            Some(Ok(Utterance { text, .. })) => {
                tracing::trace!(call_id = %call_id, text = %text, "interim utterance");
                if promoted.as_deref().is_some_and(|p| extends_turn(p, &text)) {
                    continue;
                }
                promoted = None;
                pending = Some((text, Instant::now()));
            }
            Some(Err(e)) => {
                tracing::warn!(call_id = %call_id, generation, "recognizer stream failed: {}", e);
                failed = true;
                break;
            }
            None => {
                tracing::debug!(call_id = %call_id, generation, "recognizer stream ended");
                if let Some((text, _)) = pending.take().filter(|_| finalize_after.is_some()) {
                    if pipeline_tx.send(text).is_err() {
                        tracing::debug!(call_id = %call_id, "pipeline closed, trailing interim dropped");
                    }
                }
                break;
            }
        }
    }

    {
        let mut slot = slot.lock().await;
        if slot.as_ref().is_some_and(|(current, _)| *current == generation) {
            if let Some((_, mut handle)) = slot.take() {
                handle.close();
            }
        }
    }
    // The slot is already cleared, so the next inbound frame reopens.
    if failed {
        outbound.notice(TRANSCRIPTION_FAILED_NOTICE).await;
    }
}

fn turn_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Whether `text` continues the words of `promoted`, ignoring case and
/// punctuation. The last promoted word may be a cut-off prefix.
fn extends_turn(promoted: &str, text: &str) -> bool {
    let promoted = turn_words(promoted);
    let text = turn_words(text);
    let Some((last, head)) = promoted.split_last() else {
        return false;
    };
    text.len() >= promoted.len()
        && text[..head.len()] == *head
        && text[head.len()].starts_with(last.as_str())
}

/// Runs queued pipelines one at a time until the queue closes or the
/// session starts closing.
async fn run_worker(
    mut queue: mpsc::UnboundedReceiver<String>,
    services: Arc<Services>,
    meta: watch::Receiver<CallMeta>,
    outbound: Outbound,
) {
    while let Some(text) = queue.recv().await {
        if outbound.closing.load(Ordering::Acquire) {
            break;
        }
        run_pipeline(&services, &meta, &outbound, text).await;
    }
}

async fn run_pipeline(
    services: &Services,
    meta: &watch::Receiver<CallMeta>,
    outbound: &Outbound,
    text: String,
) {
    if text.trim().is_empty() {
        tracing::debug!("empty utterance skipped");
        return;
    }
    let settings = &services.pipeline;
    let call_id = meta.borrow().call_id.clone();

    let context = match tokio::time::timeout(
        settings.context_timeout(),
        services.context.retrieve(&call_id, &text, services.top_k),
    )
    .await
    {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            tracing::warn!(call_id = %call_id, "continuing without context: {}", e);
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(call_id = %call_id, "context retrieval timed out, continuing without context");
            Vec::new()
        }
    };

    let persona = meta.borrow().persona;
    let request = GenerationRequest::build(persona, &context, &text);

    let response = match stream_generation(services, settings, outbound, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(call_id = %call_id, "generation failed: {}", e);
            outbound.notice(GENERATION_FAILED_NOTICE).await;
            return;
        }
    };

    if response.trim().is_empty() {
        tracing::debug!(call_id = %call_id, "empty response, synthesis skipped");
    } else if let Err(e) = stream_synthesis(services, settings, outbound, &response).await {
        tracing::warn!(call_id = %call_id, "synthesis failed: {}", e);
        outbound.notice(SYNTHESIS_FAILED_NOTICE).await;
    }

    let records = vec![
        ContextRecord::new(call_id.clone(), Role::User, text),
        ContextRecord::new(call_id.clone(), Role::Assistant, response),
    ];
    match tokio::time::timeout(settings.context_timeout(), services.context.store(records)).await {
        Ok(Ok(written)) => tracing::debug!(call_id = %call_id, written, "turn stored"),
        Ok(Err(e)) => tracing::warn!(call_id = %call_id, "turn not stored: {}", e),
        Err(_) => tracing::warn!(call_id = %call_id, "turn not stored: context store timed out"),
    }
}

/// Forwards tokens as they arrive and returns the concatenated reply once
/// the generator reports completion.
async fn stream_generation(
    services: &Services,
    settings: &PipelineConfig,
    outbound: &Outbound,
    request: GenerationRequest,
) -> Result<String, VoiceError> {
    let deadline = settings.generation_timeout();
    let generate = async {
        let mut stream = services.generator.generate(request).await?;
        let mut response = String::new();
        let mut tokens = 0usize;
        while let Some(event) = stream.next().await {
            match event? {
                GenerationEvent::Token(token) => {
                    if token.is_empty() {
                        continue;
                    }
                    tokens += 1;
                    response.push_str(&token);
                    outbound.send(OutboundFrame::Token(token)).await;
                }
                GenerationEvent::Done => {
                    outbound.send(OutboundFrame::TextDone).await;
                    tracing::debug!(tokens, "generation complete");
                    return Ok(response);
                }
            }
        }
        Err(VoiceError::Protocol(
            "generation ended without completion".to_string(),
        ))
    };

    tokio::time::timeout(deadline, generate).await.map_err(|_| {
        VoiceError::Timeout(format!(
            "generation did not complete within {} ms",
            deadline.as_millis()
        ))
    })?
}

async fn stream_synthesis(
    services: &Services,
    settings: &PipelineConfig,
    outbound: &Outbound,
    text: &str,
) -> Result<(), VoiceError> {
    let deadline = settings.synthesis_timeout();
    let synthesize = async {
        let mut audio = services.synthesizer.synthesize(text).await?;
        let mut bytes = 0usize;
        while let Some(chunk) = audio.next().await {
            let chunk = chunk?;
            bytes += chunk.len();
            outbound.send(OutboundFrame::Audio(chunk)).await;
        }
        outbound.send(OutboundFrame::AudioDone).await;
        tracing::debug!(bytes, "synthesis complete");
        Ok(())
    };

    tokio::time::timeout(deadline, synthesize).await.map_err(|_| {
        VoiceError::Timeout(format!(
            "synthesis did not complete within {} ms",
            deadline.as_millis()
        ))
    })?
}
