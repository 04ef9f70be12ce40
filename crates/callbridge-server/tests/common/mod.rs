//! In-process stand-ins for the speech upstreams.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use callbridge_context::{ContextError, ContextStore, Embedder, SqliteIndex};
use callbridge_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use callbridge_server::config::PipelineConfig;
use callbridge_server::session::OutboundFrame;
use callbridge_server::Services;
use callbridge_types::{GenerationRequest, Utterance, CONTEXT_TOP_K};
use callbridge_voice::{
    AudioStream, GenerationEvent, GenerationStream, RecognizerConfig, RecognizerStream,
    ResponseGenerator, SpeechRecognizer, SpeechSynthesizer, VoiceError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Ordered log of upstream calls across all fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// The test's end of one opened recognizer stream.
pub struct OpenedStream {
    pub audio: mpsc::Receiver<Bytes>,
    pub events: mpsc::Sender<Result<Utterance, VoiceError>>,
}

impl OpenedStream {
    pub async fn interim(&self, text: &str) {
        self.events.send(Ok(Utterance::interim(text))).await.unwrap();
    }

    pub async fn final_text(&self, text: &str) {
        self.events.send(Ok(Utterance::final_text(text))).await.unwrap();
    }

    pub async fn fail(&self) {
        self.events
            .send(Err(VoiceError::Timeout("no recognizer response".into())))
            .await
            .unwrap();
    }
}

#[derive(Default)]
pub struct FakeRecognizer {
    pub opens: AtomicUsize,
    pub failing_opens: AtomicUsize,
    streams: Mutex<VecDeque<OpenedStream>>,
}

impl FakeRecognizer {
    /// Waits for the next opened stream.
    pub async fn next_stream(&self) -> OpenedStream {
        for _ in 0..200 {
            if let Some(stream) = self.streams.lock().unwrap().pop_front() {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recognizer stream was never opened");
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn open(&self, config: &RecognizerConfig) -> Result<RecognizerStream, VoiceError> {
        assert!(config.punctuate && config.interim_results);
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VoiceError::Connectivity("recognizer unreachable".into()));
        }
        let (stream, audio, events) = RecognizerStream::channel();
        self.streams
            .lock()
            .unwrap()
            .push_back(OpenedStream { audio, events });
        Ok(stream)
    }
}

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum Step {
    Token(String),
    Done,
    Fail,
    /// Keeps the stream open without sending anything more.
    Stall,
}

impl Step {
    pub fn token(text: &str) -> Self {
        Self::Token(text.to_string())
    }
}

/// Plays queued scripts; without one it answers `Echo: <utterance>`.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
    journal: Journal,
    token_delay: Duration,
}

impl ScriptedGenerator {
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, VoiceError> {
        let user = request.user_text().unwrap_or_default().to_string();
        self.journal.push(format!("generate:{user}"));
        self.requests.lock().unwrap().push(request);

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![Step::token("Echo: "), Step::Token(user.clone()), Step::Done]
        });

        let (tx, rx) = mpsc::channel(16);
        let journal = self.journal.clone();
        let delay = self.token_delay;
        tokio::spawn(async move {
            for step in script {
                tokio::time::sleep(delay).await;
                let (event, last) = match step {
                    Step::Token(token) => (Ok(GenerationEvent::Token(token)), false),
                    Step::Done => {
                        journal.push(format!("generated:{user}"));
                        (Ok(GenerationEvent::Done), true)
                    }
                    Step::Fail => (
                        Err(VoiceError::Protocol("malformed completion chunk".into())),
                        true,
                    ),
                    Step::Stall => {
                        tx.closed().await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() || last {
                    return;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Default)]
pub struct FakeSynthesizer {
    pub calls: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    /// Sends the first chunk, then never finishes.
    pub stall: AtomicBool,
    journal: Journal,
}

impl FakeSynthesizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, VoiceError> {
        self.journal.push(format!("synthesize:{text}"));
        self.calls.lock().unwrap().push(text.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Connectivity("tts unreachable".into()));
        }
        if self.stall.load(Ordering::SeqCst) {
            let first = futures_util::stream::iter(vec![Ok::<_, VoiceError>(Bytes::from_static(
                b"\x01\x02",
            ))]);
            return Ok(Box::pin(first.chain(futures_util::stream::pending())));
        }
        let chunks: Vec<Result<Bytes, VoiceError>> = vec![
            Ok(Bytes::from_static(b"\x01\x02")),
            Ok(Bytes::from_static(b"\x03\x04")),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

const KEYWORDS: [&str; 4] = ["wifi", "router", "price", "hello"];

/// Keyword-count embedder; rejects empty text like the real client.
pub struct KeywordEmbedder {
    journal: Journal,
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ContextError> {
        self.journal.push(format!("embed:{text}"));
        if text.trim().is_empty() {
            return Err(ContextError::EmptyInput("cannot embed empty text".into()));
        }
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = KEYWORDS
            .iter()
            .map(|k| lower.matches(k).count() as f32)
            .collect();
        vector.push(0.1);
        Ok(vector)
    }
}

pub fn test_pipeline() -> PipelineConfig {
    PipelineConfig {
        generation_timeout_ms: 2_000,
        synthesis_timeout_ms: 2_000,
        context_timeout_ms: 2_000,
        interim_finalize_after_ms: 0,
        reopen_backoff_ms: 0,
    }
}

pub struct Harness {
    pub services: Arc<Services>,
    pub recognizer: Arc<FakeRecognizer>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub journal: Journal,
    pub pool: DbPool,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pipeline(test_pipeline())
    }

    pub fn with_pipeline(pipeline: PipelineConfig) -> Self {
        Self::with_settings(pipeline, Duration::ZERO)
    }

    /// Generator pauses `token_delay` before every step.
    pub fn with_token_delay(token_delay: Duration) -> Self {
        Self::with_settings(test_pipeline(), token_delay)
    }

    pub fn with_settings(pipeline: PipelineConfig, token_delay: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("context.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();

        let journal = Journal::default();
        let recognizer = Arc::new(FakeRecognizer::default());
        let generator = Arc::new(ScriptedGenerator {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            journal: journal.clone(),
            token_delay,
        });
        let synthesizer = Arc::new(FakeSynthesizer {
            journal: journal.clone(),
            ..Default::default()
        });
        let embedder = Arc::new(KeywordEmbedder {
            journal: journal.clone(),
        });

        let services = Arc::new(Services {
            recognizer: recognizer.clone(),
            recognizer_config: RecognizerConfig::default(),
            generator: generator.clone(),
            synthesizer: synthesizer.clone(),
            context: ContextStore::new(embedder, Arc::new(SqliteIndex::new(pool.clone()))),
            top_k: CONTEXT_TOP_K,
            pipeline,
        });

        Self {
            services,
            recognizer,
            generator,
            synthesizer,
            journal,
            pool,
            _dir: dir,
        }
    }

    pub fn stored_rows(&self) -> i64 {
        self.pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM context_records", [], |row| row.get(0))
            .unwrap()
    }
}

/// Receives frames until `stop` matches (inclusive), failing after 5 s.
pub async fn collect_until(
    rx: &mut mpsc::Receiver<OutboundFrame>,
    stop: impl Fn(&OutboundFrame) -> bool,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(frame)) => {
                let done = stop(&frame);
                frames.push(frame);
                if done {
                    return frames;
                }
            }
            Ok(None) => panic!("outbound channel closed; got {frames:?}"),
            Err(_) => panic!("timed out waiting for frames; got {frames:?}"),
        }
    }
}

/// Asserts nothing is sent for `ms` milliseconds.
pub async fn assert_quiet(rx: &mut mpsc::Receiver<OutboundFrame>, ms: u64) {
    if let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
        panic!("unexpected frame: {frame:?}");
    }
}
