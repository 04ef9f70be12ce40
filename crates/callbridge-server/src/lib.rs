//! callbridge server library logic.

pub mod api_ws;
pub mod config;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use callbridge_context::{
    ContextError, ContextStore, OpenAiEmbedder, PineconeIndex, SqliteIndex, VectorIndex,
};
use callbridge_db::DbPool;
use callbridge_voice::{
    DeepgramRecognizer, ElevenLabsSynthesizer, OpenAiGenerator, RecognizerConfig,
    ResponseGenerator, SpeechRecognizer, SpeechSynthesizer,
};
use config::{Config, ContextBackend, PipelineConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Upstream clients and pipeline settings shared by every call session.
///
/// Built once at startup; sessions only ever read it.
pub struct Services {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub recognizer_config: RecognizerConfig,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub context: ContextStore,
    /// Prior turns retrieved per utterance.
    pub top_k: usize,
    pub pipeline: PipelineConfig,
}

impl Services {
    /// Builds the production clients described by `config`.
    ///
    /// `pool` backs the local context index and must already be migrated.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::Index` if the hosted index cannot be set up.
    pub fn from_config(config: &Config, pool: DbPool) -> Result<Self, ContextError> {
        let index: Arc<dyn VectorIndex> = match config.context.backend {
            ContextBackend::Sqlite => Arc::new(SqliteIndex::new(pool)),
            ContextBackend::Pinecone => {
                Arc::new(PineconeIndex::new(config.context.pinecone.clone())?)
            }
        };
        let embedder = Arc::new(OpenAiEmbedder::new(config.context.embedding.clone()));

        Ok(Self {
            recognizer: Arc::new(DeepgramRecognizer::new(config.voice.deepgram.clone())),
            recognizer_config: config.voice.recognizer,
            generator: Arc::new(OpenAiGenerator::new(config.voice.openai.clone())),
            synthesizer: Arc::new(ElevenLabsSynthesizer::new(
                config.voice.elevenlabs.clone(),
            )),
            context: ContextStore::new(embedder, index),
            top_k: config.context.top_k,
            pipeline: config.pipeline.clone(),
        })
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
