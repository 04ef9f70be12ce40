//! Drives the completion and synthesis clients against in-process HTTP
//! backends.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use callbridge_types::{GenerationRequest, Persona};
use callbridge_voice::{
    ElevenLabsConfig, ElevenLabsSynthesizer, GenerationEvent, OpenAiConfig, OpenAiGenerator,
    ResponseGenerator, SpeechSynthesizer, VoiceError,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    voices: Arc<Mutex<Vec<String>>>,
}

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Try \"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"restarting.\"}}]}\n\n",
    "data: [DONE]\n\n",
);

async fn completions(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    recorded.requests.lock().unwrap().push((headers, body));
    if model == "broken" {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY).into_response()
}

async fn text_to_speech(
    State(recorded): State<Recorded>,
    Path(voice_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    recorded.voices.lock().unwrap().push(voice_id);
    recorded.queries.lock().unwrap().push(query);
    recorded.requests.lock().unwrap().push((headers, body));
    (
        [(header::CONTENT_TYPE, "audio/pcm")],
        vec![1u8, 2, 3, 4, 5, 6, 7, 8],
    )
}

async fn spawn_backend() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/v1/text-to-speech/{voice_id}/stream", post(text_to_speech))
        .with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

#[tokio::test]
async fn generator_streams_tokens_then_done() {
    let (addr, recorded) = spawn_backend().await;
    let generator = OpenAiGenerator::new(OpenAiConfig {
        base_url: format!("http://{}/v1", addr),
        api_key: "sk-test".to_string(),
        max_tokens: Some(150),
        temperature: Some(0.7),
        ..Default::default()
    });

    let request = GenerationRequest::build(Persona::Technical, &[], "my wifi is down");
    let mut stream = generator.generate(request).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.unwrap());
    }
    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("Try ".to_string()),
            GenerationEvent::Token("restarting.".to_string()),
            GenerationEvent::Done,
        ]
    );

    let requests = recorded.requests.lock().unwrap();
    let (headers, body) = &requests[0];
    assert_eq!(
        headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer sk-test"
    );
    assert_eq!(body["model"], "gpt-4o-2024-11-20");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 150);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(
        body["messages"][0]["content"],
        Persona::Technical.system_prompt()
    );
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "my wifi is down");
}

#[tokio::test]
async fn generator_rejected_request_is_a_connectivity_error() {
    let (addr, _recorded) = spawn_backend().await;
    let generator = OpenAiGenerator::new(OpenAiConfig {
        base_url: format!("http://{}/v1", addr),
        model: "broken".to_string(),
        ..Default::default()
    });

    let request = GenerationRequest::build(Persona::General, &[], "hello");
    match generator.generate(request).await {
        Err(VoiceError::Connectivity(msg)) => assert!(msg.contains("401")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("a rejected request must not yield a stream"),
    }
}

#[tokio::test]
async fn synthesizer_streams_audio_with_voice_settings() {
    let (addr, recorded) = spawn_backend().await;
    let synthesizer = ElevenLabsSynthesizer::new(ElevenLabsConfig {
        base_url: format!("http://{}", addr),
        api_key: "xi-test".to_string(),
        voice_id: "voice-7".to_string(),
        ..Default::default()
    });

    let mut audio = synthesizer.synthesize("Try restarting.").await.unwrap();
    let mut received = Vec::new();
    while let Some(chunk) = audio.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received, vec![1u8, 2, 3, 4, 5, 6, 7, 8]);

    assert_eq!(recorded.voices.lock().unwrap().as_slice(), ["voice-7"]);
    assert_eq!(
        recorded.queries.lock().unwrap()[0]
            .get("output_format")
            .map(String::as_str),
        Some("pcm_16000")
    );
    let requests = recorded.requests.lock().unwrap();
    let (headers, body) = &requests[0];
    assert_eq!(headers.get("xi-api-key").unwrap(), "xi-test");
    assert_eq!(body["text"], "Try restarting.");
    assert_eq!(body["voice_settings"]["stability"], 0.75);
    assert_eq!(body["voice_settings"]["similarity_boost"], 0.8);
}

#[tokio::test]
async fn synthesizer_rejects_empty_text_without_calling_backend() {
    let (addr, recorded) = spawn_backend().await;
    let synthesizer = ElevenLabsSynthesizer::new(ElevenLabsConfig {
        base_url: format!("http://{}", addr),
        ..Default::default()
    });

    assert!(matches!(
        synthesizer.synthesize("").await,
        Err(VoiceError::EmptyInput(_))
    ));
    assert!(recorded.requests.lock().unwrap().is_empty());
}
