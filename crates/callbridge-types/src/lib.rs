//! Shared types for the callbridge workspace.
//!
//! This crate holds the call-level data model that every other crate speaks:
//! transcribed utterances, conversation context records, generation requests,
//! agent personas, and the session connection state.
//!
//! No crate in the workspace depends on anything *except* `callbridge-types`
//! for cross-cutting type definitions. This keeps the dependency graph clean
//! and prevents circular dependencies.

pub mod persona;

pub use persona::Persona;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of prior context records included in a generation request.
pub const CONTEXT_TOP_K: usize = 5;

/// Speaker role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona instructions for the language model.
    System,
    /// The caller.
    User,
    /// The generated reply.
    Assistant,
}

impl Role {
    /// Returns the wire label used by chat-completion APIs and the context index.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket accepted, upstream streams not yet opened.
    #[default]
    Connecting,
    /// Receiving audio and running pipelines.
    Active,
    /// Socket gone; owned streams are being finalized.
    Closing,
    /// All owned streams released.
    Closed,
}

/// A transcription event emitted by a speech recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// Only final utterances trigger a response pipeline.
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            timestamp: Utc::now(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            timestamp: Utc::now(),
        }
    }
}

/// One stored conversation turn, scoped to a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: String,
    pub call_id: String,
    pub role: Role,
    pub text: String,
    /// Empty until the context store embeds the record on write.
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl ContextRecord {
    /// Creates an unembedded record with a fresh identifier.
    pub fn new(call_id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        let call_id = call_id.into();
        Self {
            id: format!("{}-{}-{}", role.as_str(), call_id, Uuid::new_v4()),
            call_id,
            role,
            text: text.into(),
            embedding: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// A role-tagged message in a chat-completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered prompt sent to a response generator.
///
/// Always shaped as: system persona, then up to [`CONTEXT_TOP_K`] prior
/// context records (most relevant first), then the current user utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
}

impl GenerationRequest {
    /// Builds a request from a persona, retrieved context, and the caller's utterance.
    ///
    /// Context beyond [`CONTEXT_TOP_K`] records is ignored.
    pub fn build(persona: Persona, context: &[ContextRecord], utterance: &str) -> Self {
        let mut messages = Vec::with_capacity(context.len().min(CONTEXT_TOP_K) + 2);
        messages.push(ChatMessage::new(Role::System, persona.system_prompt()));
        messages.extend(
            context
                .iter()
                .take(CONTEXT_TOP_K)
                .map(|record| ChatMessage::new(record.role, record.text.clone())),
        );
        messages.push(ChatMessage::new(Role::User, utterance));
        Self { messages }
    }

    /// The current user utterance (last message).
    pub fn user_text(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Structured metadata frame sent by the telephony gateway.
///
/// Both fields are optional; absent fields leave the session unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallMetadata {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

impl CallMetadata {
    /// Parses a gateway text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
