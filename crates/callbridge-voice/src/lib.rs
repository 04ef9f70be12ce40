//! Upstream voice services for callbridge.
//!
//! Three streaming contracts sit behind traits so a call session can pipeline
//! them without knowing which vendor answers:
//!
//! - [`SpeechRecognizer`]: duplex speech-to-text; audio in, [`Utterance`]
//!   events (interim and final) out.
//! - [`ResponseGenerator`]: chat completion streamed token by token, with a
//!   distinct completion event.
//! - [`SpeechSynthesizer`]: complete text in, ordered audio chunks out.
//!
//! Each trait has one production backend (Deepgram, OpenAI, ElevenLabs).
//!
//! [`Utterance`]: callbridge_types::Utterance

pub mod agent;
pub mod config;
pub mod error;
pub mod stt;
pub mod tts;

pub use agent::{GenerationEvent, GenerationStream, OpenAiGenerator, ResponseGenerator};
pub use config::{DeepgramConfig, ElevenLabsConfig, OpenAiConfig, RecognizerConfig};
pub use error::VoiceError;
pub use stt::{
    DeepgramRecognizer, RecognizerHandle, RecognizerStream, SpeechRecognizer, UtteranceStream,
};
pub use tts::{AudioStream, ElevenLabsSynthesizer, SpeechSynthesizer};
