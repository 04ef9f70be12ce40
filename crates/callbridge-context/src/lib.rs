//! Conversation context for callbridge.
//!
//! Turns of a call are embedded and written to a vector index, then
//! retrieved by similarity to ground later replies. Two indexes are
//! provided: [`SqliteIndex`] over the local database and [`PineconeIndex`]
//! for a hosted index.

pub mod embedding;
pub mod error;
pub mod index;
pub mod remote;
pub mod store;

pub use embedding::{Embedder, EmbeddingConfig, OpenAiEmbedder};
pub use error::ContextError;
pub use index::{cosine_similarity, ScoredRecord, SqliteIndex, VectorIndex};
pub use remote::{PineconeConfig, PineconeIndex};
pub use store::ContextStore;
