//! Error types for the conversation-context layer.

/// Errors that can occur while embedding, indexing, or retrieving context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Embedding text that is empty or whitespace-only.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// The embedding backend failed or returned an unusable vector.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// A context lookup failed; callers treat this as "no context".
    #[error("context retrieval failed: {0}")]
    Retrieval(String),

    /// A batch could not be fully prepared, so none of it was written.
    #[error("context write aborted, nothing stored: {0}")]
    PartialWrite(String),

    /// The vector index rejected or failed an operation.
    #[error("vector index error: {0}")]
    Index(String),

    #[error("context database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("context pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
