use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// Upstream unreachable or the connection dropped.
    #[error("upstream connection error: {0}")]
    Connectivity(String),

    /// Upstream did not answer within its deadline.
    #[error("upstream timed out: {0}")]
    Timeout(String),

    /// Upstream sent something we could not interpret.
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("input too large: {0}")]
    InputTooLarge(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The stream handle was already closed.
    #[error("stream closed")]
    Closed,
}

impl VoiceError {
    /// Whether the failure is transport-level (unreachable or timed out).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Connectivity(e.to_string())
        }
    }
}
