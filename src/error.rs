//! Error types for nano-chat.

use thiserror::Error;

/// Result type alias for nano-chat operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-chat.
///
/// Unknown tokens during encoding are not errors (they fall back to the
/// unknown id), and a user abort is a normal finish reason.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported parameter combination.
    #[error("configuration error: {0}")]
    Config(String),

    /// Weight file does not match the declared layout.
    #[error("corrupted model weights: {0}")]
    CorruptedWeights(String),

    /// The pipeline saw corrupted weights earlier and refuses further work.
    #[error("pipeline is unusable after a corrupted weight load")]
    PipelineInvalidated,

    /// Cache or position bookkeeping was violated by a caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Malformed vocabulary section.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Session file does not fit the loaded model.
    #[error("session error: {0}")]
    Session(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error leaves the pipeline unusable for later calls.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedWeights(_) | Self::PipelineInvalidated)
    }
}
