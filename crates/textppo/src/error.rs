//! Error types for PPO training.
//!
//! Precondition and configuration problems fail eagerly; numerical
//! instability is fatal and carries step context; collaborator failures
//! (scorer, generation, tokenizer) are propagated unchanged so callers
//! can decide whether to retry the batch.

use thiserror::Error;

/// Main error type for PPO training operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PpoError {
    /// Configuration validation failures.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Length sampler constructed with an empty interval.
    #[error("Invalid length range: [{min}, {max}) is empty")]
    InvalidRange { min: usize, max: usize },

    /// `step()` called with mismatched batch components.
    #[error(
        "Batch mismatch: expected {expected} examples, got {queries} queries, \
         {responses} responses, {scores} scores"
    )]
    BatchMismatch {
        expected: usize,
        queries: usize,
        responses: usize,
        scores: usize,
    },

    /// A response outside the configured generation bounds.
    #[error("Response {index} has {len} tokens, outside [1, {max})")]
    ResponseLength {
        index: usize,
        len: usize,
        max: usize,
    },

    /// Scorer returned a NaN or infinite reward.
    #[error("Non-finite reward {value} for example {index}")]
    NonFiniteReward { index: usize, value: f64 },

    /// NaN or infinite value inside the optimization step.
    #[error("Non-finite {what} at step {step}, minibatch {minibatch}")]
    NonFinite {
        what: String,
        step: usize,
        minibatch: usize,
    },

    /// Text scorer collaborator failures.
    #[error("Scorer error: {0}")]
    Scorer(String),

    /// Policy generation failures.
    #[error("Generation error: {0}")]
    Generation(String),

    /// Tokenizer encode/decode failures.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Errors from the Candle tensor library.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O errors with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// Checkpoint save/load failures.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },
}

/// Result type alias for PPO training operations.
pub type PpoResult<T> = std::result::Result<T, PpoError>;

impl PpoError {
    /// Whether the error came from an external collaborator, so the
    /// surrounding orchestration may retry the batch.
    pub fn is_collaborator(&self) -> bool {
        matches!(
            self,
            PpoError::Scorer(_) | PpoError::Generation(_) | PpoError::Tokenizer(_)
        )
    }

    /// Get the path associated with this error (if any).
    pub fn path(&self) -> Option<&str> {
        match self {
            PpoError::Checkpoint { path, .. } => Some(path),
            PpoError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PpoError {
    fn from(err: std::io::Error) -> Self {
        PpoError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> PpoResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> PpoResult<T> {
        self.map_err(|e| PpoError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> PpoError {
    PpoError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors.
pub fn config_error(message: impl Into<String>) -> PpoError {
    PpoError::Config(message.into())
}
