//! Centralized error types for hint-rs.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Main error type for hint-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HintError {
    /// Construction-time configuration problem: channel count incompatible
    /// with the recursion depth rule, spatial rank not 2/3, zero widths.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Runtime shape violation: odd axis where even is required, rank
    /// mismatch between paired calls, out-of-range split index.
    #[error("Shape error in {op}: {reason}")]
    Shape { op: &'static str, reason: String },

    /// Tensor rank does not match the configured spatial rank.
    #[error("Rank mismatch: expected rank {expected}, got shape {actual:?}")]
    RankMismatch { expected: usize, actual: Vec<usize> },

    /// Unknown or unsupported squeeze pattern (e.g. checkerboard in 3-D).
    #[error("Unsupported pattern: {0}")]
    UnsupportedPattern(String),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, HintError>;

impl HintError {
    /// Shorthand for a shape violation at a named operation.
    pub fn shape(op: &'static str, reason: impl Into<String>) -> Self {
        HintError::Shape {
            op,
            reason: reason.into(),
        }
    }

    /// True for errors that can only be fixed by changing construction
    /// parameters (as opposed to the tensors passed to a call).
    pub fn is_config(&self) -> bool {
        matches!(self, HintError::Config(_))
    }
}
