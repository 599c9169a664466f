//! Error types for OpenPath.
//!
//! The taxonomy mirrors how failures are treated: parse problems are
//! document-level only (individual bad lines are skipped), validation and
//! apply failures abort the current cycle into fail-open, and probe
//! failures are inconclusive until they are counted.

use thiserror::Error;

/// The raw whitelist could not be read as a document at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Whitelist too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: usize, max: usize },
}

/// Errors raised while the coordinator mutates enforcement state.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Generated artifact failed validation: {0}")]
    Validation(String),

    #[error("Failed to apply {artifact}: {message}")]
    Apply {
        artifact: &'static str,
        message: String,
    },

    #[error("Whitelist unavailable: {0}")]
    Whitelist(String),

    #[error("State file error: {0}")]
    State(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn apply(artifact: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Apply {
            artifact,
            message: err.to_string(),
        }
    }
}

/// Network-level failure during a health or captive-portal probe.
///
/// Always treated as inconclusive by the caller: only consecutive,
/// counted failures lead to a state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe timed out after {0}s")]
    Timeout(u64),

    #[error("No answer for {0}")]
    NoAnswer(String),

    #[error("Network error: {0}")]
    Network(String),
}
