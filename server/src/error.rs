//! Engine error taxonomy.
//!
//! Transient errors are retried at the adapter; validation errors surface
//! synchronously to the caller; everything else parks the affected entity
//! and waits for an operator.

use thiserror::Error;

/// Errors from the chain adapter.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Network failure, 5xx, 429 or timeout. Retried with back-off.
    #[error("Transient chain error on {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// Resource does not exist (yet) on the indexer.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The indexer rejected the request or transaction outright.
    #[error("Rejected by chain endpoint: {0}")]
    Rejected(String),

    /// Response did not match the expected shape.
    #[error("Malformed chain response on {operation}: {reason}")]
    Malformed { operation: String, reason: String },
}

impl ChainError {
    pub fn transient(operation: &str, reason: impl std::fmt::Display) -> Self {
        ChainError::Transient {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(operation: &str, reason: impl std::fmt::Display) -> Self {
        ChainError::Malformed {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the retry layer should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient { .. })
    }
}

/// Error classes reported on entities via `next_action.error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityErrorType {
    NetworkError,
    InsufficientFunds,
    InvalidState,
    RolledBack,
    Unknown,
}

impl EntityErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityErrorType::NetworkError => "NetworkError",
            EntityErrorType::InsufficientFunds => "InsufficientFunds",
            EntityErrorType::InvalidState => "InvalidState",
            EntityErrorType::RolledBack => "RolledBack",
            EntityErrorType::Unknown => "Unknown",
        }
    }
}

/// Chain an error note onto a previous one:
/// `prev_note (prev_action) -> new_note`.
pub fn chain_error_note(
    prev_note: Option<&str>,
    prev_action: &str,
    new_note: &str,
) -> String {
    match prev_note {
        Some(prev) if !prev.is_empty() => format!("{prev} ({prev_action}) -> {new_note}"),
        _ => new_note.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChainError::transient("get_tx", "timeout").is_transient());
        assert!(!ChainError::NotFound("tx".into()).is_transient());
        assert!(!ChainError::Rejected("bad cbor".into()).is_transient());
    }

    #[test]
    fn test_error_note_chaining() {
        assert_eq!(
            chain_error_note(None, "WithdrawRequested", "submit failed"),
            "submit failed"
        );
        assert_eq!(
            chain_error_note(Some("submit failed"), "WithdrawRequested", "rolled back"),
            "submit failed (WithdrawRequested) -> rolled back"
        );
    }
}
