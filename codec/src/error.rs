//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding contract data.
///
/// Codec failures are fatal for the entity being processed: the sync engine
/// never retries a decode, it parks the entity for manual review.
#[derive(Error, Debug)]
pub enum CodecError {
    /// CBOR input ended before the value was complete
    #[error("Unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    /// CBOR major type or tag that the plutus data model does not allow
    #[error("Unsupported CBOR item: major type {major} at byte {offset}")]
    UnsupportedItem { major: u8, offset: usize },

    /// Constructor tag outside the compact ranges and not a 102 wrapper
    #[error("Invalid constructor tag {0}")]
    InvalidConstructorTag(u64),

    /// Datum shape does not match the escrow contract
    #[error("Datum mismatch: {0}")]
    DatumMismatch(String),

    /// Redeemer constructor index outside 0..=6
    #[error("Unknown redeemer index {0}")]
    UnknownRedeemer(u64),

    /// Address bytes or bech32 form is malformed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Hex field is malformed or has the wrong length
    #[error("Invalid hex field {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// Transaction builder was given inconsistent inputs
    #[error("Transaction build failed: {0}")]
    TxBuild(String),
}

impl CodecError {
    pub fn invalid_hex(field: &'static str, reason: impl Into<String>) -> Self {
        CodecError::InvalidHex {
            field,
            reason: reason.into(),
        }
    }
}
