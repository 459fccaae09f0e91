//! Redeemer variants for spending the escrow output.
//!
//! The constructor index is what the on-chain validator switches on, so the
//! numbering here is load-bearing and must never be reordered.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::plutus::PlutusData;

/// The seven spending paths of the escrow validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Redeemer {
    Withdraw,
    RequestRefund,
    CancelRefundRequest,
    WithdrawRefund,
    WithdrawDisputed,
    SubmitResult,
    AllowRefund,
}

impl Redeemer {
    pub fn constructor_index(&self) -> u64 {
        match self {
            Redeemer::Withdraw => 0,
            Redeemer::RequestRefund => 1,
            Redeemer::CancelRefundRequest => 2,
            Redeemer::WithdrawRefund => 3,
            Redeemer::WithdrawDisputed => 4,
            Redeemer::SubmitResult => 5,
            Redeemer::AllowRefund => 6,
        }
    }

    pub fn from_constructor_index(tag: u64) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Redeemer::Withdraw),
            1 => Ok(Redeemer::RequestRefund),
            2 => Ok(Redeemer::CancelRefundRequest),
            3 => Ok(Redeemer::WithdrawRefund),
            4 => Ok(Redeemer::WithdrawDisputed),
            5 => Ok(Redeemer::SubmitResult),
            6 => Ok(Redeemer::AllowRefund),
            other => Err(CodecError::UnknownRedeemer(other)),
        }
    }

    pub fn to_plutus(&self) -> PlutusData {
        PlutusData::unit_constr(self.constructor_index())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_plutus().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Redeemer, CodecError> {
        let (tag, fields) = PlutusData::decode(bytes)?.as_constr().map(|(t, f)| (t, f.to_vec()))?;
        if !fields.is_empty() {
            return Err(CodecError::DatumMismatch(
                "redeemer carries unexpected fields".into(),
            ));
        }
        Self::from_constructor_index(tag)
    }

    pub fn decode_hex(hex_str: &str) -> Result<Redeemer, CodecError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CodecError::invalid_hex("redeemer", e.to_string()))?;
        Self::decode(&bytes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Redeemer::Withdraw => "Withdraw",
            Redeemer::RequestRefund => "RequestRefund",
            Redeemer::CancelRefundRequest => "CancelRefundRequest",
            Redeemer::WithdrawRefund => "WithdrawRefund",
            Redeemer::WithdrawDisputed => "WithdrawDisputed",
            Redeemer::SubmitResult => "SubmitResult",
            Redeemer::AllowRefund => "AllowRefund",
        }
    }
}

impl std::fmt::Display for Redeemer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Redeemer; 7] = [
        Redeemer::Withdraw,
        Redeemer::RequestRefund,
        Redeemer::CancelRefundRequest,
        Redeemer::WithdrawRefund,
        Redeemer::WithdrawDisputed,
        Redeemer::SubmitResult,
        Redeemer::AllowRefund,
    ];

    #[test]
    fn test_indices_are_stable() {
        for (expected, redeemer) in ALL.iter().enumerate() {
            assert_eq!(redeemer.constructor_index(), expected as u64);
        }
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for redeemer in ALL {
            assert_eq!(Redeemer::decode(&redeemer.encode()).unwrap(), redeemer);
        }
    }

    #[test]
    fn test_unknown_index_rejected() {
        let bytes = PlutusData::unit_constr(7).encode();
        assert!(matches!(
            Redeemer::decode(&bytes),
            Err(CodecError::UnknownRedeemer(7))
        ));
    }
}
