//! The escrow datum: contract parameters plus logical state, attached inline
//! to the script output.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::CodecError;
use crate::plutus::PlutusData;

/// Logical contract state encoded in the datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmartContractState {
    FundsLocked,
    ResultSubmitted,
    RefundRequested,
    Disputed,
}

impl SmartContractState {
    pub fn constructor_index(&self) -> u64 {
        match self {
            SmartContractState::FundsLocked => 0,
            SmartContractState::ResultSubmitted => 1,
            SmartContractState::RefundRequested => 2,
            SmartContractState::Disputed => 3,
        }
    }

    pub fn from_constructor_index(tag: u64) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(SmartContractState::FundsLocked),
            1 => Ok(SmartContractState::ResultSubmitted),
            2 => Ok(SmartContractState::RefundRequested),
            3 => Ok(SmartContractState::Disputed),
            other => Err(CodecError::DatumMismatch(format!(
                "contract state constructor {other}"
            ))),
        }
    }
}

/// Full escrow datum.
///
/// Field order mirrors the on-chain constructor: buyer, seller, identifier,
/// result, deadlines, cooldowns, state, input hash, collateral return.
/// All times are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowDatum {
    pub buyer_vkey: [u8; 28],
    pub buyer_address: Address,
    pub seller_vkey: [u8; 28],
    pub seller_address: Address,
    /// Opaque buyer-authored handle, UTF-8.
    pub blockchain_identifier: String,
    /// Hex result hash, empty until the seller submits.
    pub result_hash: String,
    pub result_time: u64,
    pub unlock_time: u64,
    pub external_dispute_unlock_time: u64,
    pub pay_by_time: u64,
    pub buyer_cooldown_time: u64,
    pub seller_cooldown_time: u64,
    pub state: SmartContractState,
    /// Hex SHA-256 of the request payload.
    pub input_hash: String,
    pub collateral_return_lovelace: u64,
}

impl EscrowDatum {
    pub fn to_plutus(&self) -> PlutusData {
        PlutusData::Constr {
            tag: 0,
            fields: vec![
                PlutusData::Bytes(self.buyer_vkey.to_vec()),
                self.buyer_address.to_plutus(),
                PlutusData::Bytes(self.seller_vkey.to_vec()),
                self.seller_address.to_plutus(),
                PlutusData::from_str_bytes(&self.blockchain_identifier),
                PlutusData::from_str_bytes(&self.result_hash),
                PlutusData::Int(self.result_time),
                PlutusData::Int(self.unlock_time),
                PlutusData::Int(self.external_dispute_unlock_time),
                PlutusData::Int(self.pay_by_time),
                PlutusData::Int(self.buyer_cooldown_time),
                PlutusData::Int(self.seller_cooldown_time),
                PlutusData::unit_constr(self.state.constructor_index()),
                PlutusData::from_str_bytes(&self.input_hash),
                PlutusData::Int(self.collateral_return_lovelace),
            ],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_plutus().encode()
    }

    pub fn from_plutus(data: &PlutusData) -> Result<EscrowDatum, CodecError> {
        let (tag, fields) = data.as_constr()?;
        if tag != 0 {
            return Err(CodecError::DatumMismatch(format!(
                "datum constructor {tag}"
            )));
        }
        if fields.len() != 15 {
            return Err(CodecError::DatumMismatch(format!(
                "datum has {} fields, expected 15",
                fields.len()
            )));
        }
        let vkey = |idx: usize, name: &'static str| -> Result<[u8; 28], CodecError> {
            fields[idx]
                .as_bytes()?
                .try_into()
                .map_err(|_| CodecError::DatumMismatch(format!("{name} is not 28 bytes")))
        };
        let utf8 = |idx: usize, name: &'static str| -> Result<String, CodecError> {
            String::from_utf8(fields[idx].as_bytes()?.to_vec())
                .map_err(|_| CodecError::DatumMismatch(format!("{name} is not UTF-8")))
        };
        let (state_tag, state_fields) = fields[12].as_constr()?;
        if !state_fields.is_empty() {
            return Err(CodecError::DatumMismatch(
                "contract state carries unexpected fields".into(),
            ));
        }
        Ok(EscrowDatum {
            buyer_vkey: vkey(0, "buyer_vkey")?,
            buyer_address: Address::from_plutus(&fields[1])?,
            seller_vkey: vkey(2, "seller_vkey")?,
            seller_address: Address::from_plutus(&fields[3])?,
            blockchain_identifier: utf8(4, "blockchain_identifier")?,
            result_hash: utf8(5, "result_hash")?,
            result_time: fields[6].as_int()?,
            unlock_time: fields[7].as_int()?,
            external_dispute_unlock_time: fields[8].as_int()?,
            pay_by_time: fields[9].as_int()?,
            buyer_cooldown_time: fields[10].as_int()?,
            seller_cooldown_time: fields[11].as_int()?,
            state: SmartContractState::from_constructor_index(state_tag)?,
            input_hash: utf8(13, "input_hash")?,
            collateral_return_lovelace: fields[14].as_int()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<EscrowDatum, CodecError> {
        Self::from_plutus(&PlutusData::decode(bytes)?)
    }

    pub fn decode_hex(hex_str: &str) -> Result<EscrowDatum, CodecError> {
        Self::from_plutus(&PlutusData::decode_hex(hex_str)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    pub(crate) fn sample_datum() -> EscrowDatum {
        EscrowDatum {
            buyer_vkey: [0x11; 28],
            buyer_address: Address::from_key_hash([0x11; 28], Some([0x12; 28])),
            seller_vkey: [0x21; 28],
            seller_address: Address::from_key_hash([0x21; 28], None),
            blockchain_identifier: format!("{}0123456789abcdef0123", "b".repeat(64)),
            result_hash: String::new(),
            result_time: 1_700_000_120_000,
            unlock_time: 1_700_000_180_000,
            external_dispute_unlock_time: 1_700_000_240_000,
            pay_by_time: 1_700_000_110_000,
            buyer_cooldown_time: 0,
            seller_cooldown_time: 0,
            state: SmartContractState::FundsLocked,
            input_hash: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .into(),
            collateral_return_lovelace: 0,
        }
    }

    #[test]
    fn test_datum_roundtrip() {
        let datum = sample_datum();
        let decoded = EscrowDatum::decode(&datum.encode()).unwrap();
        assert_eq!(decoded, datum);
    }

    #[test]
    fn test_datum_roundtrip_with_result() {
        let mut datum = sample_datum();
        datum.result_hash = "ff00".repeat(16);
        datum.state = SmartContractState::ResultSubmitted;
        datum.collateral_return_lovelace = 5_000_000;
        let decoded = EscrowDatum::decode(&datum.encode()).unwrap();
        assert_eq!(decoded, datum);
    }

    #[test]
    fn test_identifier_longer_than_chunk_limit_survives() {
        let datum = sample_datum();
        assert!(datum.blockchain_identifier.len() > 64);
        let decoded = EscrowDatum::decode(&datum.encode()).unwrap();
        assert_eq!(decoded.blockchain_identifier, datum.blockchain_identifier);
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let PlutusData::Constr { tag, mut fields } = sample_datum().to_plutus() else {
            unreachable!()
        };
        fields.pop();
        let truncated = PlutusData::Constr { tag, fields };
        assert!(EscrowDatum::from_plutus(&truncated).is_err());
    }
}
