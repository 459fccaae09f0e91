//! Shelley address handling: bech32 wire form, header decomposition, and the
//! nested constructor-term form the escrow datum embeds.
//!
//! The datum carries each party's address as the ledger-api `Address` type:
//! a payment credential plus an optional staking credential, both encoded as
//! constructor terms. The byte form has to match what the on-chain validator
//! compares, so the encoding is fixed here and round-trip tested.

use bech32::{FromBase32, ToBase32, Variant};

use crate::error::CodecError;
use crate::network::Network;
use crate::plutus::PlutusData;

/// Length of a blake2b-224 credential hash.
pub const KEY_HASH_LEN: usize = 28;

/// A payment or staking credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Key-hash credential (constructor 0 in the datum form).
    Key([u8; KEY_HASH_LEN]),
    /// Script-hash credential (constructor 1).
    Script([u8; KEY_HASH_LEN]),
}

impl Credential {
    pub fn hash(&self) -> &[u8; KEY_HASH_LEN] {
        match self {
            Credential::Key(h) | Credential::Script(h) => h,
        }
    }

    fn to_plutus(&self) -> PlutusData {
        let (tag, hash) = match self {
            Credential::Key(h) => (0, h),
            Credential::Script(h) => (1, h),
        };
        PlutusData::Constr {
            tag,
            fields: vec![PlutusData::Bytes(hash.to_vec())],
        }
    }

    fn from_plutus(data: &PlutusData) -> Result<Credential, CodecError> {
        let (tag, fields) = data.as_constr()?;
        if fields.len() != 1 {
            return Err(CodecError::DatumMismatch(
                "credential must carry exactly one hash".into(),
            ));
        }
        let bytes = fields[0].as_bytes()?;
        let hash: [u8; KEY_HASH_LEN] = bytes.try_into().map_err(|_| {
            CodecError::DatumMismatch(format!("credential hash length {}", bytes.len()))
        })?;
        match tag {
            0 => Ok(Credential::Key(hash)),
            1 => Ok(Credential::Script(hash)),
            other => Err(CodecError::DatumMismatch(format!(
                "credential constructor {other}"
            ))),
        }
    }
}

/// A Shelley payment address as the escrow contract sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub payment: Credential,
    pub stake: Option<Credential>,
}

impl Address {
    pub fn from_key_hash(hash: [u8; KEY_HASH_LEN], stake: Option<[u8; KEY_HASH_LEN]>) -> Self {
        Address {
            payment: Credential::Key(hash),
            stake: stake.map(Credential::Key),
        }
    }

    /// Header byte of the CIP-19 binary form.
    fn header(&self, network: Network) -> u8 {
        let type_nibble: u8 = match (&self.payment, &self.stake) {
            (Credential::Key(_), Some(Credential::Key(_))) => 0b0000,
            (Credential::Script(_), Some(Credential::Key(_))) => 0b0001,
            (Credential::Key(_), Some(Credential::Script(_))) => 0b0010,
            (Credential::Script(_), Some(Credential::Script(_))) => 0b0011,
            (Credential::Key(_), None) => 0b0110,
            (Credential::Script(_), None) => 0b0111,
        };
        (type_nibble << 4) | network.network_id()
    }

    /// Binary (header ++ payment ++ stake) form.
    pub fn to_bytes(&self, network: Network) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * KEY_HASH_LEN);
        out.push(self.header(network));
        out.extend_from_slice(self.payment.hash());
        if let Some(stake) = &self.stake {
            out.extend_from_slice(stake.hash());
        }
        out
    }

    /// Bech32 wire form (`addr1...` / `addr_test1...`).
    pub fn to_bech32(&self, network: Network) -> String {
        let bytes = self.to_bytes(network);
        bech32::encode(network.address_hrp(), bytes.to_base32(), Variant::Bech32)
            .expect("hrp is static and valid")
    }

    /// Parse a bech32 payment address, verifying the network prefix.
    pub fn from_bech32(s: &str) -> Result<(Address, Network), CodecError> {
        let (hrp, data, _variant) =
            bech32::decode(s).map_err(|e| CodecError::InvalidAddress(e.to_string()))?;
        let network = match hrp.as_str() {
            "addr" => Network::Mainnet,
            "addr_test" => Network::Preprod,
            other => {
                return Err(CodecError::InvalidAddress(format!(
                    "unsupported address prefix {other}"
                )))
            }
        };
        let bytes =
            Vec::<u8>::from_base32(&data).map_err(|e| CodecError::InvalidAddress(e.to_string()))?;
        let address = Address::from_header_bytes(&bytes)?;
        Ok((address, network))
    }

    fn from_header_bytes(bytes: &[u8]) -> Result<Address, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::InvalidAddress("empty address bytes".into()));
        }
        let type_nibble = bytes[0] >> 4;
        let body = &bytes[1..];
        let take_hash = |slice: &[u8]| -> Result<[u8; KEY_HASH_LEN], CodecError> {
            slice
                .try_into()
                .map_err(|_| CodecError::InvalidAddress(format!("hash length {}", slice.len())))
        };
        let (payment_is_script, stake_kind) = match type_nibble {
            0b0000 => (false, Some(false)),
            0b0001 => (true, Some(false)),
            0b0010 => (false, Some(true)),
            0b0011 => (true, Some(true)),
            0b0110 => (false, None),
            0b0111 => (true, None),
            other => {
                return Err(CodecError::InvalidAddress(format!(
                    "unsupported address type {other:#x}"
                )))
            }
        };
        let expected = KEY_HASH_LEN * if stake_kind.is_some() { 2 } else { 1 };
        if body.len() != expected {
            return Err(CodecError::InvalidAddress(format!(
                "address body length {} (expected {expected})",
                body.len()
            )));
        }
        let payment_hash = take_hash(&body[..KEY_HASH_LEN])?;
        let payment = if payment_is_script {
            Credential::Script(payment_hash)
        } else {
            Credential::Key(payment_hash)
        };
        let stake = match stake_kind {
            None => None,
            Some(is_script) => {
                let hash = take_hash(&body[KEY_HASH_LEN..])?;
                Some(if is_script {
                    Credential::Script(hash)
                } else {
                    Credential::Key(hash)
                })
            }
        };
        Ok(Address { payment, stake })
    }

    /// The nested constructor form embedded in the escrow datum:
    /// `Constr 0 [payment_credential, maybe_staking_credential]` where the
    /// staking side wraps the credential as `StakingHash`.
    pub fn to_plutus(&self) -> PlutusData {
        let stake = match &self.stake {
            Some(cred) => PlutusData::Constr {
                tag: 0,
                fields: vec![PlutusData::Constr {
                    tag: 0,
                    fields: vec![cred.to_plutus()],
                }],
            },
            None => PlutusData::unit_constr(1),
        };
        PlutusData::Constr {
            tag: 0,
            fields: vec![self.payment.to_plutus(), stake],
        }
    }

    pub fn from_plutus(data: &PlutusData) -> Result<Address, CodecError> {
        let (tag, fields) = data.as_constr()?;
        if tag != 0 || fields.len() != 2 {
            return Err(CodecError::DatumMismatch(
                "address must be constructor 0 with two fields".into(),
            ));
        }
        let payment = Credential::from_plutus(&fields[0])?;
        let (stake_tag, stake_fields) = fields[1].as_constr()?;
        let stake = match stake_tag {
            1 => None,
            0 => {
                let (inner_tag, inner_fields) = stake_fields
                    .first()
                    .ok_or_else(|| CodecError::DatumMismatch("missing staking hash".into()))?
                    .as_constr()?;
                if inner_tag != 0 || inner_fields.len() != 1 {
                    return Err(CodecError::DatumMismatch(
                        "staking credential must be StakingHash".into(),
                    ));
                }
                Some(Credential::from_plutus(&inner_fields[0])?)
            }
            other => {
                return Err(CodecError::DatumMismatch(format!(
                    "maybe-staking constructor {other}"
                )))
            }
        };
        Ok(Address { payment, stake })
    }
}

/// Parse a 56-hex-char verification key hash.
pub fn vkey_hash_from_hex(hex_str: &str) -> Result<[u8; KEY_HASH_LEN], CodecError> {
    let bytes =
        hex::decode(hex_str).map_err(|e| CodecError::invalid_hex("vkey", e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CodecError::invalid_hex("vkey", format!("length {} bytes", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> [u8; KEY_HASH_LEN] {
        [byte; KEY_HASH_LEN]
    }

    #[test]
    fn test_bech32_roundtrip_base_address() {
        let addr = Address::from_key_hash(hash(0x11), Some(hash(0x22)));
        let encoded = addr.to_bech32(Network::Preprod);
        assert!(encoded.starts_with("addr_test1"));
        let (decoded, network) = Address::from_bech32(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(network, Network::Preprod);
    }

    #[test]
    fn test_bech32_roundtrip_enterprise_script() {
        let addr = Address {
            payment: Credential::Script(hash(0x33)),
            stake: None,
        };
        let encoded = addr.to_bech32(Network::Mainnet);
        assert!(encoded.starts_with("addr1"));
        let (decoded, network) = Address::from_bech32(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(network, Network::Mainnet);
    }

    #[test]
    fn test_plutus_roundtrip_with_stake() {
        let addr = Address::from_key_hash(hash(0x44), Some(hash(0x55)));
        let data = addr.to_plutus();
        assert_eq!(Address::from_plutus(&data).unwrap(), addr);
    }

    #[test]
    fn test_plutus_roundtrip_without_stake() {
        let addr = Address::from_key_hash(hash(0x66), None);
        let data = addr.to_plutus();
        assert_eq!(Address::from_plutus(&data).unwrap(), addr);
    }

    #[test]
    fn test_rejects_wrong_hash_length() {
        assert!(vkey_hash_from_hex("aabb").is_err());
        assert!(vkey_hash_from_hex(&"aa".repeat(28)).is_ok());
    }
}
