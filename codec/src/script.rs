//! Script hashing and address derivation.
//!
//! The deployment record stores the final compiled validator (parameters
//! already applied). From those bytes everything else is derived: the script
//! hash doubles as the minting policy id, and the enterprise script address
//! is the escrow address the sync loop watches.

use blake2::digest::consts::{U28, U32};
use blake2::{Blake2b, Digest};

use crate::address::{Address, Credential, KEY_HASH_LEN};
use crate::network::Network;

type Blake2b224 = Blake2b<U28>;
type Blake2b256 = Blake2b<U32>;

/// Language tag prepended before hashing a PlutusV2 script.
const PLUTUS_V2_TAG: u8 = 0x02;

/// blake2b-224 hash of a compiled PlutusV2 script.
pub fn script_hash(compiled: &[u8]) -> [u8; KEY_HASH_LEN] {
    let mut hasher = Blake2b224::new();
    hasher.update([PLUTUS_V2_TAG]);
    hasher.update(compiled);
    hasher.finalize().into()
}

/// Minting policy id, hex. Identical bytes to the script hash.
pub fn policy_id(compiled: &[u8]) -> String {
    hex::encode(script_hash(compiled))
}

/// Enterprise script address for the escrow validator on the given network.
pub fn script_address(compiled: &[u8], network: Network) -> String {
    let address = Address {
        payment: Credential::Script(script_hash(compiled)),
        stake: None,
    };
    address.to_bech32(network)
}

/// blake2b-256, used for transaction ids and asset-name derivation.
pub fn blake2b_256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Derive the unique asset name for an agent registration mint.
///
/// `blake2b_256(first_utxo_tx_hash ++ output_index_be32)` truncated to 32
/// bytes, so re-submitting the same registration can never mint twice.
pub fn registry_asset_name(first_utxo_tx_hash: &[u8; 32], output_index: u32) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(36);
    preimage.extend_from_slice(first_utxo_tx_hash);
    preimage.extend_from_slice(&output_index.to_be_bytes());
    blake2b_256(&preimage)
}
