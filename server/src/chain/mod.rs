//! Chain access layer.
//!
//! `ChainAdapter` is the only doorway to the UTXO-chain indexer; no other
//! module may speak to it directly. The concrete implementation wraps a
//! Blockfrost-family HTTP API and retries transient failures internally, so
//! callers see either data or a final error.

use async_trait::async_trait;

use crate::error::ChainError;
use masumi_codec::{policy_id, script_address, Network};

pub mod blockfrost;
pub mod retry;

pub use blockfrost::BlockfrostAdapter;

/// One row of an address transaction listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSummary {
    pub tx_hash: String,
    pub block_time: i64,
}

/// `{unit, quantity}` amount; unit "lovelace" for ada, `policy ++ name` hex
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAmount {
    pub unit: String,
    pub quantity: u64,
}

/// A transaction input or output as the indexer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxUtxo {
    pub tx_hash: String,
    pub output_index: u32,
    pub address: String,
    pub amounts: Vec<TxAmount>,
    /// CBOR hex of the inline datum, when present.
    pub inline_datum: Option<String>,
    pub reference_script_hash: Option<String>,
    pub collateral: bool,
}

impl TxUtxo {
    /// Lovelace carried by this utxo.
    pub fn lovelace(&self) -> u64 {
        self.amounts
            .iter()
            .filter(|amount| amount.unit == "lovelace")
            .map(|amount| amount.quantity)
            .sum()
    }

    /// Quantity of a non-ada unit.
    pub fn quantity_of(&self, unit: &str) -> u64 {
        self.amounts
            .iter()
            .filter(|amount| amount.unit == unit)
            .map(|amount| amount.quantity)
            .sum()
    }
}

/// A redeemer attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemerReport {
    /// "spend" or "mint".
    pub purpose: String,
    pub index: u32,
    /// CBOR hex of the redeemer data.
    pub data_cbor: Option<String>,
}

/// Extended transaction info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDetails {
    pub tx_hash: String,
    pub block_hash: String,
    pub block_time: i64,
    pub confirmations: u64,
    pub inputs: Vec<TxUtxo>,
    pub outputs: Vec<TxUtxo>,
    pub redeemers: Vec<RedeemerReport>,
    /// Raw CBOR of the full transaction, when the indexer provides it.
    pub raw_bytes: Option<Vec<u8>>,
}

/// Execution-unit budget evaluated for one redeemer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExUnitsReport {
    pub redeemer_index: u32,
    pub mem: u64,
    pub steps: u64,
}

/// Indexer abstraction. Every call retries transient failures internally
/// (exponential back-off, 500 ms initial, x2, 15 s cap, 5 attempts) before
/// returning an error.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Transactions at `address`, newest first, 1-based pages.
    async fn list_txs_at(&self, address: &str, page: u32) -> Result<Vec<TxSummary>, ChainError>;

    /// Inputs, outputs, confirmations and redeemers for one transaction.
    async fn get_tx(&self, tx_hash: &str) -> Result<TxDetails, ChainError>;

    /// Unspent outputs currently at `address`.
    async fn utxos_at(&self, address: &str) -> Result<Vec<TxUtxo>, ChainError>;

    /// Submit a signed CBOR transaction; returns the accepted tx hash.
    async fn submit_tx(&self, signed: &[u8]) -> Result<String, ChainError>;

    /// Evaluate execution units for every redeemer of an unsigned tx.
    async fn evaluate_tx(&self, tx: &[u8]) -> Result<Vec<ExUnitsReport>, ChainError>;
}

/// Resolve script address and policy id from the final compiled script.
/// Pure derivation, shared by every adapter implementation.
pub fn derive_script_addr(compiled: &[u8], network: Network) -> (String, String) {
    (script_address(compiled, network), policy_id(compiled))
}
