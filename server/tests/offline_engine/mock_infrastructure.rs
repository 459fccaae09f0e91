//! In-memory chain for offline engine tests.
//!
//! Holds a chronological list of transactions; the adapter views (listings,
//! details, address UTXOs) are derived from it. Tests mutate the chain
//! between sync cycles to simulate confirmations and rollbacks.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use server::chain::{
    ChainAdapter, ExUnitsReport, RedeemerReport, TxAmount, TxDetails, TxSummary, TxUtxo,
};
use server::error::ChainError;

/// One transaction on the mock chain.
#[derive(Debug, Clone)]
pub struct MockTx {
    pub tx_hash: String,
    pub block_time: i64,
    pub confirmations: u64,
    pub inputs: Vec<TxUtxo>,
    pub outputs: Vec<TxUtxo>,
    pub redeemers: Vec<RedeemerReport>,
}

#[derive(Default)]
pub struct MockChain {
    txs: Mutex<Vec<MockTx>>,
    submitted: Mutex<Vec<Vec<u8>>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx: MockTx) {
        self.txs.lock().unwrap().push(tx);
    }

    /// Remove a transaction, simulating a rollback.
    pub fn remove(&self, tx_hash: &str) {
        self.txs.lock().unwrap().retain(|tx| tx.tx_hash != tx_hash);
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    fn touches(tx: &MockTx, address: &str) -> bool {
        tx.inputs.iter().any(|utxo| utxo.address == address)
            || tx.outputs.iter().any(|utxo| utxo.address == address)
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    async fn list_txs_at(&self, address: &str, page: u32) -> Result<Vec<TxSummary>, ChainError> {
        if page > 1 {
            return Ok(Vec::new());
        }
        let txs = self.txs.lock().unwrap();
        let mut rows: Vec<TxSummary> = txs
            .iter()
            .filter(|tx| Self::touches(tx, address))
            .map(|tx| TxSummary {
                tx_hash: tx.tx_hash.clone(),
                block_time: tx.block_time,
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn get_tx(&self, tx_hash: &str) -> Result<TxDetails, ChainError> {
        let txs = self.txs.lock().unwrap();
        let tx = txs
            .iter()
            .find(|tx| tx.tx_hash == tx_hash)
            .ok_or_else(|| ChainError::NotFound(tx_hash.to_string()))?;
        Ok(TxDetails {
            tx_hash: tx.tx_hash.clone(),
            block_hash: format!("block-{}", tx.tx_hash),
            block_time: tx.block_time,
            confirmations: tx.confirmations,
            inputs: tx.inputs.clone(),
            outputs: tx.outputs.clone(),
            redeemers: tx.redeemers.clone(),
            raw_bytes: None,
        })
    }

    async fn utxos_at(&self, address: &str) -> Result<Vec<TxUtxo>, ChainError> {
        let txs = self.txs.lock().unwrap();
        let spent: HashSet<(String, u32)> = txs
            .iter()
            .flat_map(|tx| tx.inputs.iter())
            .map(|utxo| (utxo.tx_hash.clone(), utxo.output_index))
            .collect();
        Ok(txs
            .iter()
            .flat_map(|tx| tx.outputs.iter())
            .filter(|utxo| {
                utxo.address == address
                    && !spent.contains(&(utxo.tx_hash.clone(), utxo.output_index))
            })
            .cloned()
            .collect())
    }

    async fn submit_tx(&self, signed: &[u8]) -> Result<String, ChainError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(signed.to_vec());
        let digest = masumi_codec::script::blake2b_256(signed);
        Ok(hex::encode(digest))
    }

    async fn evaluate_tx(&self, _tx: &[u8]) -> Result<Vec<ExUnitsReport>, ChainError> {
        Ok(vec![ExUnitsReport {
            redeemer_index: 0,
            mem: 500_000,
            steps: 200_000_000,
        }])
    }
}

/// Lovelace-only amount vector.
pub fn lovelace(quantity: u64) -> Vec<TxAmount> {
    vec![TxAmount {
        unit: "lovelace".into(),
        quantity,
    }]
}

/// Plain UTXO at an address.
pub fn utxo(tx_hash: &str, index: u32, address: &str, amounts: Vec<TxAmount>) -> TxUtxo {
    TxUtxo {
        tx_hash: tx_hash.to_string(),
        output_index: index,
        address: address.to_string(),
        amounts,
        inline_datum: None,
        reference_script_hash: None,
        collateral: false,
    }
}

/// Spend-purpose redeemer report carrying the given redeemer's CBOR.
pub fn spend_redeemer(redeemer: masumi_codec::Redeemer) -> RedeemerReport {
    RedeemerReport {
        purpose: "spend".into(),
        index: 0,
        data_cbor: Some(hex::encode(redeemer.encode())),
    }
}
