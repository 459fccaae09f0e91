//! Blockfrost-family indexer adapter.
//!
//! Wraps the HTTPS JSON API: address transaction listings, transaction
//! details with UTXOs and redeemers, submission and execution-unit
//! evaluation. All retries happen here; nothing above this layer sees a
//! transient failure unless the back-off budget is exhausted.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::chain::retry::{with_retry, RetryPolicy};
use crate::chain::{
    ChainAdapter, ExUnitsReport, RedeemerReport, TxAmount, TxDetails, TxSummary, TxUtxo,
};
use crate::error::ChainError;
use masumi_codec::Network;

/// How long a fetched chain tip stays fresh.
const TIP_CACHE_TTL: Duration = Duration::from_secs(10);

pub struct BlockfrostAdapter {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    policy: RetryPolicy,
    /// `(fetched_at, height)` cache of the chain tip.
    tip_cache: Mutex<Option<(Instant, u64)>>,
}

impl BlockfrostAdapter {
    pub fn new(network: Network, project_id: &str) -> Self {
        let base_url = match network {
            Network::Mainnet => "https://cardano-mainnet.blockfrost.io/api/v0".to_string(),
            Network::Preprod => "https://cardano-preprod.blockfrost.io/api/v0".to_string(),
        };
        Self::with_base_url(&base_url, project_id)
    }

    /// Point at a custom indexer deployment (also used by tests).
    pub fn with_base_url(base_url: &str, project_id: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            policy: RetryPolicy::default(),
            tip_cache: Mutex::new(None),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("project_id", &self.project_id)
            .send()
            .await
            .map_err(|e| ChainError::transient(operation, e))?;
        Self::decode_response(operation, response).await
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T, ChainError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ChainError::malformed(operation, e));
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ChainError::NotFound(operation.to_string()),
            StatusCode::TOO_MANY_REQUESTS => ChainError::transient(operation, "rate limited"),
            status if status.is_server_error() => {
                ChainError::transient(operation, format!("{status}: {body}"))
            }
            status => ChainError::Rejected(format!("{operation}: {status}: {body}")),
        })
    }

    /// Current chain height, cached for a few seconds.
    async fn chain_tip_height(&self) -> Result<u64, ChainError> {
        if let Some((fetched_at, height)) = *self.tip_cache.lock().unwrap() {
            if fetched_at.elapsed() < TIP_CACHE_TTL {
                return Ok(height);
            }
        }
        #[derive(Deserialize)]
        struct Block {
            height: u64,
        }
        let block: Block = with_retry(&self.policy, "blocks_latest", || {
            self.get_json("blocks_latest", "/blocks/latest")
        })
        .await?;
        *self.tip_cache.lock().unwrap() = Some((Instant::now(), block.height));
        Ok(block.height)
    }

    async fn fetch_redeemer_data(&self, data_hash: &str) -> Result<Option<String>, ChainError> {
        #[derive(Deserialize)]
        struct DatumCbor {
            cbor: String,
        }
        let path = format!("/scripts/datum/{data_hash}/cbor");
        match with_retry(&self.policy, "datum_cbor", || {
            self.get_json::<DatumCbor>("datum_cbor", &path)
        })
        .await
        {
            Ok(datum) => Ok(Some(datum.cbor)),
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

// Raw response shapes ------------------------------------------------------

#[derive(Deserialize)]
struct RawAddressTx {
    tx_hash: String,
    block_time: i64,
}

#[derive(Deserialize)]
struct RawTx {
    block: String,
    block_height: u64,
    block_time: i64,
}

#[derive(Deserialize)]
struct RawAmount {
    unit: String,
    quantity: String,
}

#[derive(Deserialize)]
struct RawTxUtxo {
    address: String,
    amount: Vec<RawAmount>,
    tx_hash: Option<String>,
    output_index: u32,
    inline_datum: Option<String>,
    reference_script_hash: Option<String>,
    #[serde(default)]
    collateral: bool,
}

#[derive(Deserialize)]
struct RawTxUtxos {
    hash: String,
    inputs: Vec<RawTxUtxo>,
    outputs: Vec<RawTxUtxo>,
}

#[derive(Deserialize)]
struct RawRedeemer {
    tx_index: u32,
    purpose: String,
    redeemer_data_hash: Option<String>,
}

#[derive(Deserialize)]
struct RawAddressUtxo {
    tx_hash: String,
    output_index: u32,
    amount: Vec<RawAmount>,
    inline_datum: Option<String>,
    reference_script_hash: Option<String>,
}

fn convert_amounts(operation: &str, raw: Vec<RawAmount>) -> Result<Vec<TxAmount>, ChainError> {
    raw.into_iter()
        .map(|amount| {
            let quantity = amount
                .quantity
                .parse::<u64>()
                .map_err(|_| ChainError::malformed(operation, "non-integer quantity"))?;
            Ok(TxAmount {
                unit: amount.unit,
                quantity,
            })
        })
        .collect()
}

fn convert_utxo(
    operation: &str,
    fallback_tx_hash: &str,
    raw: RawTxUtxo,
) -> Result<TxUtxo, ChainError> {
    Ok(TxUtxo {
        tx_hash: raw.tx_hash.unwrap_or_else(|| fallback_tx_hash.to_string()),
        output_index: raw.output_index,
        address: raw.address,
        amounts: convert_amounts(operation, raw.amount)?,
        inline_datum: raw.inline_datum,
        reference_script_hash: raw.reference_script_hash,
        collateral: raw.collateral,
    })
}

#[async_trait]
impl ChainAdapter for BlockfrostAdapter {
    async fn list_txs_at(&self, address: &str, page: u32) -> Result<Vec<TxSummary>, ChainError> {
        let path = format!("/addresses/{address}/transactions?page={page}&order=desc");
        let rows: Vec<RawAddressTx> = match with_retry(&self.policy, "list_txs_at", || {
            self.get_json("list_txs_at", &path)
        })
        .await
        {
            Ok(rows) => rows,
            // An address with no history yet is an empty listing, not a failure.
            Err(ChainError::NotFound(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        Ok(rows
            .into_iter()
            .map(|row| TxSummary {
                tx_hash: row.tx_hash,
                block_time: row.block_time,
            })
            .collect())
    }

    async fn get_tx(&self, tx_hash: &str) -> Result<TxDetails, ChainError> {
        let tx_path = format!("/txs/{tx_hash}");
        let tx: RawTx = with_retry(&self.policy, "get_tx", || {
            self.get_json("get_tx", &tx_path)
        })
        .await?;

        let utxos_path = format!("/txs/{tx_hash}/utxos");
        let utxos: RawTxUtxos = with_retry(&self.policy, "get_tx_utxos", || {
            self.get_json("get_tx_utxos", &utxos_path)
        })
        .await?;

        let redeemers_path = format!("/txs/{tx_hash}/redeemers");
        let raw_redeemers: Vec<RawRedeemer> = match with_retry(&self.policy, "get_tx_redeemers", || {
            self.get_json("get_tx_redeemers", &redeemers_path)
        })
        .await
        {
            Ok(rows) => rows,
            Err(ChainError::NotFound(_)) => Vec::new(),
            Err(error) => return Err(error),
        };

        let mut redeemers = Vec::with_capacity(raw_redeemers.len());
        for raw in raw_redeemers {
            let data_cbor = match &raw.redeemer_data_hash {
                Some(hash) => self.fetch_redeemer_data(hash).await?,
                None => None,
            };
            redeemers.push(RedeemerReport {
                purpose: raw.purpose,
                index: raw.tx_index,
                data_cbor,
            });
        }

        let raw_bytes = {
            #[derive(Deserialize)]
            struct TxCbor {
                cbor: String,
            }
            let cbor_path = format!("/txs/{tx_hash}/cbor");
            match with_retry(&self.policy, "get_tx_cbor", || {
                self.get_json::<TxCbor>("get_tx_cbor", &cbor_path)
            })
            .await
            {
                Ok(body) => hex::decode(body.cbor).ok(),
                Err(ChainError::NotFound(_)) => None,
                Err(error) => return Err(error),
            }
        };

        let tip = self.chain_tip_height().await?;
        let confirmations = tip.saturating_sub(tx.block_height) + 1;
        debug!(
            "get_tx {}: height={} tip={} confirmations={}",
            tx_hash, tx.block_height, tip, confirmations
        );

        let inputs = utxos
            .inputs
            .into_iter()
            .map(|raw| convert_utxo("get_tx", &utxos.hash, raw))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = utxos
            .outputs
            .into_iter()
            .map(|raw| convert_utxo("get_tx", &utxos.hash, raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TxDetails {
            tx_hash: tx_hash.to_string(),
            block_hash: tx.block,
            block_time: tx.block_time,
            confirmations,
            inputs,
            outputs,
            redeemers,
            raw_bytes,
        })
    }

    async fn utxos_at(&self, address: &str) -> Result<Vec<TxUtxo>, ChainError> {
        let path = format!("/addresses/{address}/utxos?order=desc");
        let rows: Vec<RawAddressUtxo> = match with_retry(&self.policy, "utxos_at", || {
            self.get_json("utxos_at", &path)
        })
        .await
        {
            Ok(rows) => rows,
            Err(ChainError::NotFound(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        let utxos = rows
            .into_iter()
            .map(|raw| {
                Ok(TxUtxo {
                    tx_hash: raw.tx_hash,
                    output_index: raw.output_index,
                    address: address.to_string(),
                    amounts: convert_amounts("utxos_at", raw.amount)?,
                    inline_datum: raw.inline_datum,
                    reference_script_hash: raw.reference_script_hash,
                    collateral: false,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        Ok(utxos)
    }

    async fn submit_tx(&self, signed: &[u8]) -> Result<String, ChainError> {
        let url = format!("{}/tx/submit", self.base_url);
        let body = signed.to_vec();
        with_retry(&self.policy, "submit_tx", || {
            let body = body.clone();
            let url = &url;
            async move {
                let response = self
                    .client
                    .post(url)
                    .header("project_id", &self.project_id)
                    .header("Content-Type", "application/cbor")
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| ChainError::transient("submit_tx", e))?;
                let hash: String = Self::decode_response("submit_tx", response).await?;
                Ok(hash)
            }
        })
        .await
    }

    async fn evaluate_tx(&self, tx: &[u8]) -> Result<Vec<ExUnitsReport>, ChainError> {
        let url = format!("{}/utils/txs/evaluate", self.base_url);
        let body = hex::encode(tx);
        let value: serde_json::Value = with_retry(&self.policy, "evaluate_tx", || {
            let body = body.clone();
            let url = &url;
            async move {
                let response = self
                    .client
                    .post(url)
                    .header("project_id", &self.project_id)
                    .header("Content-Type", "application/cbor")
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| ChainError::transient("evaluate_tx", e))?;
                Self::decode_response("evaluate_tx", response).await
            }
        })
        .await?;
        parse_evaluation(&value)
    }
}

/// Parse the Ogmios-style evaluation envelope:
/// `{"result": {"EvaluationResult": {"spend:0": {"memory": m, "steps": s}}}}`.
fn parse_evaluation(value: &serde_json::Value) -> Result<Vec<ExUnitsReport>, ChainError> {
    let result = value
        .get("result")
        .and_then(|r| r.get("EvaluationResult"))
        .and_then(|r| r.as_object())
        .ok_or_else(|| {
            ChainError::Rejected(format!("evaluate_tx: no EvaluationResult in {value}"))
        })?;
    let mut reports = Vec::with_capacity(result.len());
    for (key, units) in result {
        let index = key
            .rsplit(':')
            .next()
            .and_then(|part| part.parse::<u32>().ok())
            .ok_or_else(|| ChainError::malformed("evaluate_tx", format!("bad key {key}")))?;
        let mem = units
            .get("memory")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ChainError::malformed("evaluate_tx", "missing memory"))?;
        let steps = units
            .get("steps")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ChainError::malformed("evaluate_tx", "missing steps"))?;
        reports.push(ExUnitsReport {
            redeemer_index: index,
            mem,
            steps,
        });
    }
    reports.sort_by_key(|report| report.redeemer_index);
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_evaluation_envelope() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"jsonwsp/response","result":{"EvaluationResult":{
                "spend:0":{"memory":1700,"steps":476468},
                "mint:1":{"memory":2000,"steps":500000}}}}"#,
        )
        .unwrap();
        let reports = parse_evaluation(&value).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].redeemer_index, 0);
        assert_eq!(reports[0].mem, 1700);
        assert_eq!(reports[1].steps, 500_000);
    }

    #[test]
    fn test_parse_evaluation_failure_is_rejected() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"result":{"EvaluationFailure":{"reason":"x"}}}"#).unwrap();
        assert!(matches!(
            parse_evaluation(&value),
            Err(ChainError::Rejected(_))
        ));
    }
}
