//! The chain sync loop.
//!
//! Invoked periodically per payment source. One cycle: take the per-source
//! advisory lock, page the indexer for new transactions at the script
//! address (detecting rollbacks against the identifier trail), fetch
//! extended info in bounded batches, classify each transaction, and apply it
//! to the mirrors - advancing the cursor in the same serializable database
//! transaction as the state change it justified.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainAdapter, TxDetails, TxSummary, TxUtxo};
use crate::config::EngineConfig;
use crate::db::{run, run_serializable, DbPool};
use crate::error::{chain_error_note, ChainError, EntityErrorType};
use crate::models::payment_request::PaymentRequest;
use crate::models::payment_source::PaymentSource;
use crate::models::purchase_request::PurchaseRequest;
use crate::models::registry_request::RegistryRequest;
use crate::models::source_identifier::SourceIdentifier;
use crate::models::state::{PaymentAction, PurchasingAction, RegistrationState, TxStatus};
use crate::models::transaction::{HistoryOwner, Transaction, TransactionHistory};
use crate::schema::payment_sources;
use crate::services::observe::{
    apply_transition, match_payment_initial, match_purchase_initial, net_value_for_address,
    ObservedInitial, ObservedTransition,
};
use diesel::prelude::*;
use masumi_codec::{EscrowDatum, Network, Redeemer};

/// Standard note placed on entities touched by a rollback.
pub const ROLLBACK_NOTE: &str =
    "Rolled back transaction detected. Manual reconciliation required.";

/// Hard cap on listing pages per cycle; a source further behind than this
/// catches up over multiple cycles.
const MAX_PAGES_PER_CYCLE: u32 = 100;

/// What discovery found this cycle.
#[derive(Debug)]
enum Discovery {
    /// New transactions in chronological order.
    Forward(Vec<TxSummary>),
    /// The cursor vanished from the chain: a reorganization happened.
    Rollback {
        new_txs: Vec<TxSummary>,
        rolled_back: Vec<String>,
        fork_point: Option<String>,
    },
}

/// Classification of one chain transaction against the script address.
#[derive(Debug, PartialEq, Eq)]
pub enum TxClass {
    /// Touches the script address in none of the allowed shapes.
    Invalid(String),
    /// Does not touch the script address at all.
    Unrelated,
    /// Zero script inputs, one or more script outputs, zero redeemers.
    Initial,
    /// Exactly one script input, one redeemer, at most one script output.
    Transition(Redeemer),
}

fn script_inputs<'a>(details: &'a TxDetails, script_address: &str) -> Vec<&'a TxUtxo> {
    details
        .inputs
        .iter()
        .filter(|utxo| !utxo.collateral && utxo.address == script_address)
        .collect()
}

fn script_outputs<'a>(details: &'a TxDetails, script_address: &str) -> Vec<&'a TxUtxo> {
    details
        .outputs
        .iter()
        .filter(|utxo| !utxo.collateral && utxo.address == script_address)
        .collect()
}

/// Classify per the allowed shapes. Reference scripts on escrow outputs and
/// shapes the validator would never produce are Invalid; Invalid still
/// advances the cursor.
pub fn classify_tx(details: &TxDetails, script_address: &str) -> TxClass {
    let inputs = script_inputs(details, script_address);
    let outputs = script_outputs(details, script_address);

    if inputs.is_empty() && outputs.is_empty() {
        return TxClass::Unrelated;
    }
    if outputs
        .iter()
        .any(|utxo| utxo.reference_script_hash.is_some())
    {
        return TxClass::Invalid("reference script on a script output".into());
    }
    let spend_redeemers: Vec<_> = details
        .redeemers
        .iter()
        .filter(|redeemer| redeemer.purpose == "spend")
        .collect();
    if inputs.is_empty() && !outputs.is_empty() && spend_redeemers.is_empty() {
        return TxClass::Initial;
    }
    if inputs.len() == 1 && spend_redeemers.len() == 1 && outputs.len() <= 1 {
        let Some(data_cbor) = spend_redeemers[0].data_cbor.as_deref() else {
            return TxClass::Invalid("redeemer data unavailable".into());
        };
        return match Redeemer::decode_hex(data_cbor) {
            Ok(redeemer) => TxClass::Transition(redeemer),
            Err(error) => TxClass::Invalid(format!("undecodable redeemer: {error}")),
        };
    }
    TxClass::Invalid(format!(
        "unexpected shape: {} script inputs, {} script outputs, {} redeemers",
        inputs.len(),
        outputs.len(),
        spend_redeemers.len()
    ))
}

pub struct SyncService {
    pool: DbPool,
    adapter: Arc<dyn ChainAdapter>,
    config: EngineConfig,
}

impl SyncService {
    pub fn new(pool: DbPool, adapter: Arc<dyn ChainAdapter>, config: EngineConfig) -> Self {
        info!(
            "SyncService initialized: interval={:?}, confirmations_threshold={}, max_parallel_tx={}",
            config.sync_interval, config.block_confirmations_threshold, config.max_parallel_tx
        );
        Self {
            pool,
            adapter,
            config,
        }
    }

    /// Run the loop forever.
    pub async fn start(self: Arc<Self>) {
        let mut timer = interval(self.config.sync_interval);
        info!("Starting chain sync loop");
        loop {
            timer.tick().await;
            let sources = match run(&self.pool, PaymentSource::find_active).await {
                Ok(sources) => sources,
                Err(error) => {
                    error!("Failed to load payment sources: {error:#}");
                    continue;
                }
            };
            let cycles = sources.iter().map(|source| self.sync_source(source));
            for (source, outcome) in sources.iter().zip(join_all(cycles).await) {
                if let Err(error) = outcome {
                    error!("Sync cycle failed for source {}: {error:#}", source.id);
                }
            }
        }
    }

    /// One cycle for one payment source.
    pub async fn sync_source(&self, source: &PaymentSource) -> Result<()> {
        if !self.acquire_sync_lock(&source.id).await? {
            debug!("Source {} is being synced by another instance", source.id);
            return Ok(());
        }
        let outcome = self.sync_source_locked(source).await;
        self.release_sync_lock(&source.id).await?;
        outcome
    }

    async fn acquire_sync_lock(&self, source_id: &str) -> Result<bool> {
        let source_id = source_id.to_string();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let timeout_ms = self.config.sync_lock_timeout_ms();
        run_serializable(&self.pool, move |conn| {
            let source = PaymentSource::find_by_id(conn, &source_id)?;
            if source.sync_in_progress {
                let expired = source
                    .sync_started_at
                    .map(|started| now_ms - started > timeout_ms)
                    .unwrap_or(true);
                if !expired {
                    return Ok(false);
                }
                warn!("Taking over expired sync lock on source {source_id}");
            }
            diesel::update(payment_sources::table.filter(payment_sources::id.eq(&source_id)))
                .set((
                    payment_sources::sync_in_progress.eq(true),
                    payment_sources::sync_started_at.eq(now_ms),
                    payment_sources::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .context("Failed to set sync lock")?;
            Ok(true)
        })
        .await
    }

    async fn release_sync_lock(&self, source_id: &str) -> Result<()> {
        let source_id = source_id.to_string();
        run(&self.pool, move |conn| {
            diesel::update(payment_sources::table.filter(payment_sources::id.eq(&source_id)))
                .set((
                    payment_sources::sync_in_progress.eq(false),
                    payment_sources::sync_started_at.eq(None::<i64>),
                    payment_sources::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .context("Failed to release sync lock")?;
            Ok(())
        })
        .await
    }

    async fn sync_source_locked(&self, source: &PaymentSource) -> Result<()> {
        let discovery = self.discover(source).await?;
        let new_txs = match discovery {
            Discovery::Forward(new_txs) => new_txs,
            Discovery::Rollback {
                new_txs,
                rolled_back,
                fork_point,
            } => {
                self.handle_rollback(source, &rolled_back, fork_point.as_deref())
                    .await?;
                new_txs
            }
        };
        if new_txs.is_empty() {
            return self.confirm_registry_transactions(source).await;
        }
        info!(
            "Source {}: {} new transaction(s) to process",
            source.id,
            new_txs.len()
        );

        // Fetch extended info in bounded batches, preserving order.
        let mut details: Vec<Option<TxDetails>> = Vec::with_capacity(new_txs.len());
        for chunk in new_txs.chunks(self.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|summary| self.adapter.get_tx(&summary.tx_hash))
                .collect();
            for (summary, outcome) in chunk.iter().zip(join_all(futures).await) {
                match outcome {
                    Ok(tx_details) => details.push(Some(tx_details)),
                    Err(ChainError::NotFound(_)) => {
                        // Raced a reorg; the next cycle re-discovers.
                        warn!("Tx {} vanished during sync, stopping cycle", summary.tx_hash);
                        details.push(None);
                    }
                    Err(error) => return Err(error).context("Failed to fetch transaction"),
                }
            }
        }

        for (summary, tx_details) in new_txs.iter().zip(details) {
            let Some(tx_details) = tx_details else { break };
            // A tx below the confirmation threshold gates all later txs:
            // applying them out of order would corrupt the cursor trail.
            if self.config.block_confirmations_threshold > 0
                && tx_details.confirmations < self.config.block_confirmations_threshold
            {
                debug!(
                    "Tx {} has {}/{} confirmations, stopping forward progress",
                    summary.tx_hash,
                    tx_details.confirmations,
                    self.config.block_confirmations_threshold
                );
                break;
            }
            self.process_tx(source, summary, &tx_details).await?;
        }

        self.confirm_registry_transactions(source).await
    }

    /// Discovery: page newest-first until the cursor is found.
    async fn discover(&self, source: &PaymentSource) -> Result<Discovery> {
        let mut collected: Vec<TxSummary> = Vec::new();
        let mut cursor_found = false;

        'pages: for page in 1..=MAX_PAGES_PER_CYCLE {
            let rows = self
                .adapter
                .list_txs_at(&source.smart_contract_address, page)
                .await
                .context("Failed to list script address transactions")?;
            if rows.is_empty() {
                break;
            }
            for row in rows {
                if Some(&row.tx_hash) == source.last_identifier_checked.as_ref() {
                    cursor_found = true;
                    break 'pages;
                }
                collected.push(row);
            }
        }

        if cursor_found || source.last_identifier_checked.is_none() {
            collected.reverse();
            return Ok(Discovery::Forward(collected));
        }

        // The cursor is gone: walk the trail to find the fork point.
        warn!(
            "Cursor {} not found on chain for source {} - rollback detected",
            source.last_identifier_checked.as_deref().unwrap_or(""),
            source.id
        );
        let source_id = source.id.to_string();
        let trail = run(&self.pool, move |conn| {
            SourceIdentifier::newest_first(conn, &source_id)
        })
        .await?;

        let mut rolled_back = Vec::new();
        let mut fork_point = None;
        for entry in &trail {
            match self.adapter.get_tx(&entry.tx_hash).await {
                Ok(_) => {
                    fork_point = Some(entry.tx_hash.clone());
                    break;
                }
                Err(ChainError::NotFound(_)) => rolled_back.push(entry.tx_hash.clone()),
                Err(error) => return Err(error).context("Failed to probe trail entry"),
            }
        }

        // Everything newer than the fork point in the fresh listing is new.
        let new_txs: Vec<TxSummary> = match &fork_point {
            Some(fork_hash) => {
                let mut new_txs: Vec<TxSummary> = collected
                    .iter()
                    .take_while(|summary| summary.tx_hash != *fork_hash)
                    .cloned()
                    .collect();
                new_txs.reverse();
                new_txs
            }
            None => {
                let mut all = collected.clone();
                all.reverse();
                all
            }
        };

        Ok(Discovery::Rollback {
            new_txs,
            rolled_back,
            fork_point,
        })
    }

    /// Rollback handling: park every entity that referenced a rolled-back
    /// transaction and rewind the cursor to the fork point.
    async fn handle_rollback(
        &self,
        source: &PaymentSource,
        rolled_back: &[String],
        fork_point: Option<&str>,
    ) -> Result<()> {
        error!(
            "Source {}: rollback of {} transaction(s), fork point {:?}",
            source.id,
            rolled_back.len(),
            fork_point
        );
        let source_id = source.id.to_string();
        let rolled_back = rolled_back.to_vec();
        let fork_point = fork_point.map(str::to_string);
        run_serializable(&self.pool, move |conn| {
            for tx_hash in &rolled_back {
                for transaction in Transaction::find_all_by_tx_hash(conn, tx_hash)? {
                    Transaction::settle(conn, &transaction.id, TxStatus::RolledBack)?;

                    for payment in
                        PaymentRequest::find_by_current_transaction(conn, &transaction.id)?
                    {
                        PaymentRequest::set_action(
                            conn,
                            &payment.id,
                            PaymentAction::WaitingForManualAction,
                            Some(EntityErrorType::RolledBack.as_str()),
                            Some(&chain_error_note(
                                payment.error_note.as_deref(),
                                &payment.requested_action,
                                ROLLBACK_NOTE,
                            )),
                        )?;
                    }
                    for purchase in
                        PurchaseRequest::find_by_current_transaction(conn, &transaction.id)?
                    {
                        PurchaseRequest::set_action(
                            conn,
                            &purchase.id,
                            PurchasingAction::WaitingForManualAction,
                            Some(EntityErrorType::RolledBack.as_str()),
                            Some(&chain_error_note(
                                purchase.error_note.as_deref(),
                                &purchase.requested_action,
                                ROLLBACK_NOTE,
                            )),
                        )?;
                    }
                    for registry in
                        RegistryRequest::find_by_current_transaction(conn, &transaction.id)?
                    {
                        RegistryRequest::set_state(
                            conn,
                            &registry.id,
                            RegistrationState::RegistrationFailed,
                            Some(ROLLBACK_NOTE),
                        )?;
                    }
                }
            }
            SourceIdentifier::remove_hashes(conn, &source_id, &rolled_back)?;
            PaymentSource::rewind_cursor(conn, &source_id, fork_point.as_deref())?;
            Ok(())
        })
        .await
    }

    /// Classify and apply one confirmed transaction, then advance the cursor.
    async fn process_tx(
        &self,
        source: &PaymentSource,
        summary: &TxSummary,
        details: &TxDetails,
    ) -> Result<()> {
        let network = source.network()?;
        let class = classify_tx(details, &source.smart_contract_address);
        debug!("Tx {} classified as {:?}", summary.tx_hash, class);

        match class {
            TxClass::Unrelated | TxClass::Invalid(_) => {
                if let TxClass::Invalid(reason) = &class {
                    warn!("Tx {} invalid: {}", summary.tx_hash, reason);
                }
                self.advance_cursor_only(source, summary).await
            }
            TxClass::Initial => self.process_initial(source, network, summary, details).await,
            TxClass::Transition(redeemer) => {
                self.process_transition(source, summary, details, redeemer)
                    .await
            }
        }
    }

    async fn advance_cursor_only(
        &self,
        source: &PaymentSource,
        summary: &TxSummary,
    ) -> Result<()> {
        let source_id = source.id.to_string();
        let tx_hash = summary.tx_hash.clone();
        let block_time = summary.block_time;
        run_serializable(&self.pool, move |conn| {
            SourceIdentifier::append(conn, &source_id, &tx_hash, block_time)?;
            PaymentSource::advance_cursor(conn, &source_id, &tx_hash)
        })
        .await
    }

    /// Initial transactions: each script output may open an escrow.
    async fn process_initial(
        &self,
        source: &PaymentSource,
        network: Network,
        summary: &TxSummary,
        details: &TxDetails,
    ) -> Result<()> {
        let outputs: Vec<TxUtxo> = script_outputs(details, &source.smart_contract_address)
            .into_iter()
            .cloned()
            .collect();
        let input_addresses: Vec<String> = details
            .inputs
            .iter()
            .filter(|utxo| !utxo.collateral)
            .map(|utxo| utxo.address.clone())
            .collect();
        let source_id = source.id.to_string();
        let tx_hash = summary.tx_hash.clone();
        let block_time = summary.block_time;

        run_serializable(&self.pool, move |conn| {
            for output in &outputs {
                let Some(datum_hex) = output.inline_datum.as_deref() else {
                    debug!("Script output without inline datum in {}", tx_hash);
                    continue;
                };
                let datum = match EscrowDatum::decode_hex(datum_hex) {
                    Ok(datum) => datum,
                    Err(error) => {
                        debug!("Undecodable datum in {}: {}", tx_hash, error);
                        continue;
                    }
                };
                let observed = ObservedInitial {
                    source_id: &source_id,
                    network,
                    tx_hash: &tx_hash,
                    block_time_ms: block_time * 1000,
                    datum: &datum,
                    output,
                    input_addresses: &input_addresses,
                };
                // The two mirrors match independently; a single output can
                // settle both sides when the coordinator serves seller and
                // buyer of the same escrow.
                match_purchase_initial(conn, &observed)?;
                match_payment_initial(conn, &observed)?;
            }
            SourceIdentifier::append(conn, &source_id, &tx_hash, block_time)?;
            PaymentSource::advance_cursor(conn, &source_id, &tx_hash)
        })
        .await
    }

    /// State-transition transactions: one redeemer spend of the escrow.
    async fn process_transition(
        &self,
        source: &PaymentSource,
        summary: &TxSummary,
        details: &TxDetails,
        redeemer: Redeemer,
    ) -> Result<()> {
        let script_address = source.smart_contract_address.clone();
        let consumed = script_inputs(details, &script_address)
            .into_iter()
            .next()
            .cloned()
            .context("transition without script input")?;
        let new_output = script_outputs(details, &script_address)
            .into_iter()
            .next()
            .cloned();

        let Some(old_datum_hex) = consumed.inline_datum.as_deref() else {
            warn!("Consumed escrow input without datum in {}", summary.tx_hash);
            return self.advance_cursor_only(source, summary).await;
        };
        let old_datum = match EscrowDatum::decode_hex(old_datum_hex) {
            Ok(datum) => datum,
            Err(error) => {
                warn!(
                    "Undecodable consumed datum in {}: {}",
                    summary.tx_hash, error
                );
                return self.advance_cursor_only(source, summary).await;
            }
        };
        let new_datum = match new_output
            .as_ref()
            .and_then(|output| output.inline_datum.as_deref())
        {
            Some(hex_datum) => match EscrowDatum::decode_hex(hex_datum) {
                Ok(datum) => Some(datum),
                Err(error) => {
                    warn!("Undecodable new datum in {}: {}", summary.tx_hash, error);
                    None
                }
            },
            None => None,
        };

        // Legitimate-successor check: the consumed input (or an ancestor)
        // must trace back to a transaction this coordinator knows. An entity
        // with no tracked history has no legitimate anchor (a spoofed escrow
        // the purchase mirror ignored leaves nothing behind), so an empty
        // set rejects every spend.
        let acceptable = self
            .known_hashes(&source.id, &old_datum.blockchain_identifier)
            .await?;
        if acceptable.is_empty()
            || !self
                .lineage_ok(&script_address, &consumed.tx_hash, &acceptable)
                .await
        {
            warn!(
                "Tx {} spends an escrow with foreign lineage for identifier {} - not applied",
                summary.tx_hash, old_datum.blockchain_identifier
            );
            return self.advance_cursor_only(source, summary).await;
        }

        // Per-party withdrawal split, needed for disputed withdrawals.
        let network = source.network()?;
        let seller_address = old_datum.seller_address.to_bech32(network);
        let buyer_address = old_datum.buyer_address.to_bech32(network);
        let withdrawn_for_seller =
            net_value_for_address(&details.inputs, &details.outputs, &seller_address);
        let withdrawn_for_buyer =
            net_value_for_address(&details.inputs, &details.outputs, &buyer_address);

        let source_id = source.id.to_string();
        let tx_hash = summary.tx_hash.clone();
        let block_time = summary.block_time;
        run_serializable(&self.pool, move |conn| {
            let observed = ObservedTransition {
                source_id: &source_id,
                tx_hash: &tx_hash,
                redeemer,
                old_datum: &old_datum,
                new_datum: new_datum.as_ref(),
                new_output: new_output.as_ref(),
                withdrawn_for_seller,
                withdrawn_for_buyer,
            };
            apply_transition(conn, &observed)?;
            SourceIdentifier::append(conn, &source_id, &tx_hash, block_time)?;
            PaymentSource::advance_cursor(conn, &source_id, &tx_hash)
        })
        .await
    }

    /// Hashes this coordinator accepts as the escrow's lineage root: the
    /// mirrors' current transactions plus their full history.
    async fn known_hashes(
        &self,
        source_id: &str,
        blockchain_identifier: &str,
    ) -> Result<HashSet<String>> {
        let source_id = source_id.to_string();
        let identifier = blockchain_identifier.to_string();
        run(&self.pool, move |conn| {
            let mut hashes = HashSet::new();
            if let Some(payment) = PaymentRequest::find_by_identifier(conn, &source_id, &identifier)?
            {
                if let Some(current_id) = &payment.current_transaction_id {
                    let current = Transaction::find_by_id(conn, current_id)?;
                    if !current.tx_hash.is_empty() {
                        hashes.insert(current.tx_hash);
                    }
                }
                hashes.extend(
                    TransactionHistory::hashes_for(conn, HistoryOwner::Payment(&payment.id))?
                        .into_iter()
                        .filter(|hash| !hash.is_empty()),
                );
            }
            if let Some(purchase) =
                PurchaseRequest::find_by_identifier(conn, &source_id, &identifier)?
            {
                if let Some(current_id) = &purchase.current_transaction_id {
                    let current = Transaction::find_by_id(conn, current_id)?;
                    if !current.tx_hash.is_empty() {
                        hashes.insert(current.tx_hash);
                    }
                }
                hashes.extend(
                    TransactionHistory::hashes_for(conn, HistoryOwner::Purchase(&purchase.id))?
                        .into_iter()
                        .filter(|hash| !hash.is_empty()),
                );
            }
            Ok(hashes)
        })
        .await
    }

    /// Walk the consumed input's ancestry up to the configured depth looking
    /// for a hash this coordinator knows.
    async fn lineage_ok(
        &self,
        script_address: &str,
        consumed_tx_hash: &str,
        acceptable: &HashSet<String>,
    ) -> bool {
        let mut hash = consumed_tx_hash.to_string();
        for _ in 0..self.config.max_history_levels {
            if acceptable.contains(&hash) {
                return true;
            }
            let details = match self.adapter.get_tx(&hash).await {
                Ok(details) => details,
                Err(_) => return false,
            };
            let Some(parent) = details
                .inputs
                .iter()
                .find(|utxo| !utxo.collateral && utxo.address == script_address)
            else {
                return false;
            };
            hash = parent.tx_hash.clone();
        }
        false
    }

    /// Confirm submitted registry mints/burns once they have enough
    /// confirmations. Registry transactions never touch the escrow address,
    /// so the main classification path cannot see them.
    async fn confirm_registry_transactions(&self, source: &PaymentSource) -> Result<()> {
        let source_id = source.id.to_string();
        let initiated = run(&self.pool, move |conn| {
            let mut rows =
                RegistryRequest::find_in_state(conn, &source_id, RegistrationState::RegistrationInitiated)?;
            rows.extend(RegistryRequest::find_in_state(
                conn,
                &source_id,
                RegistrationState::DeregistrationInitiated,
            )?);
            Ok(rows)
        })
        .await?;

        for registry in initiated {
            let Some(current_id) = registry.current_transaction_id.clone() else {
                continue;
            };
            let current_id_for_db = current_id.clone();
            let transaction = run(&self.pool, move |conn| {
                Transaction::find_by_id(conn, &current_id_for_db)
            })
            .await?;
            if transaction.tx_hash.is_empty() {
                continue;
            }
            let details = match self.adapter.get_tx(&transaction.tx_hash).await {
                Ok(details) => details,
                Err(ChainError::NotFound(_)) => continue,
                Err(error) => {
                    warn!(
                        "Failed to probe registry tx {}: {error}",
                        transaction.tx_hash
                    );
                    continue;
                }
            };
            if self.config.block_confirmations_threshold > 0
                && details.confirmations < self.config.block_confirmations_threshold
            {
                continue;
            }
            let confirmed_state = match registry.state()? {
                RegistrationState::RegistrationInitiated => {
                    RegistrationState::RegistrationConfirmed
                }
                RegistrationState::DeregistrationInitiated => {
                    RegistrationState::DeregistrationConfirmed
                }
                other => {
                    debug!("Registry {} in unexpected state {:?}", registry.id, other);
                    continue;
                }
            };
            let registry_id = registry.id.clone();
            run_serializable(&self.pool, move |conn| {
                Transaction::settle(conn, &current_id, TxStatus::Confirmed)?;
                TransactionHistory::append(conn, HistoryOwner::Registry(&registry_id), &current_id)?;
                RegistryRequest::set_state(conn, &registry_id, confirmed_state, None)?;
                Ok(())
            })
            .await?;
            info!(
                "Registry request {} advanced to {}",
                registry.id,
                confirmed_state.as_str()
            );
        }
        Ok(())
    }
}
