//! Action dispatchers.
//!
//! Each dispatcher family selects entities whose next action is in a
//! `*Requested` state, takes the wallet lock, authors the transaction and
//! submits it, leaving the entity in `*Initiated` for the sync loop to
//! confirm. Dispatchers run on a shared timer; a per-family try-lock mutex
//! keeps cycles from overlapping within one coordinator instance, row-level
//! locks coordinate with peer instances.

use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainAdapter, TxUtxo};
use crate::config::EngineConfig;
use crate::db::DbPool;
use crate::models::hot_wallet::HotWallet;
use crate::services::signer::WalletSigner;
use masumi_codec::script::blake2b_256;
use masumi_codec::tx::{ExUnits, TxBuilder, TxInput, VkeyWitness};
use masumi_codec::EscrowDatum;

pub mod admin;
pub mod lock_funds;
pub mod refunds;
pub mod register;
pub(crate) mod spend;
pub mod submit_result;
pub mod withdraw;

/// Largest-first coin selection cap.
pub const MAX_UTXOS_PER_TX: usize = 10;

/// Transaction validity slack around now, in seconds.
pub const VALIDITY_SLACK_SECS: i64 = 150;

/// Shared state handed to every dispatcher.
pub struct DispatcherContext {
    pub pool: DbPool,
    pub adapter: Arc<dyn ChainAdapter>,
    pub signer: Arc<dyn WalletSigner>,
    pub config: EngineConfig,
}

static REGISTER_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static DEREGISTER_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static LOCK_FUNDS_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SUBMIT_RESULT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static REFUND_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static CANCEL_REFUND_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static AUTHORIZE_REFUND_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static WITHDRAW_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static WITHDRAW_REFUND_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static WITHDRAW_DISPUTED_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Run one dispatcher cycle under its family mutex; skip (and log) when the
/// previous cycle is still running.
async fn guarded<F, Fut>(name: &'static str, lock: &'static Mutex<()>, cycle: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let Ok(_guard) = lock.try_lock() else {
        debug!("{name} dispatcher cycle still running, skipping");
        return;
    };
    if let Err(err) = cycle().await {
        error!("{name} dispatcher cycle failed: {err:#}");
    }
}

/// Spawn the dispatcher timer loop.
pub async fn start(ctx: Arc<DispatcherContext>) {
    let mut timer = interval(ctx.config.dispatch_interval);
    info!(
        "Starting action dispatchers (interval {:?})",
        ctx.config.dispatch_interval
    );
    loop {
        timer.tick().await;
        guarded("register", &REGISTER_LOCK, || register::run_register(&ctx)).await;
        guarded("deregister", &DEREGISTER_LOCK, || {
            register::run_deregister(&ctx)
        })
        .await;
        guarded("lock-funds", &LOCK_FUNDS_LOCK, || {
            lock_funds::run_lock_funds(&ctx)
        })
        .await;
        guarded("submit-result", &SUBMIT_RESULT_LOCK, || {
            submit_result::run_submit_result(&ctx)
        })
        .await;
        guarded("request-refund", &REFUND_LOCK, || {
            refunds::run_request_refund(&ctx)
        })
        .await;
        guarded("cancel-refund", &CANCEL_REFUND_LOCK, || {
            refunds::run_cancel_refund(&ctx)
        })
        .await;
        guarded("authorize-refund", &AUTHORIZE_REFUND_LOCK, || {
            admin::run_authorize_refund(&ctx)
        })
        .await;
        guarded("withdraw", &WITHDRAW_LOCK, || withdraw::run_withdraw(&ctx)).await;
        guarded("withdraw-refund", &WITHDRAW_REFUND_LOCK, || {
            withdraw::run_withdraw_refund(&ctx)
        })
        .await;
        guarded("withdraw-disputed", &WITHDRAW_DISPUTED_LOCK, || {
            admin::run_withdraw_disputed(&ctx)
        })
        .await;
    }
}

// --- shared building blocks ----------------------------------------------

pub(crate) fn to_tx_input(utxo: &TxUtxo) -> Result<TxInput> {
    let bytes = hex::decode(&utxo.tx_hash).context("utxo tx hash is not hex")?;
    let tx_hash: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("utxo tx hash is not 32 bytes"))?;
    Ok(TxInput {
        tx_hash,
        index: utxo.output_index,
    })
}

/// Largest-first selection: sort by lovelace descending, cap the count.
/// Plain wallet UTXOs only - anything carrying a datum or reference script
/// is not spendable change.
pub(crate) fn select_wallet_inputs(mut utxos: Vec<TxUtxo>) -> Vec<TxUtxo> {
    utxos.retain(|utxo| utxo.inline_datum.is_none() && utxo.reference_script_hash.is_none());
    utxos.sort_by(|a, b| b.lovelace().cmp(&a.lovelace()));
    utxos.truncate(MAX_UTXOS_PER_TX);
    utxos
}

/// A single collateral UTXO of at least the configured minimum, ada-only.
pub(crate) fn pick_collateral(utxos: &[TxUtxo], min_lovelace: i64) -> Option<TxUtxo> {
    utxos
        .iter()
        .filter(|utxo| {
            utxo.inline_datum.is_none()
                && utxo.amounts.iter().all(|amount| amount.unit == "lovelace")
                && utxo.lovelace() >= min_lovelace.max(0) as u64
        })
        .min_by_key(|utxo| utxo.lovelace())
        .cloned()
}

/// Fetch, filter and cap the wallet's UTXOs; error when the wallet is empty.
pub(crate) async fn wallet_inputs(
    ctx: &DispatcherContext,
    wallet: &HotWallet,
) -> Result<Vec<TxUtxo>> {
    let utxos = ctx
        .adapter
        .utxos_at(&wallet.address)
        .await
        .context("Failed to fetch wallet UTXOs")?;
    let selected = select_wallet_inputs(utxos);
    if selected.is_empty() {
        anyhow::bail!("No UTXOs available at wallet address {}", wallet.address);
    }
    Ok(selected)
}

/// Locate the escrow UTXO for a blockchain identifier at the script address.
pub(crate) async fn find_escrow_utxo(
    ctx: &DispatcherContext,
    script_address: &str,
    blockchain_identifier: &str,
) -> Result<Option<(TxUtxo, EscrowDatum)>> {
    let utxos = ctx
        .adapter
        .utxos_at(script_address)
        .await
        .context("Failed to fetch script UTXOs")?;
    for utxo in utxos {
        let Some(datum_hex) = utxo.inline_datum.as_deref() else {
            continue;
        };
        let Ok(datum) = EscrowDatum::decode_hex(datum_hex) else {
            continue;
        };
        if datum.blockchain_identifier == blockchain_identifier {
            return Ok(Some((utxo, datum)));
        }
    }
    Ok(None)
}

/// Change back to the wallet: input lovelace minus what the transaction
/// spends elsewhere, carrying along every input asset not excluded.
pub(crate) fn change_value(
    inputs: &[TxUtxo],
    spent_lovelace: u64,
    fee: u64,
    exclude_units: &[String],
) -> Result<masumi_codec::tx::Value> {
    let total: u64 = inputs.iter().map(|utxo| utxo.lovelace()).sum();
    let available = total
        .checked_sub(spent_lovelace)
        .and_then(|rest| rest.checked_sub(fee))
        .context("Insufficient lovelace in selected inputs")?;
    let mut assets: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
    for utxo in inputs {
        for amount in &utxo.amounts {
            if amount.unit != "lovelace" && !exclude_units.contains(&amount.unit) {
                *assets.entry(amount.unit.clone()).or_insert(0) += amount.quantity;
            }
        }
    }
    Ok(masumi_codec::tx::Value {
        lovelace: available,
        assets: assets.into_iter().collect(),
    })
}

/// Evaluate (when script-spending), sign and submit. Returns the accepted
/// transaction hash.
///
/// `co_signers` lists admin addresses eligible to co-sign; `threshold` of
/// them must be available or the submit is aborted. The required-signers
/// field of the body is a strict all-must-sign set on the ledger, so the
/// selection happens here, before the body is built: exactly the admins
/// that will witness get listed, never a pre-computed prefix an instance
/// may not hold keys for.
pub(crate) async fn sign_and_submit(
    ctx: &DispatcherContext,
    wallet: &HotWallet,
    mut builder: TxBuilder,
    needs_evaluation: bool,
    co_signers: &[String],
    threshold: usize,
) -> Result<String> {
    let selected = select_co_signers(ctx.signer.as_ref(), co_signers, threshold)?;
    for (_, key_hash) in &selected {
        builder = builder.required_signer(*key_hash);
    }

    if needs_evaluation {
        let unsigned = builder.build_unsigned()?;
        let reports = ctx
            .adapter
            .evaluate_tx(&unsigned)
            .await
            .context("Execution-unit evaluation failed")?;
        let budgets: Vec<ExUnits> = reports
            .iter()
            .map(|report| ExUnits {
                mem: report.mem,
                steps: report.steps,
            })
            .collect();
        builder.apply_ex_units(&budgets)?;
    }

    let body = builder.build_body()?;
    let body_hash = blake2b_256(&body);

    let mut witnesses: Vec<VkeyWitness> = vec![ctx.signer.sign(wallet, &body_hash)?];
    for (address, _) in &selected {
        witnesses.push(ctx.signer.sign_admin(address, &body_hash)?);
    }

    let signed_tx = builder.build_signed(&witnesses)?;
    let tx_hash = ctx
        .adapter
        .submit_tx(&signed_tx)
        .await
        .context("Transaction submission failed")?;
    Ok(tx_hash)
}

/// Pick up to `threshold` co-signers this instance actually holds keys for,
/// paired with their payment key hashes. Errors when fewer than `threshold`
/// are available.
pub(crate) fn select_co_signers(
    signer: &dyn WalletSigner,
    co_signers: &[String],
    threshold: usize,
) -> Result<Vec<(String, [u8; 28])>> {
    let mut selected = Vec::new();
    if threshold == 0 {
        return Ok(selected);
    }
    for address in co_signers {
        if !signer.has_admin_key(address) {
            warn!("Admin co-signer {address} unavailable on this instance");
            continue;
        }
        let (parsed, _) = masumi_codec::Address::from_bech32(address)
            .with_context(|| format!("admin address {address} is invalid"))?;
        selected.push((address.clone(), *parsed.payment.hash()));
        if selected.len() >= threshold {
            break;
        }
    }
    if selected.len() < threshold {
        anyhow::bail!(
            "Only {}/{} admin signatures available",
            selected.len(),
            threshold
        );
    }
    Ok(selected)
}

/// Roll the placeholder back (releasing the wallet lock) and return the
/// payment entity to `back_to` with a chained error note.
pub(crate) async fn fail_payment(
    ctx: &DispatcherContext,
    request_id: &str,
    placeholder_id: &str,
    back_to: crate::models::state::PaymentAction,
    note: &str,
) {
    use crate::error::{chain_error_note, EntityErrorType};
    use crate::models::payment_request::PaymentRequest;
    use crate::models::state::TxStatus;
    use crate::models::transaction::Transaction;

    let request_id = request_id.to_string();
    let placeholder_id = placeholder_id.to_string();
    let note = note.to_string();
    let outcome = crate::db::run_serializable(&ctx.pool, move |conn| {
        Transaction::settle(conn, &placeholder_id, TxStatus::RolledBack)?;
        let request = PaymentRequest::find_by_id(conn, &request_id)?;
        PaymentRequest::set_current_transaction(conn, &request_id, None)?;
        PaymentRequest::set_action(
            conn,
            &request_id,
            back_to,
            Some(EntityErrorType::NetworkError.as_str()),
            Some(&chain_error_note(
                request.error_note.as_deref(),
                &request.requested_action,
                &note,
            )),
        )
    })
    .await;
    if let Err(err) = outcome {
        error!("Failed to record payment dispatch failure: {err:#}");
    }
}

/// Purchase-side twin of `fail_payment`.
pub(crate) async fn fail_purchase(
    ctx: &DispatcherContext,
    request_id: &str,
    placeholder_id: &str,
    back_to: crate::models::state::PurchasingAction,
    note: &str,
) {
    use crate::error::{chain_error_note, EntityErrorType};
    use crate::models::purchase_request::PurchaseRequest;
    use crate::models::state::TxStatus;
    use crate::models::transaction::Transaction;

    let request_id = request_id.to_string();
    let placeholder_id = placeholder_id.to_string();
    let note = note.to_string();
    let outcome = crate::db::run_serializable(&ctx.pool, move |conn| {
        Transaction::settle(conn, &placeholder_id, TxStatus::RolledBack)?;
        let request = PurchaseRequest::find_by_id(conn, &request_id)?;
        PurchaseRequest::set_current_transaction(conn, &request_id, None)?;
        PurchaseRequest::set_action(
            conn,
            &request_id,
            back_to,
            Some(EntityErrorType::NetworkError.as_str()),
            Some(&chain_error_note(
                request.error_note.as_deref(),
                &request.requested_action,
                &note,
            )),
        )
    })
    .await;
    if let Err(err) = outcome {
        error!("Failed to record purchase dispatch failure: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxAmount;

    fn utxo(lovelace: u64, with_datum: bool) -> TxUtxo {
        TxUtxo {
            tx_hash: "11".repeat(32),
            output_index: 0,
            address: "addr_test1w".into(),
            amounts: vec![TxAmount {
                unit: "lovelace".into(),
                quantity: lovelace,
            }],
            inline_datum: with_datum.then(|| "d87980".to_string()),
            reference_script_hash: None,
            collateral: false,
        }
    }

    #[test]
    fn test_largest_first_selection() {
        let utxos = vec![utxo(1_000_000, false), utxo(9_000_000, false), utxo(5_000_000, false)];
        let selected = select_wallet_inputs(utxos);
        assert_eq!(selected[0].lovelace(), 9_000_000);
        assert_eq!(selected[2].lovelace(), 1_000_000);
    }

    #[test]
    fn test_selection_caps_at_limit() {
        let utxos: Vec<TxUtxo> = (0..25).map(|i| utxo(1_000_000 + i, false)).collect();
        assert_eq!(select_wallet_inputs(utxos).len(), MAX_UTXOS_PER_TX);
    }

    #[test]
    fn test_selection_skips_datum_utxos() {
        let utxos = vec![utxo(9_000_000, true), utxo(2_000_000, false)];
        let selected = select_wallet_inputs(utxos);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].lovelace(), 2_000_000);
    }

    #[test]
    fn test_collateral_picks_smallest_adequate() {
        let utxos = vec![utxo(20_000_000, false), utxo(6_000_000, false), utxo(4_000_000, false)];
        let collateral = pick_collateral(&utxos, 5_000_000).unwrap();
        assert_eq!(collateral.lovelace(), 6_000_000);
    }

    #[test]
    fn test_collateral_none_when_all_too_small() {
        let utxos = vec![utxo(4_000_000, false)];
        assert!(pick_collateral(&utxos, 5_000_000).is_none());
    }

    #[test]
    fn test_co_signer_selection_matches_held_keys() {
        use crate::services::signer::Ed25519Signer;
        use masumi_codec::{Address, Network};

        let addr_a = Address::from_key_hash([1; 28], None).to_bech32(Network::Preprod);
        let addr_b = Address::from_key_hash([2; 28], None).to_bech32(Network::Preprod);
        let addr_c = Address::from_key_hash([3; 28], None).to_bech32(Network::Preprod);
        let admins = vec![addr_a, addr_b.clone(), addr_c.clone()];

        // This instance only holds the second and third admins' keys.
        let signer = Ed25519Signer::new(Box::new(|_: &[u8]| {
            anyhow::bail!("no wallet keys in this test")
        }))
        .with_admin_key(&addr_b, ed25519_dalek::SigningKey::from_bytes(&[9; 32]))
        .with_admin_key(&addr_c, ed25519_dalek::SigningKey::from_bytes(&[8; 32]));

        // The unavailable first admin is skipped; the required-signer set is
        // exactly the admins that will witness.
        let selected = select_co_signers(&signer, &admins, 2).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].1, [2; 28]);
        assert_eq!(selected[1].1, [3; 28]);

        // A threshold this instance cannot meet is an error, not a partial
        // signature set.
        assert!(select_co_signers(&signer, &admins, 3).is_err());

        // Threshold zero selects nobody.
        assert!(select_co_signers(&signer, &admins, 0).unwrap().is_empty());
    }
}
