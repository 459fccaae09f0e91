//! Lock-funds dispatcher (purchase side): authors the initial transaction
//! that opens the escrow.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_source::PaymentSource;
use crate::models::purchase_request::PurchaseRequest;
use crate::models::request_amount::{AmountOwner, RequestAmount};
use crate::models::state::{AmountKind, PurchasingAction};
use crate::models::transaction::Transaction;
use crate::models::wallet_base::WalletBase;
use crate::services::dispatchers::{
    change_value, fail_purchase, sign_and_submit, to_tx_input, wallet_inputs, DispatcherContext,
    VALIDITY_SLACK_SECS,
};
use crate::services::wallet_locker;
use masumi_codec::address::vkey_hash_from_hex;
use masumi_codec::tx::{TxBuilder, TxOutput, Value};
use masumi_codec::{Address, EscrowDatum, SmartContractState};

/// Datum for a fresh escrow, populated from the purchase request.
fn initial_datum(
    request: &PurchaseRequest,
    buyer: &HotWallet,
    seller: &WalletBase,
) -> Result<EscrowDatum> {
    let (buyer_address, _) =
        Address::from_bech32(&buyer.address).context("buyer wallet address is invalid")?;
    let (seller_address, _) =
        Address::from_bech32(&seller.address).context("seller wallet address is invalid")?;
    Ok(EscrowDatum {
        buyer_vkey: vkey_hash_from_hex(&buyer.vkey)?,
        buyer_address,
        seller_vkey: vkey_hash_from_hex(&seller.vkey)?,
        seller_address,
        blockchain_identifier: request.blockchain_identifier.clone(),
        result_hash: String::new(),
        result_time: request.submit_result_time as u64,
        unlock_time: request.unlock_time as u64,
        external_dispute_unlock_time: request.external_dispute_unlock_time as u64,
        pay_by_time: request.pay_by_time as u64,
        buyer_cooldown_time: 0,
        seller_cooldown_time: 0,
        state: SmartContractState::FundsLocked,
        input_hash: request.input_hash.clone(),
        collateral_return_lovelace: request.collateral_return_lovelace as u64,
    })
}

/// Escrow output value: requested funds, lovelace topped up by the
/// collateral return.
fn escrow_value(requested: &[(String, i64)], collateral_return: i64) -> Value {
    let mut lovelace = collateral_return.max(0) as u64;
    let mut assets = Vec::new();
    for (unit, amount) in requested {
        if unit.is_empty() || unit == "lovelace" {
            lovelace += (*amount).max(0) as u64;
        } else {
            assets.push((unit.clone(), (*amount).max(0) as u64));
        }
    }
    assets.sort();
    Value { lovelace, assets }
}

async fn process_lock(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PurchaseRequest,
) -> Result<()> {
    let network = source.network()?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    if now_ms > request.pay_by_time {
        warn!(
            "Purchase {} pay-by time elapsed before locking funds",
            request.id
        );
        let request_id = request.id.clone();
        run_serializable(&ctx.pool, move |conn| {
            let request = PurchaseRequest::find_by_id(conn, &request_id)?;
            PurchaseRequest::set_action(
                conn,
                &request_id,
                PurchasingAction::WaitingForManualAction,
                Some(crate::error::EntityErrorType::InvalidState.as_str()),
                Some(&crate::error::chain_error_note(
                    request.error_note.as_deref(),
                    &request.requested_action,
                    "Pay by time elapsed before funds could be locked.",
                )),
            )
        })
        .await?;
        return Ok(());
    }

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let seller_id = request.seller_wallet_id.clone();
    let seller = run(&ctx.pool, move |conn| WalletBase::find_by_id(conn, &seller_id)).await?;
    let request_id_for_amounts = request.id.clone();
    let requested = run(&ctx.pool, move |conn| {
        RequestAmount::pairs_for(
            conn,
            AmountOwner::Purchase(&request_id_for_amounts),
            AmountKind::Requested,
        )
    })
    .await?;
    if requested.is_empty() {
        anyhow::bail!("purchase {} has no requested funds recorded", request.id);
    }

    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!("Wallet {} busy, deferring lock-funds {}", wallet.id, request.id);
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PurchaseRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PurchaseRequest::set_action(
            conn,
            &request_id,
            PurchasingAction::FundsLockingInitiated,
            None,
            None,
        )
    })
    .await?;

    let outcome: Result<String> = async {
        let datum = initial_datum(request, &wallet, &seller)?;
        let value = escrow_value(&requested, request.collateral_return_lovelace);
        let inputs = wallet_inputs(ctx, &wallet).await?;
        let spent = value.lovelace;

        let build = |fee: u64| -> Result<TxBuilder> {
            let mut builder = TxBuilder::new()
                .inputs(inputs.iter().map(to_tx_input).collect::<Result<Vec<_>>>()?)
                .output(
                    TxOutput::new(source.smart_contract_address.clone(), value.clone())
                        .with_datum(datum.to_plutus()),
                )
                .validity_window(network, now_ms, VALIDITY_SLACK_SECS)
                .fee(fee);
            let change = change_value(&inputs, spent, fee, &[])?;
            if change.lovelace > 0 || !change.assets.is_empty() {
                builder = builder.output(TxOutput::new(wallet.address.clone(), change));
            }
            Ok(builder)
        };
        let mut draft = build(0)?;
        let fee = draft.estimate_and_set_fee()?;
        let builder = build(fee)?;

        // No script execution in the initial tx, so no evaluation pass.
        sign_and_submit(ctx, &wallet, builder, false, &[], 0).await
    }
    .await;

    match outcome {
        Ok(tx_hash) => {
            let placeholder_id = placeholder.id.clone();
            run_serializable(&ctx.pool, move |conn| {
                Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
            })
            .await?;
            info!("Purchase {} funds-locking submitted", request.id);
        }
        Err(err) => {
            warn!("Lock-funds for purchase {} failed: {err:#}", request.id);
            fail_purchase(
                ctx,
                &request.id,
                &placeholder.id,
                PurchasingAction::FundsLockingRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// `FundsLockingRequested -> FundsLockingInitiated`; the sync loop promotes
/// to `WaitingForExternalAction` once it observes the escrow output.
pub async fn run_lock_funds(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PurchaseRequest::find_in_action(
                conn,
                &source_id,
                PurchasingAction::FundsLockingRequested,
            )
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_lock(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Lock-funds dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}
