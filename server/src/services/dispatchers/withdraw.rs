//! Withdrawal dispatchers: the seller's payout (redeemer 0) and the buyer's
//! refund withdrawal (redeemer 3). Both only fire after the unlock time.

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_request::PaymentRequest;
use crate::models::payment_source::PaymentSource;
use crate::models::purchase_request::PurchaseRequest;
use crate::models::state::{OnChainState, PaymentAction, PurchasingAction};
use crate::models::transaction::Transaction;
use crate::services::dispatchers::spend::{spend_escrow, SpendPlan};
use crate::services::dispatchers::{fail_payment, fail_purchase, find_escrow_utxo, DispatcherContext};
use crate::services::wallet_locker;
use masumi_codec::Redeemer;

async fn process_withdraw(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PaymentRequest,
) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if now_ms < request.unlock_time {
        debug!(
            "Payment {} not yet past unlock time, deferring withdraw",
            request.id
        );
        return Ok(());
    }
    if request.state()? != Some(OnChainState::ResultSubmitted) {
        debug!(
            "Payment {} not in ResultSubmitted, skipping withdraw",
            request.id
        );
        return Ok(());
    }

    let Some((escrow_utxo, _old_datum)) = find_escrow_utxo(
        ctx,
        &source.smart_contract_address,
        &request.blockchain_identifier,
    )
    .await?
    else {
        warn!("No escrow UTXO for payment {} withdraw", request.id);
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!("Wallet {} busy, deferring withdraw {}", wallet.id, request.id);
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PaymentRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PaymentRequest::set_action(conn, &request_id, PaymentAction::WithdrawInitiated, None, None)
    })
    .await?;

    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer: Redeemer::Withdraw,
        new_datum: None,
        payout_address: wallet.collection_address.clone(),
        co_signers: Vec::new(),
        threshold: 0,
    };
    match spend_escrow(ctx, &plan).await {
        Ok(tx_hash) => {
            let placeholder_id = placeholder.id.clone();
            run_serializable(&ctx.pool, move |conn| {
                Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
            })
            .await?;
            info!("Payment {} withdrawal submitted", request.id);
        }
        Err(err) => {
            warn!("Withdraw for payment {} failed: {err:#}", request.id);
            fail_payment(
                ctx,
                &request.id,
                &placeholder.id,
                PaymentAction::WithdrawRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Seller payout: `WithdrawRequested -> WithdrawInitiated` (redeemer 0),
/// valid after `unlock_time` with the result submitted.
pub async fn run_withdraw(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PaymentRequest::find_in_action(conn, &source_id, PaymentAction::WithdrawRequested)
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_withdraw(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Withdraw dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

async fn process_withdraw_refund(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PurchaseRequest,
) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if now_ms < request.unlock_time {
        debug!(
            "Purchase {} not yet past unlock time, deferring refund withdrawal",
            request.id
        );
        return Ok(());
    }
    if request.state()? != Some(OnChainState::RefundRequested) {
        debug!(
            "Purchase {} not in RefundRequested, skipping refund withdrawal",
            request.id
        );
        return Ok(());
    }

    let Some((escrow_utxo, _old_datum)) = find_escrow_utxo(
        ctx,
        &source.smart_contract_address,
        &request.blockchain_identifier,
    )
    .await?
    else {
        warn!("No escrow UTXO for purchase {} refund withdrawal", request.id);
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!(
            "Wallet {} busy, deferring refund withdrawal {}",
            wallet.id, request.id
        );
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PurchaseRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PurchaseRequest::set_action(
            conn,
            &request_id,
            PurchasingAction::WithdrawRefundInitiated,
            None,
            None,
        )
    })
    .await?;

    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer: Redeemer::WithdrawRefund,
        new_datum: None,
        payout_address: wallet.collection_address.clone(),
        co_signers: Vec::new(),
        threshold: 0,
    };
    match spend_escrow(ctx, &plan).await {
        Ok(tx_hash) => {
            let placeholder_id = placeholder.id.clone();
            run_serializable(&ctx.pool, move |conn| {
                Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
            })
            .await?;
            info!("Purchase {} refund withdrawal submitted", request.id);
        }
        Err(err) => {
            warn!(
                "Refund withdrawal for purchase {} failed: {err:#}",
                request.id
            );
            fail_purchase(
                ctx,
                &request.id,
                &placeholder.id,
                PurchasingAction::WithdrawRefundRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Buyer refund payout: `WithdrawRefundRequested -> WithdrawRefundInitiated`
/// (redeemer 3), valid after `unlock_time` with the refund approved.
pub async fn run_withdraw_refund(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PurchaseRequest::find_in_action(
                conn,
                &source_id,
                PurchasingAction::WithdrawRefundRequested,
            )
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_withdraw_refund(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Refund-withdrawal dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}
