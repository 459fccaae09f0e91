//! Refund-toggle dispatchers (purchase side).
//!
//! Both families select `SetRefundRequestedRequested` rows; the current
//! on-chain state keeps them disjoint. A request moves the escrow into the
//! refund branch (redeemer 1), a cancel moves it back out (redeemer 2).

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_source::PaymentSource;
use crate::models::purchase_request::PurchaseRequest;
use crate::models::state::{OnChainState, PurchasingAction};
use crate::models::transaction::Transaction;
use crate::services::dispatchers::spend::{spend_escrow, SpendPlan};
use crate::services::dispatchers::{fail_purchase, find_escrow_utxo, DispatcherContext};
use crate::services::wallet_locker;
use masumi_codec::{Redeemer, SmartContractState};

async fn process_refund_toggle(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PurchaseRequest,
    redeemer: Redeemer,
) -> Result<()> {
    let Some((escrow_utxo, old_datum)) = find_escrow_utxo(
        ctx,
        &source.smart_contract_address,
        &request.blockchain_identifier,
    )
    .await?
    else {
        warn!(
            "No escrow UTXO found for purchase {} - waiting for chain",
            request.id
        );
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!(
            "Wallet {} busy, deferring refund toggle for {}",
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
            PurchasingAction::SetRefundRequestedInitiated,
            None,
            None,
        )
    })
    .await?;

    let mut new_datum = old_datum.clone();
    new_datum.state = match redeemer {
        Redeemer::RequestRefund => {
            if old_datum.result_hash.is_empty() {
                SmartContractState::RefundRequested
            } else {
                SmartContractState::Disputed
            }
        }
        Redeemer::CancelRefundRequest => {
            if old_datum.result_hash.is_empty() {
                SmartContractState::FundsLocked
            } else {
                SmartContractState::ResultSubmitted
            }
        }
        other => anyhow::bail!("refund toggle called with redeemer {other}"),
    };

    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer,
        new_datum: Some(new_datum),
        payout_address: None,
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
            info!(
                "Purchase {} refund toggle ({}) submitted",
                request.id,
                redeemer.as_str()
            );
        }
        Err(err) => {
            warn!(
                "Refund toggle for purchase {} failed: {err:#}",
                request.id
            );
            fail_purchase(
                ctx,
                &request.id,
                &placeholder.id,
                PurchasingAction::SetRefundRequestedRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

fn state_in(request: &PurchaseRequest, states: &[OnChainState]) -> bool {
    request
        .state()
        .ok()
        .flatten()
        .map(|state| states.contains(&state))
        .unwrap_or(false)
}

/// Refund request (redeemer 1): escrow in `FundsLocked`/`ResultSubmitted`.
pub async fn run_request_refund(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PurchaseRequest::find_in_action(
                conn,
                &source_id,
                PurchasingAction::SetRefundRequestedRequested,
            )
        })
        .await?;
        let eligible: Vec<_> = requests
            .into_iter()
            .filter(|request| {
                state_in(request, &[OnChainState::FundsLocked, OnChainState::ResultSubmitted])
            })
            .collect();
        for chunk in eligible.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| {
                    process_refund_toggle(ctx, &source, request, Redeemer::RequestRefund)
                })
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Refund-request dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

/// Cancel refund request (redeemer 2): escrow in `RefundRequested`/`Disputed`.
pub async fn run_cancel_refund(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PurchaseRequest::find_in_action(
                conn,
                &source_id,
                PurchasingAction::SetRefundRequestedRequested,
            )
        })
        .await?;
        let eligible: Vec<_> = requests
            .into_iter()
            .filter(|request| {
                state_in(request, &[OnChainState::RefundRequested, OnChainState::Disputed])
            })
            .collect();
        for chunk in eligible.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| {
                    process_refund_toggle(ctx, &source, request, Redeemer::CancelRefundRequest)
                })
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Cancel-refund dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}
