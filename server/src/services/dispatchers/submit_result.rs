//! Submit-result dispatcher (payment side): writes the seller's result hash
//! into the escrow datum.

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_request::PaymentRequest;
use crate::models::payment_source::PaymentSource;
use crate::models::state::PaymentAction;
use crate::models::transaction::Transaction;
use crate::services::dispatchers::spend::{spend_escrow, SpendPlan};
use crate::services::dispatchers::{fail_payment, find_escrow_utxo, DispatcherContext};
use crate::services::wallet_locker;
use masumi_codec::{Redeemer, SmartContractState};

async fn process_submit(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PaymentRequest,
) -> Result<()> {
    if request.result_hash.is_empty() {
        warn!(
            "Payment {} queued for result submission without a result hash",
            request.id
        );
        return Ok(());
    }

    let Some((escrow_utxo, old_datum)) = find_escrow_utxo(
        ctx,
        &source.smart_contract_address,
        &request.blockchain_identifier,
    )
    .await?
    else {
        warn!(
            "No escrow UTXO found for payment {} - waiting for chain",
            request.id
        );
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!("Wallet {} busy, deferring submit-result {}", wallet.id, request.id);
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PaymentRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PaymentRequest::set_action(
            conn,
            &request_id,
            PaymentAction::SubmitResultInitiated,
            None,
            None,
        )
    })
    .await?;

    let mut new_datum = old_datum.clone();
    new_datum.result_hash = request.result_hash.clone();
    new_datum.state = match old_datum.state {
        SmartContractState::RefundRequested | SmartContractState::Disputed => {
            SmartContractState::Disputed
        }
        _ => SmartContractState::ResultSubmitted,
    };

    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer: Redeemer::SubmitResult,
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
            info!("Payment {} result submission sent", request.id);
        }
        Err(err) => {
            warn!("Submit-result for payment {} failed: {err:#}", request.id);
            fail_payment(
                ctx,
                &request.id,
                &placeholder.id,
                PaymentAction::SubmitResultRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// `SubmitResultRequested -> SubmitResultInitiated` (redeemer 5).
pub async fn run_submit_result(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PaymentRequest::find_in_action(conn, &source_id, PaymentAction::SubmitResultRequested)
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_submit(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Submit-result dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}
