//! Admin multi-sig dispatchers: authorize refund (redeemer 6) and disputed
//! withdrawal (redeemer 4). Both require a threshold of the payment source's
//! admin wallets to co-sign; the submit flow lists exactly the witnessing
//! admins as required signers so the validator can enforce the same rule.

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::db::{run, run_serializable};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_request::PaymentRequest;
use crate::models::payment_source::PaymentSource;
use crate::models::state::{OnChainState, PaymentAction};
use crate::models::transaction::Transaction;
use crate::services::dispatchers::spend::{spend_escrow, SpendPlan};
use crate::services::dispatchers::{fail_payment, find_escrow_utxo, DispatcherContext};
use crate::services::wallet_locker;
use masumi_codec::{Redeemer, SmartContractState};

async fn process_authorize_refund(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PaymentRequest,
) -> Result<()> {
    if !matches!(
        request.state()?,
        Some(OnChainState::RefundRequested) | Some(OnChainState::Disputed)
    ) {
        debug!(
            "Payment {} not in a refundable state, skipping authorize-refund",
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
        warn!("No escrow UTXO for payment {} authorize-refund", request.id);
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!(
            "Wallet {} busy, deferring authorize-refund {}",
            wallet.id, request.id
        );
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PaymentRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PaymentRequest::set_action(
            conn,
            &request_id,
            PaymentAction::AuthorizeRefundInitiated,
            None,
            None,
        )
    })
    .await?;

    let mut new_datum = old_datum.clone();
    new_datum.state = SmartContractState::RefundRequested;

    let admins = source.admin_addresses()?;
    let threshold = source.admin_threshold()?;
    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer: Redeemer::AllowRefund,
        new_datum: Some(new_datum),
        payout_address: None,
        co_signers: admins,
        threshold,
    };
    match spend_escrow(ctx, &plan).await {
        Ok(tx_hash) => {
            let placeholder_id = placeholder.id.clone();
            run_serializable(&ctx.pool, move |conn| {
                Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
            })
            .await?;
            info!("Payment {} refund authorization submitted", request.id);
        }
        Err(err) => {
            warn!(
                "Authorize-refund for payment {} failed: {err:#}",
                request.id
            );
            fail_payment(
                ctx,
                &request.id,
                &placeholder.id,
                PaymentAction::AuthorizeRefundRequested,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Admin-authorized refund: `AuthorizeRefundRequested ->
/// AuthorizeRefundInitiated` (redeemer 6) under multi-sig.
pub async fn run_authorize_refund(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PaymentRequest::find_in_action(
                conn,
                &source_id,
                PaymentAction::AuthorizeRefundRequested,
            )
        })
        .await?;
        for chunk in requests.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_authorize_refund(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Authorize-refund dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

async fn process_withdraw_disputed(
    ctx: &DispatcherContext,
    source: &PaymentSource,
    request: &PaymentRequest,
) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if now_ms < request.external_dispute_unlock_time {
        return Ok(());
    }

    let Some((escrow_utxo, _old_datum)) = find_escrow_utxo(
        ctx,
        &source.smart_contract_address,
        &request.blockchain_identifier,
    )
    .await?
    else {
        warn!("No escrow UTXO for payment {} disputed withdrawal", request.id);
        return Ok(());
    };

    let wallet_id = request.hot_wallet_id.clone();
    let wallet = run(&ctx.pool, move |conn| HotWallet::find_by_id(conn, &wallet_id)).await?;
    let Some(placeholder) = wallet_locker::acquire(&ctx.pool, &wallet.id).await? else {
        info!(
            "Wallet {} busy, deferring disputed withdrawal {}",
            wallet.id, request.id
        );
        return Ok(());
    };

    let request_id = request.id.clone();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&ctx.pool, move |conn| {
        PaymentRequest::set_current_transaction(conn, &request_id, Some(&placeholder_id))?;
        PaymentRequest::set_action(conn, &request_id, PaymentAction::WithdrawInitiated, None, None)
    })
    .await?;

    let admins = source.admin_addresses()?;
    let threshold = source.admin_threshold()?;
    let plan = SpendPlan {
        source,
        wallet: &wallet,
        escrow_utxo: &escrow_utxo,
        redeemer: Redeemer::WithdrawDisputed,
        new_datum: None,
        payout_address: wallet.collection_address.clone(),
        co_signers: admins,
        threshold,
    };
    match spend_escrow(ctx, &plan).await {
        Ok(tx_hash) => {
            let placeholder_id = placeholder.id.clone();
            run_serializable(&ctx.pool, move |conn| {
                Transaction::set_tx_hash(conn, &placeholder_id, &tx_hash)
            })
            .await?;
            info!("Payment {} disputed withdrawal submitted", request.id);
        }
        Err(err) => {
            warn!(
                "Disputed withdrawal for payment {} failed: {err:#}",
                request.id
            );
            fail_payment(
                ctx,
                &request.id,
                &placeholder.id,
                PaymentAction::WaitingForExternalAction,
                &format!("{err:#}"),
            )
            .await;
        }
    }
    Ok(())
}

/// Disputed withdrawal (redeemer 4): disputes still open past the external
/// dispute deadline are paid out under admin multi-sig.
pub async fn run_withdraw_disputed(ctx: &DispatcherContext) -> Result<()> {
    let sources = run(&ctx.pool, PaymentSource::find_active).await?;
    for source in sources {
        let source_id = source.id.clone();
        let requests = run(&ctx.pool, move |conn| {
            PaymentRequest::find_in_action(
                conn,
                &source_id,
                PaymentAction::WaitingForExternalAction,
            )
        })
        .await?;
        let eligible: Vec<_> = requests
            .into_iter()
            .filter(|request| request.state().ok() == Some(Some(OnChainState::Disputed)))
            .collect();
        for chunk in eligible.chunks(ctx.config.max_parallel_tx) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|request| process_withdraw_disputed(ctx, &source, request))
                .collect();
            for outcome in join_all(futures).await {
                if let Err(err) = outcome {
                    warn!("Disputed-withdrawal dispatch failed: {err:#}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use masumi_codec::{Address, Network};

    #[test]
    fn test_admin_threshold_is_majority() {
        let admins: Vec<String> = (1u8..=3)
            .map(|i| Address::from_key_hash([i; 28], None).to_bech32(Network::Preprod))
            .collect();
        let source = PaymentSource {
            id: "s".into(),
            network: "Preprod".into(),
            smart_contract_address: "addr_test1s".into(),
            policy_id: "aa".repeat(28),
            compiled_script: String::new(),
            fee_rate_permille: 50,
            admin_wallet_addresses: serde_json::to_string(&admins).unwrap(),
            rpc_provider_api_key: "key".into(),
            last_identifier_checked: None,
            sync_in_progress: false,
            sync_started_at: None,
            disabled_at: None,
            deleted_at: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(source.admin_addresses().unwrap().len(), 3);
        assert_eq!(source.admin_threshold().unwrap(), 2);
    }
}
