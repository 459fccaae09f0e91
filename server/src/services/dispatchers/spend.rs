//! Shared escrow-spending flow.
//!
//! Every transition dispatcher (submit result, refund request and cancel,
//! authorize refund, the three withdrawals) spends the escrow UTXO with one
//! redeemer and either continues the escrow with a new datum or pays the
//! value out. The differences are parameterized here; the build, evaluate,
//! sign, submit sequence is identical.

use anyhow::{Context, Result};

use crate::models::hot_wallet::HotWallet;
use crate::models::payment_source::PaymentSource;
use crate::chain::TxUtxo;
use crate::services::dispatchers::{
    change_value, pick_collateral, sign_and_submit, to_tx_input, wallet_inputs,
    DispatcherContext, VALIDITY_SLACK_SECS,
};
use masumi_codec::tx::{RedeemerEntry, RedeemerPurpose, TxBuilder, TxOutput, Value};
use masumi_codec::{EscrowDatum, Redeemer};

/// One escrow spend, fully specified.
pub(crate) struct SpendPlan<'a> {
    pub source: &'a PaymentSource,
    pub wallet: &'a HotWallet,
    pub escrow_utxo: &'a TxUtxo,
    pub redeemer: Redeemer,
    /// Continue the escrow at the script address with this datum.
    pub new_datum: Option<EscrowDatum>,
    /// Pay the escrow value out here instead (wallet or sweep destination).
    pub payout_address: Option<String>,
    /// Admin co-signers and how many of them must sign. The submit flow
    /// lists the witnessing admins as the transaction's required signers.
    pub co_signers: Vec<String>,
    pub threshold: usize,
}

fn escrow_value(utxo: &TxUtxo) -> Value {
    Value {
        lovelace: utxo.lovelace(),
        assets: utxo
            .amounts
            .iter()
            .filter(|amount| amount.unit != "lovelace")
            .map(|amount| (amount.unit.clone(), amount.quantity))
            .collect(),
    }
}

/// Build, evaluate, sign and submit one escrow spend. Returns the tx hash.
pub(crate) async fn spend_escrow(
    ctx: &DispatcherContext,
    plan: &SpendPlan<'_>,
) -> Result<String> {
    let network = plan.source.network()?;
    let fee_inputs = wallet_inputs(ctx, plan.wallet).await?;
    let collateral = pick_collateral(&fee_inputs, ctx.config.min_collateral_lovelace)
        .context("No adequate collateral UTXO")?;
    let compiled = hex::decode(&plan.source.compiled_script)
        .context("payment source compiled script is not hex")?;

    let escrow_input = to_tx_input(plan.escrow_utxo)?;
    let mut all_inputs: Vec<_> = fee_inputs
        .iter()
        .map(to_tx_input)
        .collect::<Result<Vec<_>>>()?;
    all_inputs.push(escrow_input);
    let mut sorted = all_inputs.clone();
    sorted.sort();
    let escrow_index = sorted
        .iter()
        .position(|input| *input == escrow_input)
        .expect("escrow input is present") as u32;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let build = |fee: u64| -> Result<TxBuilder> {
        let mut builder = TxBuilder::new()
            .inputs(all_inputs.iter().copied())
            .collateral(to_tx_input(&collateral)?)
            .attach_script(compiled.clone())
            .redeemer(RedeemerEntry {
                purpose: RedeemerPurpose::Spend,
                input_index: escrow_index,
                data: plan.redeemer.to_plutus(),
                ex_units: Default::default(),
            })
            .validity_window(network, now_ms, VALIDITY_SLACK_SECS)
            .fee(fee);

        if let Some(datum) = &plan.new_datum {
            builder = builder.output(
                TxOutput::new(
                    plan.source.smart_contract_address.clone(),
                    escrow_value(plan.escrow_utxo),
                )
                .with_datum(datum.to_plutus()),
            );
            let change = change_value(&fee_inputs, 0, fee, &[])?;
            builder = builder.output(TxOutput::new(plan.wallet.address.clone(), change));
        } else {
            // Escrow value plus wallet change, minus fee, to the payout.
            let payout = plan
                .payout_address
                .clone()
                .unwrap_or_else(|| plan.wallet.address.clone());
            let mut value = escrow_value(plan.escrow_utxo);
            let change = change_value(&fee_inputs, 0, fee, &[])?;
            value.lovelace += change.lovelace;
            // Merge duplicate units across escrow value and wallet change.
            let mut merged: std::collections::BTreeMap<String, u64> =
                value.assets.into_iter().collect();
            for (unit, amount) in change.assets {
                *merged.entry(unit).or_insert(0) += amount;
            }
            value.assets = merged.into_iter().collect();
            builder = builder.output(TxOutput::new(payout, value));
        }
        Ok(builder)
    };

    let mut draft = build(0)?;
    let fee = draft.estimate_and_set_fee()?;
    let builder = build(fee)?;

    sign_and_submit(
        ctx,
        plan.wallet,
        builder,
        true,
        &plan.co_signers,
        plan.threshold,
    )
    .await
}
