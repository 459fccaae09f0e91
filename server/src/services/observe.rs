//! Applying observed chain transactions to the mirrors.
//!
//! Everything here runs inside the sync loop's per-transaction serializable
//! database transaction: matching initial escrow outputs against the two
//! mirrors (with the deliberate asymmetry - the buyer mirror silently
//! ignores spoofed outputs, the seller mirror records them for an operator),
//! and applying redeemer transitions to both mirrors at once.

use anyhow::{Context, Result};
use diesel::prelude::*;
use tracing::{debug, info, warn};

use crate::chain::TxUtxo;
use crate::error::{chain_error_note, EntityErrorType};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_request::PaymentRequest;
use crate::models::purchase_request::PurchaseRequest;
use crate::models::request_amount::{AmountOwner, RequestAmount};
use crate::models::state::{
    AmountKind, OnChainState, PaymentAction, PurchasingAction, TxStatus,
};
use crate::models::transaction::{
    HistoryOwner, NewTransaction, Transaction, TransactionHistory,
};
use crate::models::wallet_base::WalletBase;
use crate::services::transitions::{
    amounts_cover, next_payment_action, next_purchasing_action, state_after_redeemer,
};
use masumi_codec::{EscrowDatum, Network, Redeemer, SmartContractState};

/// An escrow-opening output under inspection.
pub struct ObservedInitial<'a> {
    pub source_id: &'a str,
    pub network: Network,
    pub tx_hash: &'a str,
    /// Block time in epoch milliseconds.
    pub block_time_ms: i64,
    pub datum: &'a EscrowDatum,
    pub output: &'a TxUtxo,
    /// Addresses of all transaction inputs (anti-spoofing check).
    pub input_addresses: &'a [String],
}

/// A verified state transition ready to apply.
pub struct ObservedTransition<'a> {
    pub source_id: &'a str,
    pub tx_hash: &'a str,
    pub redeemer: Redeemer,
    pub old_datum: &'a EscrowDatum,
    pub new_datum: Option<&'a EscrowDatum>,
    pub new_output: Option<&'a TxUtxo>,
    /// Per-party net value movements, only populated for disputed
    /// withdrawals.
    pub withdrawn_for_seller: Vec<(String, i64)>,
    pub withdrawn_for_buyer: Vec<(String, i64)>,
}

/// Fields both mirrors agreed on at creation time.
struct StoredTerms {
    pay_by_time: i64,
    submit_result_time: i64,
    unlock_time: i64,
    external_dispute_unlock_time: i64,
    collateral_return_lovelace: i64,
}

/// Check an initial datum against the stored terms. Returns every violation,
/// not just the first, so the seller-side error note is complete.
fn validate_initial_terms(
    obs: &ObservedInitial<'_>,
    stored: &StoredTerms,
) -> Vec<String> {
    let datum = obs.datum;
    let mut violations = Vec::new();

    if datum.pay_by_time as i64 != stored.pay_by_time {
        violations.push("Pay by time is not the agreed upon time.".to_string());
    }
    if datum.result_time as i64 != stored.submit_result_time {
        violations.push("Submit result time is not the agreed upon time.".to_string());
    }
    if datum.external_dispute_unlock_time as i64 != stored.external_dispute_unlock_time {
        violations.push("External dispute unlock time is not the agreed upon time.".to_string());
    }
    if (datum.unlock_time as i64) < stored.unlock_time {
        violations.push("Unlock time is before the agreed upon time.".to_string());
    }
    if datum.collateral_return_lovelace as i64 != stored.collateral_return_lovelace {
        violations.push("Collateral return does not match the agreed upon amount.".to_string());
    }
    if datum.buyer_cooldown_time != 0 {
        violations.push("Buyer cooldown time is not zero.".to_string());
    }
    if datum.seller_cooldown_time != 0 {
        violations.push("Seller cooldown time is not zero.".to_string());
    }
    if matches!(
        datum.state,
        SmartContractState::RefundRequested | SmartContractState::Disputed
    ) {
        violations.push("Datum state is not an initial state.".to_string());
    }
    if !datum.result_hash.is_empty() {
        violations.push("Result hash is not empty.".to_string());
    }
    if obs.block_time_ms > datum.pay_by_time as i64 {
        violations.push("Transaction was submitted after the pay by time.".to_string());
    }
    if obs.output.reference_script_hash.is_some() {
        violations.push("Reference script attached to the escrow output.".to_string());
    }
    let buyer_address = datum.buyer_address.to_bech32(obs.network);
    if !obs.input_addresses.iter().any(|a| *a == buyer_address) {
        violations.push("No transaction input matches the buyer address.".to_string());
    }
    violations
}

fn paid_funds_of(output: &TxUtxo) -> Vec<(String, i64)> {
    output
        .amounts
        .iter()
        .map(|amount| (amount.unit.clone(), amount.quantity as i64))
        .collect()
}

/// Settle the entity's current pending transaction (releasing the wallet
/// lock), push it to history and install the observed chain transaction as
/// the new Confirmed current transaction.
fn rotate_current_transaction(
    conn: &mut SqliteConnection,
    current_transaction_id: Option<&str>,
    owner: HistoryOwner<'_>,
    observed_tx_hash: &str,
) -> Result<String> {
    if let Some(current_id) = current_transaction_id {
        let current = Transaction::find_by_id(conn, current_id)?;
        if current.status()? == TxStatus::Pending {
            Transaction::settle(conn, current_id, TxStatus::Confirmed)?;
        }
        TransactionHistory::append(conn, owner, current_id)?;
    }
    let observed = Transaction::create(conn, NewTransaction::confirmed(observed_tx_hash))?;
    Ok(observed.id)
}

/// Initial outputs: try to match the buyer mirror.
///
/// Any mismatch is treated as a spoof attempt and silently ignored - the
/// purchase record must not be movable by a third party writing to the
/// script address.
pub fn match_purchase_initial(
    conn: &mut SqliteConnection,
    obs: &ObservedInitial<'_>,
) -> Result<bool> {
    let Some(purchase) = PurchaseRequest::find_by_identifier(
        conn,
        obs.source_id,
        &obs.datum.blockchain_identifier,
    )?
    else {
        return Ok(false);
    };
    if purchase.action()? != PurchasingAction::FundsLockingInitiated {
        debug!(
            "Initial output for purchase {} ignored: action is {}",
            purchase.id, purchase.requested_action
        );
        return Ok(false);
    }

    let seller = WalletBase::find_by_id(conn, &purchase.seller_wallet_id)?;
    let own_wallet = HotWallet::find_by_id(conn, &purchase.hot_wallet_id)?;

    let datum = obs.datum;
    let seller_vkey_hex = hex::encode(datum.seller_vkey);
    let seller_address = datum.seller_address.to_bech32(obs.network);
    let buyer_vkey_hex = hex::encode(datum.buyer_vkey);
    let buyer_address = datum.buyer_address.to_bech32(obs.network);

    let mut spoofed = seller_vkey_hex != seller.vkey || seller_address != seller.address;
    spoofed |= buyer_vkey_hex != own_wallet.vkey || buyer_address != own_wallet.address;

    let stored = StoredTerms {
        pay_by_time: purchase.pay_by_time,
        submit_result_time: purchase.submit_result_time,
        unlock_time: purchase.unlock_time,
        external_dispute_unlock_time: purchase.external_dispute_unlock_time,
        collateral_return_lovelace: purchase.collateral_return_lovelace,
    };
    let violations = validate_initial_terms(obs, &stored);
    if spoofed || !violations.is_empty() {
        warn!(
            "Ignoring spoofed initial output for purchase {} in tx {}: {:?}",
            purchase.id, obs.tx_hash, violations
        );
        return Ok(false);
    }

    let new_current = rotate_current_transaction(
        conn,
        purchase.current_transaction_id.as_deref(),
        HistoryOwner::Purchase(&purchase.id),
        obs.tx_hash,
    )?;
    PurchaseRequest::set_current_transaction(conn, &purchase.id, Some(&new_current))?;
    PurchaseRequest::set_on_chain_state(conn, &purchase.id, OnChainState::FundsLocked)?;
    PurchaseRequest::set_action(
        conn,
        &purchase.id,
        PurchasingAction::WaitingForExternalAction,
        None,
        None,
    )?;
    // The datum may carry a later unlock time than agreed; the chain wins.
    if datum.unlock_time as i64 > purchase.unlock_time {
        PurchaseRequest::set_unlock_time(conn, &purchase.id, datum.unlock_time as i64)?;
    }
    RequestAmount::insert_all(
        conn,
        AmountOwner::Purchase(&purchase.id),
        AmountKind::Paid,
        &paid_funds_of(obs.output),
    )?;
    info!(
        "Funds locked for purchase {} by tx {}",
        purchase.id, obs.tx_hash
    );
    Ok(true)
}

/// Initial outputs: try to match the seller mirror.
///
/// Unlike the purchase path, violations are recorded on the entity: the
/// seller is the party that needs operator attention when an on-chain
/// output disagrees with the agreed terms.
pub fn match_payment_initial(
    conn: &mut SqliteConnection,
    obs: &ObservedInitial<'_>,
) -> Result<bool> {
    let Some(payment) = PaymentRequest::find_by_identifier(
        conn,
        obs.source_id,
        &obs.datum.blockchain_identifier,
    )?
    else {
        return Ok(false);
    };
    if payment.action()? != PaymentAction::WaitingForExternalAction
        || payment.buyer_wallet_id.is_some()
    {
        debug!(
            "Initial output for payment {} ignored: action={} buyer_attached={}",
            payment.id,
            payment.requested_action,
            payment.buyer_wallet_id.is_some()
        );
        return Ok(false);
    }

    let own_wallet = HotWallet::find_by_id(conn, &payment.hot_wallet_id)?;
    let datum = obs.datum;
    let seller_vkey_hex = hex::encode(datum.seller_vkey);
    let seller_address = datum.seller_address.to_bech32(obs.network);

    let mut violations = Vec::new();
    if seller_vkey_hex != own_wallet.vkey {
        violations.push("Seller vkey does not match the agreed upon seller.".to_string());
    }
    if seller_address != own_wallet.address {
        violations.push("Seller address does not match the agreed upon seller.".to_string());
    }
    let stored = StoredTerms {
        pay_by_time: payment.pay_by_time,
        submit_result_time: payment.submit_result_time,
        unlock_time: payment.unlock_time,
        external_dispute_unlock_time: payment.external_dispute_unlock_time,
        collateral_return_lovelace: payment.collateral_return_lovelace,
    };
    violations.extend(validate_initial_terms(obs, &stored));

    let new_current = rotate_current_transaction(
        conn,
        payment.current_transaction_id.as_deref(),
        HistoryOwner::Payment(&payment.id),
        obs.tx_hash,
    )?;
    PaymentRequest::set_current_transaction(conn, &payment.id, Some(&new_current))?;

    if !violations.is_empty() {
        let note = violations.join(" ");
        warn!(
            "Invalid initial output for payment {} in tx {}: {}",
            payment.id, obs.tx_hash, note
        );
        PaymentRequest::set_on_chain_state(conn, &payment.id, OnChainState::FundsOrDatumInvalid)?;
        PaymentRequest::set_action(
            conn,
            &payment.id,
            PaymentAction::WaitingForManualAction,
            Some(EntityErrorType::InvalidState.as_str()),
            Some(&chain_error_note(
                payment.error_note.as_deref(),
                &payment.requested_action,
                &note,
            )),
        )?;
        return Ok(true);
    }

    let buyer_vkey_hex = hex::encode(datum.buyer_vkey);
    let buyer_address = datum.buyer_address.to_bech32(obs.network);
    let buyer = WalletBase::find_or_create(conn, obs.source_id, &buyer_vkey_hex, &buyer_address)?;
    PaymentRequest::attach_buyer_wallet(conn, &payment.id, &buyer.id)?;
    PaymentRequest::set_on_chain_state(conn, &payment.id, OnChainState::FundsLocked)?;
    PaymentRequest::set_action(
        conn,
        &payment.id,
        PaymentAction::WaitingForExternalAction,
        None,
        None,
    )?;
    if datum.unlock_time as i64 > payment.unlock_time {
        diesel::update(
            crate::schema::payment_requests::table
                .filter(crate::schema::payment_requests::id.eq(&payment.id)),
        )
        .set(crate::schema::payment_requests::unlock_time.eq(datum.unlock_time as i64))
        .execute(conn)
        .context("Failed to update payment unlock time")?;
    }
    RequestAmount::insert_all(
        conn,
        AmountOwner::Payment(&payment.id),
        AmountKind::Paid,
        &paid_funds_of(obs.output),
    )?;
    info!(
        "Funds locked for payment {} by tx {}",
        payment.id, obs.tx_hash
    );
    Ok(true)
}

/// State transitions: apply one redeemer spend to both mirrors under the
/// caller's serializable transaction.
pub fn apply_transition(conn: &mut SqliteConnection, obs: &ObservedTransition<'_>) -> Result<()> {
    let identifier = &obs.old_datum.blockchain_identifier;
    let payment = PaymentRequest::find_by_identifier(conn, obs.source_id, identifier)?;
    let purchase = PurchaseRequest::find_by_identifier(conn, obs.source_id, identifier)?;
    if payment.is_none() && purchase.is_none() {
        debug!(
            "Transition tx {} references unknown identifier, skipping",
            obs.tx_hash
        );
        return Ok(());
    }

    // Replay guard: a cursor reset re-delivers transactions; one that is
    // already the current transaction of a mirror has been applied.
    fn already_applied(
        conn: &mut SqliteConnection,
        current_id: Option<&str>,
        tx_hash: &str,
    ) -> Result<bool> {
        match current_id {
            Some(id) => Ok(Transaction::find_by_id(conn, id)?.tx_hash == tx_hash),
            None => Ok(false),
        }
    }
    let payment_current = payment.as_ref().and_then(|p| p.current_transaction_id.clone());
    let purchase_current = purchase.as_ref().and_then(|p| p.current_transaction_id.clone());
    if already_applied(conn, payment_current.as_deref(), obs.tx_hash)?
        || already_applied(conn, purchase_current.as_deref(), obs.tx_hash)?
    {
        debug!("Transition tx {} already applied, skipping", obs.tx_hash);
        return Ok(());
    }

    // Amount predicate against whichever mirror we have; both store the same
    // requested multiset.
    let (requested, collateral_return) = if let Some(payment) = &payment {
        (
            RequestAmount::pairs_for(
                conn,
                AmountOwner::Payment(&payment.id),
                AmountKind::Requested,
            )?,
            payment.collateral_return_lovelace,
        )
    } else if let Some(purchase) = &purchase {
        (
            RequestAmount::pairs_for(
                conn,
                AmountOwner::Purchase(&purchase.id),
                AmountKind::Requested,
            )?,
            purchase.collateral_return_lovelace,
        )
    } else {
        unreachable!()
    };
    let amount_ok = match obs.new_output {
        Some(output) => amounts_cover(&requested, collateral_return, output.lovelace(), |unit| {
            output.quantity_of(unit)
        }),
        None => false,
    };

    let new_state = state_after_redeemer(obs.redeemer, obs.new_datum, amount_ok);
    info!(
        "Applying transition {} -> {} for identifier {} (tx {})",
        obs.redeemer.as_str(),
        new_state.as_str(),
        identifier,
        obs.tx_hash
    );

    if let Some(payment) = payment {
        let current_action = payment.action()?;
        let outcome = next_payment_action(current_action, new_state);
        let new_current = rotate_current_transaction(
            conn,
            payment.current_transaction_id.as_deref(),
            HistoryOwner::Payment(&payment.id),
            obs.tx_hash,
        )?;
        PaymentRequest::set_current_transaction(conn, &payment.id, Some(&new_current))?;
        PaymentRequest::set_on_chain_state(conn, &payment.id, new_state)?;
        if let Some(datum) = obs.new_datum {
            if !datum.result_hash.is_empty() && datum.result_hash != payment.result_hash {
                PaymentRequest::set_result_hash(conn, &payment.id, &datum.result_hash)?;
            }
        }
        let note = outcome.error_note.as_deref().map(|new_note| {
            chain_error_note(payment.error_note.as_deref(), &payment.requested_action, new_note)
        });
        PaymentRequest::set_action(
            conn,
            &payment.id,
            outcome.action,
            outcome.error_type.map(|t| t.as_str()),
            note.as_deref(),
        )?;
        if new_state == OnChainState::DisputedWithdrawn {
            RequestAmount::insert_all(
                conn,
                AmountOwner::Payment(&payment.id),
                AmountKind::WithdrawnSeller,
                &obs.withdrawn_for_seller,
            )?;
            RequestAmount::insert_all(
                conn,
                AmountOwner::Payment(&payment.id),
                AmountKind::WithdrawnBuyer,
                &obs.withdrawn_for_buyer,
            )?;
        }
    }

    if let Some(purchase) = purchase {
        let current_action = purchase.action()?;
        let outcome = next_purchasing_action(current_action, new_state);
        let new_current = rotate_current_transaction(
            conn,
            purchase.current_transaction_id.as_deref(),
            HistoryOwner::Purchase(&purchase.id),
            obs.tx_hash,
        )?;
        PurchaseRequest::set_current_transaction(conn, &purchase.id, Some(&new_current))?;
        PurchaseRequest::set_on_chain_state(conn, &purchase.id, new_state)?;
        if let Some(datum) = obs.new_datum {
            if !datum.result_hash.is_empty() && datum.result_hash != purchase.result_hash {
                PurchaseRequest::set_result_hash(conn, &purchase.id, &datum.result_hash)?;
            }
        }
        let note = outcome.error_note.as_deref().map(|new_note| {
            chain_error_note(
                purchase.error_note.as_deref(),
                &purchase.requested_action,
                new_note,
            )
        });
        PurchaseRequest::set_action(
            conn,
            &purchase.id,
            outcome.action,
            outcome.error_type.map(|t| t.as_str()),
            note.as_deref(),
        )?;
        if new_state == OnChainState::DisputedWithdrawn {
            RequestAmount::insert_all(
                conn,
                AmountOwner::Purchase(&purchase.id),
                AmountKind::WithdrawnSeller,
                &obs.withdrawn_for_seller,
            )?;
            RequestAmount::insert_all(
                conn,
                AmountOwner::Purchase(&purchase.id),
                AmountKind::WithdrawnBuyer,
                &obs.withdrawn_for_buyer,
            )?;
        }
    }

    Ok(())
}

/// Per-address net value movement of a transaction: outputs to the address
/// minus inputs from it, per unit. Negative entries are dropped.
pub fn net_value_for_address(
    inputs: &[TxUtxo],
    outputs: &[TxUtxo],
    address: &str,
) -> Vec<(String, i64)> {
    use std::collections::BTreeMap;
    let mut net: BTreeMap<String, i64> = BTreeMap::new();
    for output in outputs.iter().filter(|utxo| utxo.address == address) {
        for amount in &output.amounts {
            *net.entry(amount.unit.clone()).or_insert(0) += amount.quantity as i64;
        }
    }
    for input in inputs.iter().filter(|utxo| utxo.address == address) {
        for amount in &input.amounts {
            *net.entry(amount.unit.clone()).or_insert(0) -= amount.quantity as i64;
        }
    }
    net.into_iter().filter(|(_, amount)| *amount > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxAmount;

    fn utxo(address: &str, lovelace: u64) -> TxUtxo {
        TxUtxo {
            tx_hash: "00".repeat(32),
            output_index: 0,
            address: address.to_string(),
            amounts: vec![TxAmount {
                unit: "lovelace".into(),
                quantity: lovelace,
            }],
            inline_datum: None,
            reference_script_hash: None,
            collateral: false,
        }
    }

    #[test]
    fn test_block_time_at_pay_by_time_boundary() {
        use masumi_codec::{Address, Network, SmartContractState};
        let datum = EscrowDatum {
            buyer_vkey: [1; 28],
            buyer_address: Address::from_key_hash([1; 28], None),
            seller_vkey: [2; 28],
            seller_address: Address::from_key_hash([2; 28], None),
            blockchain_identifier: "id".into(),
            result_hash: String::new(),
            result_time: 2_000,
            unlock_time: 3_000,
            external_dispute_unlock_time: 4_000,
            pay_by_time: 1_000,
            buyer_cooldown_time: 0,
            seller_cooldown_time: 0,
            state: SmartContractState::FundsLocked,
            input_hash: "aa".repeat(32),
            collateral_return_lovelace: 0,
        };
        let output = utxo(
            &Address::from_key_hash([9; 28], None).to_bech32(Network::Preprod),
            2_000_000,
        );
        let buyer = datum.buyer_address.to_bech32(Network::Preprod);
        let stored = StoredTerms {
            pay_by_time: 1_000,
            submit_result_time: 2_000,
            unlock_time: 3_000,
            external_dispute_unlock_time: 4_000,
            collateral_return_lovelace: 0,
        };
        let inputs = vec![buyer.clone()];

        // Exactly at the pay-by time: valid.
        let at_boundary = ObservedInitial {
            source_id: "s",
            network: Network::Preprod,
            tx_hash: "t",
            block_time_ms: 1_000,
            datum: &datum,
            output: &output,
            input_addresses: &inputs,
        };
        assert!(validate_initial_terms(&at_boundary, &stored).is_empty());

        // One millisecond later: timed out.
        let late = ObservedInitial {
            block_time_ms: 1_001,
            ..at_boundary
        };
        let violations = validate_initial_terms(&late, &stored);
        assert_eq!(
            violations,
            vec!["Transaction was submitted after the pay by time.".to_string()]
        );
    }

    #[test]
    fn test_net_value_diff() {
        let inputs = vec![utxo("addr_seller", 1_000_000), utxo("addr_script", 10_000_000)];
        let outputs = vec![utxo("addr_seller", 7_500_000), utxo("addr_buyer", 3_000_000)];
        let seller = net_value_for_address(&inputs, &outputs, "addr_seller");
        assert_eq!(seller, vec![("lovelace".to_string(), 6_500_000)]);
        let buyer = net_value_for_address(&inputs, &outputs, "addr_buyer");
        assert_eq!(buyer, vec![("lovelace".to_string(), 3_000_000)]);
        // net-negative parties report nothing
        let script = net_value_for_address(&inputs, &outputs, "addr_script");
        assert!(script.is_empty());
    }
}
