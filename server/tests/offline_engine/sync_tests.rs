//! Sync-loop scenarios: initial lock, spoofing, the happy path and
//! confirmation gating.

use std::sync::Arc;

use server::db::run_serializable;
use server::models::payment_request::PaymentRequest;
use server::models::purchase_request::PurchaseRequest;
use server::models::source_identifier::SourceIdentifier;
use server::models::payment_source::PaymentSource;
use server::models::hot_wallet::HotWallet;
use server::models::state::{OnChainState, PaymentAction, PurchasingAction};
use server::services::wallet_locker;

use masumi_codec::{Redeemer, SmartContractState};

use crate::fixtures::{
    buyer_address, locked_datum, script_address, sync_service, Fixture, HOUR_MS, T0_MS,
};
use crate::mock_infrastructure::{lovelace, spend_redeemer, utxo, MockChain, MockTx};

const IDENTIFIER_SUFFIX: &str = "0123456789abcdef0123";

fn identifier() -> String {
    format!("{}{}", "ab".repeat(10), IDENTIFIER_SUFFIX)
}

/// The lock transaction: buyer input, escrow output with inline datum.
fn lock_tx(datum: &masumi_codec::EscrowDatum) -> MockTx {
    let tx_hash = "a1".repeat(32);
    let mut escrow_out = utxo(&tx_hash, 0, &script_address(), lovelace(2_000_000));
    escrow_out.inline_datum = Some(hex::encode(datum.encode()));
    MockTx {
        tx_hash: tx_hash.clone(),
        block_time: (T0_MS + HOUR_MS) / 1000,
        confirmations: 5,
        inputs: vec![utxo(&"b0".repeat(32), 0, &buyer_address(), lovelace(10_000_000))],
        outputs: vec![
            escrow_out,
            utxo(&tx_hash, 1, &buyer_address(), lovelace(7_800_000)),
        ],
        redeemers: vec![],
    }
}

/// Put the purchase into FundsLockingInitiated with a wallet-locked
/// placeholder, as the lock-funds dispatcher would.
async fn initiate_purchase(fixture: &Fixture, purchase_id: &str) -> String {
    let placeholder = wallet_locker::acquire(&fixture.pool, &fixture.purchasing_wallet.id)
        .await
        .unwrap()
        .expect("wallet lock available");
    let purchase_id = purchase_id.to_string();
    let placeholder_id = placeholder.id.clone();
    run_serializable(&fixture.pool, move |conn| {
        PurchaseRequest::set_current_transaction(conn, &purchase_id, Some(&placeholder_id))?;
        PurchaseRequest::set_action(
            conn,
            &purchase_id,
            PurchasingAction::FundsLockingInitiated,
            None,
            None,
        )
    })
    .await
    .unwrap();
    placeholder.id
}

#[tokio::test]
async fn test_initial_lock_settles_both_mirrors() {
    let mut fixture = Fixture::new();
    let (purchase, payment) = fixture.seed_mirrors(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx(&locked_datum(&identifier())));
    let sync = sync_service(&fixture, chain.clone());

    sync.sync_source(&fixture.source).await.unwrap();

    let mut conn = fixture.pool.get().unwrap();
    let purchase = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(purchase.on_chain_state.as_deref(), Some("FundsLocked"));
    assert_eq!(
        purchase.action().unwrap(),
        PurchasingAction::WaitingForExternalAction
    );

    let payment = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
    assert_eq!(payment.on_chain_state.as_deref(), Some("FundsLocked"));
    assert_eq!(
        payment.action().unwrap(),
        PaymentAction::WaitingForExternalAction
    );
    assert!(payment.buyer_wallet_id.is_some(), "buyer wallet attached");

    // Wallet lock released when the placeholder confirmed.
    let wallet = HotWallet::find_by_id(&mut conn, &fixture.purchasing_wallet.id).unwrap();
    assert!(wallet.locked_at.is_none());

    // Cursor advanced to the lock tx, trail has one entry.
    fixture.reload_source();
    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some("a1".repeat(32).as_str())
    );
    let trail = SourceIdentifier::newest_first(&mut conn, &fixture.source.id).unwrap();
    assert_eq!(trail.len(), 1);
}

#[tokio::test]
async fn test_spoofed_unlock_time_flags_payment_only() {
    let mut fixture = Fixture::new();
    let (purchase, payment) = fixture.seed_mirrors(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    // Datum with an unlock time earlier than agreed.
    let mut datum = locked_datum(&identifier());
    datum.unlock_time = (T0_MS + 2 * HOUR_MS) as u64;

    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx(&datum));
    let sync = sync_service(&fixture, chain);

    sync.sync_source(&fixture.source).await.unwrap();

    let mut conn = fixture.pool.get().unwrap();
    // Seller mirror records the violation for an operator.
    let payment = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
    assert_eq!(
        payment.on_chain_state.as_deref(),
        Some("FundsOrDatumInvalid")
    );
    assert_eq!(
        payment.action().unwrap(),
        PaymentAction::WaitingForManualAction
    );
    assert!(payment
        .error_note
        .unwrap()
        .contains("Unlock time is before the agreed upon time."));

    // Buyer mirror silently ignores the spoof.
    let purchase = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(purchase.on_chain_state, None);
    assert_eq!(
        purchase.action().unwrap(),
        PurchasingAction::FundsLockingInitiated
    );

    // Cursor still advances past the invalid transaction.
    fixture.reload_source();
    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some("a1".repeat(32).as_str())
    );
}

/// Result submission spending the lock output, continuing the escrow.
fn submit_result_tx(datum_after: &masumi_codec::EscrowDatum) -> MockTx {
    let tx_hash = "a2".repeat(32);
    let mut consumed = utxo(&"a1".repeat(32), 0, &script_address(), lovelace(2_000_000));
    consumed.inline_datum = Some(hex::encode(locked_datum(&identifier()).encode()));
    MockTx {
        tx_hash,
        block_time: (T0_MS + 13 * HOUR_MS) / 1000,
        confirmations: 5,
        inputs: vec![
            consumed,
            utxo(&"c0".repeat(32), 0, &crate::fixtures::seller_address(), lovelace(5_000_000)),
        ],
        outputs: vec![],
        redeemers: vec![spend_redeemer(Redeemer::SubmitResult)],
    }
    .with_continued(datum_after)
}

impl MockTx {
    fn with_continued(mut self, datum: &masumi_codec::EscrowDatum) -> MockTx {
        let mut continued = utxo(&self.tx_hash.clone(), 0, &script_address(), lovelace(2_000_000));
        continued.inline_datum = Some(hex::encode(datum.encode()));
        self.outputs.insert(0, continued);
        self
    }
}

#[tokio::test]
async fn test_happy_path_lock_submit_withdraw() {
    let mut fixture = Fixture::new();
    let (purchase, payment) = fixture.seed_mirrors(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx(&locked_datum(&identifier())));
    let sync = sync_service(&fixture, chain.clone());
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    // Seller submits the result.
    let mut datum_result = locked_datum(&identifier());
    datum_result.result_hash = "ff00".repeat(16);
    datum_result.state = SmartContractState::ResultSubmitted;
    chain.push(submit_result_tx(&datum_result));
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    {
        let mut conn = fixture.pool.get().unwrap();
        let payment_row = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
        assert_eq!(payment_row.on_chain_state.as_deref(), Some("ResultSubmitted"));
        assert_eq!(payment_row.action().unwrap(), PaymentAction::WithdrawRequested);
        assert_eq!(payment_row.result_hash, "ff00".repeat(16));

        let purchase_row = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
        assert_eq!(purchase_row.on_chain_state.as_deref(), Some("ResultSubmitted"));
        assert_eq!(
            purchase_row.action().unwrap(),
            PurchasingAction::WaitingForExternalAction
        );
    }

    // Seller withdraws after the unlock time: spends the escrow, no
    // continuing output.
    let withdraw_hash = "a3".repeat(32);
    let mut consumed = utxo(&"a2".repeat(32), 0, &script_address(), lovelace(2_000_000));
    consumed.inline_datum = Some(hex::encode(datum_result.encode()));
    chain.push(MockTx {
        tx_hash: withdraw_hash.clone(),
        block_time: (T0_MS + 19 * HOUR_MS) / 1000,
        confirmations: 5,
        inputs: vec![
            consumed,
            utxo(&"c1".repeat(32), 0, &crate::fixtures::seller_address(), lovelace(5_000_000)),
        ],
        outputs: vec![utxo(
            &withdraw_hash,
            0,
            &crate::fixtures::seller_address(),
            lovelace(6_800_000),
        )],
        redeemers: vec![spend_redeemer(Redeemer::Withdraw)],
    });
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    let mut conn = fixture.pool.get().unwrap();
    let payment_row = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
    assert_eq!(payment_row.on_chain_state.as_deref(), Some("Withdrawn"));
    assert_eq!(payment_row.action().unwrap(), PaymentAction::None);

    let purchase_row = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(purchase_row.on_chain_state.as_deref(), Some("Withdrawn"));
    assert_eq!(purchase_row.action().unwrap(), PurchasingAction::None);

    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some(withdraw_hash.as_str())
    );
    let trail = SourceIdentifier::newest_first(&mut conn, &fixture.source.id).unwrap();
    assert_eq!(trail.len(), 3);
}

#[tokio::test]
async fn test_foreign_lineage_spend_of_spoofed_escrow_not_applied() {
    let mut fixture = Fixture::new();
    let purchase = fixture.seed_purchase_only(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    // A third party opens a spoofed escrow with an altered unlock time; the
    // buyer mirror silently ignores it, recording nothing.
    let mut spoofed = locked_datum(&identifier());
    spoofed.unlock_time = (T0_MS + 2 * HOUR_MS) as u64;
    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx(&spoofed));
    let sync = sync_service(&fixture, chain.clone());
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    // The attacker then spends the still-on-chain spoofed UTXO. With no
    // tracked history for the identifier, the spend has no legitimate
    // anchor and must not move the entity.
    let spend_hash = "f2".repeat(32);
    let mut consumed = utxo(&"a1".repeat(32), 0, &script_address(), lovelace(2_000_000));
    consumed.inline_datum = Some(hex::encode(spoofed.encode()));
    chain.push(MockTx {
        tx_hash: spend_hash.clone(),
        block_time: (T0_MS + 3 * HOUR_MS) / 1000,
        confirmations: 5,
        inputs: vec![
            consumed,
            utxo(&"f0".repeat(32), 0, &buyer_address(), lovelace(5_000_000)),
        ],
        outputs: vec![utxo(&spend_hash, 0, &buyer_address(), lovelace(6_800_000))],
        redeemers: vec![spend_redeemer(Redeemer::Withdraw)],
    });
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    let mut conn = fixture.pool.get().unwrap();
    let purchase = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(purchase.on_chain_state, None);
    assert_eq!(
        purchase.action().unwrap(),
        PurchasingAction::FundsLockingInitiated
    );
    assert!(purchase.error_note.is_none());

    // The foreign spend still advances the cursor.
    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some(spend_hash.as_str())
    );
}

#[tokio::test]
async fn test_unconfirmed_tx_gates_forward_progress() {
    let mut fixture = Fixture::new();
    let (purchase, _payment) = fixture.seed_mirrors(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    let mut tx = lock_tx(&locked_datum(&identifier()));
    tx.confirmations = 0; // below the threshold of 1
    let chain = Arc::new(MockChain::new());
    chain.push(tx);
    let sync = sync_service(&fixture, chain);

    sync.sync_source(&fixture.source).await.unwrap();

    let mut conn = fixture.pool.get().unwrap();
    let purchase = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(purchase.on_chain_state, None, "tx must not be applied yet");
    fixture.reload_source();
    assert_eq!(fixture.source.last_identifier_checked, None);
}

#[tokio::test]
async fn test_replay_after_cursor_reset_is_idempotent() {
    let mut fixture = Fixture::new();
    let (purchase, payment) = fixture.seed_mirrors(&identifier());
    initiate_purchase(&fixture, &purchase.id).await;

    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx(&locked_datum(&identifier())));
    let sync = sync_service(&fixture, chain.clone());
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    let mut datum_result = locked_datum(&identifier());
    datum_result.result_hash = "ff00".repeat(16);
    datum_result.state = SmartContractState::ResultSubmitted;
    chain.push(submit_result_tx(&datum_result));
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    let snapshot = {
        let mut conn = fixture.pool.get().unwrap();
        let payment_row = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
        let purchase_row = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
        (
            payment_row.on_chain_state,
            payment_row.requested_action,
            purchase_row.on_chain_state,
            purchase_row.requested_action,
        )
    };

    // Reset the cursor to the prior value and replay the last transaction.
    let source_id = fixture.source.id.clone();
    run_serializable(&fixture.pool, move |conn| {
        PaymentSource::rewind_cursor(conn, &source_id, Some(&"a1".repeat(32)))
    })
    .await
    .unwrap();
    fixture.reload_source();
    sync.sync_source(&fixture.source).await.unwrap();

    let mut conn = fixture.pool.get().unwrap();
    let payment_row = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
    let purchase_row = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(
        (
            payment_row.on_chain_state,
            payment_row.requested_action,
            purchase_row.on_chain_state,
            purchase_row.requested_action,
        ),
        snapshot
    );
}
