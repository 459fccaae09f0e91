//! Rollback scenarios: the cursor vanishes from chain history and every
//! entity referencing a rolled-back transaction is parked for an operator.

use std::sync::Arc;

use server::db::run_serializable;
use server::models::payment_request::PaymentRequest;
use server::models::purchase_request::PurchaseRequest;
use server::models::source_identifier::SourceIdentifier;
use server::models::state::{PaymentAction, PurchasingAction};
use server::services::sync::ROLLBACK_NOTE;
use server::services::wallet_locker;

use crate::fixtures::{buyer_address, locked_datum, script_address, sync_service, Fixture, HOUR_MS, T0_MS};
use crate::mock_infrastructure::{lovelace, utxo, MockChain, MockTx};

const IDENTIFIER: &str = "cdcdcdcdcdcdcdcdcdcd0123456789abcdef0123";

fn lock_tx() -> MockTx {
    let tx_hash = "d1".repeat(32);
    let mut escrow_out = utxo(&tx_hash, 0, &script_address(), lovelace(2_000_000));
    escrow_out.inline_datum = Some(hex::encode(locked_datum(IDENTIFIER).encode()));
    MockTx {
        tx_hash,
        block_time: (T0_MS + HOUR_MS) / 1000,
        confirmations: 5,
        inputs: vec![utxo(&"d0".repeat(32), 0, &buyer_address(), lovelace(10_000_000))],
        outputs: vec![escrow_out],
        redeemers: vec![],
    }
}

#[tokio::test]
async fn test_rollback_parks_entities_and_rewinds_cursor() {
    let mut fixture = Fixture::new();
    let (purchase, payment) = fixture.seed_mirrors(IDENTIFIER);

    // Dispatcher initiated the lock...
    let placeholder = wallet_locker::acquire(&fixture.pool, &fixture.purchasing_wallet.id)
        .await
        .unwrap()
        .unwrap();
    let purchase_id = purchase.id.clone();
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

    // ...the chain confirmed it...
    let chain = Arc::new(MockChain::new());
    chain.push(lock_tx());
    let sync = sync_service(&fixture, chain.clone());
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();
    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some("d1".repeat(32).as_str())
    );

    // ...and then a reorganization removed it.
    chain.remove(&"d1".repeat(32));
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    let mut conn = fixture.pool.get().unwrap();
    let payment_row = PaymentRequest::find_by_id(&mut conn, &payment.id).unwrap();
    assert_eq!(
        payment_row.action().unwrap(),
        PaymentAction::WaitingForManualAction
    );
    assert!(payment_row.error_note.unwrap().contains(ROLLBACK_NOTE));

    let purchase_row = PurchaseRequest::find_by_id(&mut conn, &purchase.id).unwrap();
    assert_eq!(
        purchase_row.action().unwrap(),
        PurchasingAction::WaitingForManualAction
    );

    // Cursor rewound to the fork point (nothing left on chain).
    assert_eq!(fixture.source.last_identifier_checked, None);
    let trail = SourceIdentifier::newest_first(&mut conn, &fixture.source.id).unwrap();
    assert!(trail.is_empty());
}

#[tokio::test]
async fn test_rollback_to_fork_point_keeps_older_history() {
    let mut fixture = Fixture::new();
    let (purchase, _payment) = fixture.seed_mirrors(IDENTIFIER);
    let placeholder = wallet_locker::acquire(&fixture.pool, &fixture.purchasing_wallet.id)
        .await
        .unwrap()
        .unwrap();
    let purchase_id = purchase.id.clone();
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

    // Two unrelated-but-indexed txs followed by the lock tx.
    let chain = Arc::new(MockChain::new());
    let keeper_hash = "e1".repeat(32);
    chain.push(MockTx {
        tx_hash: keeper_hash.clone(),
        block_time: (T0_MS) / 1000,
        confirmations: 9,
        inputs: vec![utxo(&"e0".repeat(32), 0, &buyer_address(), lovelace(1_000_000))],
        outputs: vec![utxo(&keeper_hash, 0, &script_address(), lovelace(1_000_000))],
        redeemers: vec![],
    });
    chain.push(lock_tx());
    let sync = sync_service(&fixture, chain.clone());
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    // Only the newest tx rolls back; the keeper stays canonical.
    chain.remove(&"d1".repeat(32));
    sync.sync_source(&fixture.source).await.unwrap();
    fixture.reload_source();

    assert_eq!(
        fixture.source.last_identifier_checked.as_deref(),
        Some(keeper_hash.as_str())
    );
    let mut conn = fixture.pool.get().unwrap();
    let trail = SourceIdentifier::newest_first(&mut conn, &fixture.source.id).unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].tx_hash, keeper_hash);
}
