//! Wallet-lock races: two dispatchers (or coordinator instances) fighting
//! over the same hot wallet must yield exactly one in-flight transaction.

use server::models::hot_wallet::HotWallet;
use server::models::state::TxStatus;
use server::models::transaction::Transaction;
use server::db::run_serializable;
use server::services::wallet_locker;

use crate::fixtures::Fixture;

#[tokio::test]
async fn test_concurrent_acquisition_yields_one_winner() {
    let fixture = Fixture::new();
    let wallet_id = fixture.purchasing_wallet.id.clone();

    let first = wallet_locker::acquire(&fixture.pool, &wallet_id);
    let second = wallet_locker::acquire(&fixture.pool, &wallet_id);
    let (first, second) = tokio::join!(first, second);

    let winners = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(winners, 1, "exactly one acquisition may succeed");
}

#[tokio::test]
async fn test_lock_reacquired_after_settlement() {
    let fixture = Fixture::new();
    let wallet_id = fixture.purchasing_wallet.id.clone();

    let placeholder = wallet_locker::acquire(&fixture.pool, &wallet_id)
        .await
        .unwrap()
        .expect("first acquisition succeeds");
    assert!(wallet_locker::acquire(&fixture.pool, &wallet_id)
        .await
        .unwrap()
        .is_none());

    let placeholder_id = placeholder.id.clone();
    run_serializable(&fixture.pool, move |conn| {
        Transaction::settle(conn, &placeholder_id, TxStatus::Confirmed)
    })
    .await
    .unwrap();

    let mut conn = fixture.pool.get().unwrap();
    let wallet = HotWallet::find_by_id(&mut conn, &wallet_id).unwrap();
    assert!(wallet.locked_at.is_none());
    drop(conn);

    assert!(wallet_locker::acquire(&fixture.pool, &wallet_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_release_failed_restores_wallet() {
    let fixture = Fixture::new();
    let wallet_id = fixture.selling_wallet.id.clone();

    let placeholder = wallet_locker::acquire(&fixture.pool, &wallet_id)
        .await
        .unwrap()
        .unwrap();
    wallet_locker::release_failed(&fixture.pool, &placeholder.id)
        .await
        .unwrap();

    let mut conn = fixture.pool.get().unwrap();
    let transaction = Transaction::find_by_id(&mut conn, &placeholder.id).unwrap();
    assert_eq!(transaction.status, "RolledBack");
    let wallet = HotWallet::find_by_id(&mut conn, &wallet_id).unwrap();
    assert!(wallet.locked_at.is_none());
}
