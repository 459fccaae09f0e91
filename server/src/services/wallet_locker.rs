//! Wallet locking: at most one in-flight transaction per hot wallet.
//!
//! The lock is two facts that must agree: `hot_wallets.locked_at` and the
//! existence of a Pending transaction blocking the wallet. Acquisition checks
//! both and creates the placeholder transaction in one serializable step;
//! release happens inside `Transaction::settle`. Stale locks (crashed
//! dispatcher) are reclaimable after a timeout.

use anyhow::{Context, Result};
use diesel::prelude::*;
use tracing::{info, warn};

use crate::db::{run_serializable, DbPool};
use crate::models::state::TxStatus;
use crate::models::transaction::{NewTransaction, Transaction};
use crate::schema::{hot_wallets, transactions};

/// Locks older than this are considered abandoned (ms).
pub const LOCK_TIMEOUT_MS: i64 = 10 * 60 * 1000;

/// Try to take the wallet lock and create the Pending placeholder
/// transaction. Returns `None` when another dispatcher holds the wallet.
///
/// Must run inside a serializable transaction; `try_lock_wallet_blocking` is
/// the raw building block, `acquire` the pool-level wrapper.
pub fn try_lock_wallet_blocking(
    conn: &mut SqliteConnection,
    wallet_id: &str,
    now_ms: i64,
) -> Result<Option<Transaction>> {
    let locked_at: Option<i64> = hot_wallets::table
        .filter(hot_wallets::id.eq(wallet_id))
        .select(hot_wallets::locked_at)
        .first(conn)
        .context(format!("Hot wallet {wallet_id} not found"))?;

    if let Some(locked_at) = locked_at {
        if now_ms - locked_at <= LOCK_TIMEOUT_MS {
            return Ok(None);
        }
        warn!(
            "Reclaiming stale lock on wallet {} (held {} ms)",
            wallet_id,
            now_ms - locked_at
        );
        // A stale timestamp with a live pending tx still blocks the wallet.
    }

    let pending: i64 = transactions::table
        .filter(transactions::blocks_wallet_id.eq(wallet_id))
        .filter(transactions::status.eq(TxStatus::Pending.as_str()))
        .count()
        .get_result(conn)
        .context("Failed to count pending transactions")?;
    if pending > 0 {
        return Ok(None);
    }

    diesel::update(hot_wallets::table.filter(hot_wallets::id.eq(wallet_id)))
        .set((
            hot_wallets::locked_at.eq(now_ms),
            hot_wallets::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context(format!("Failed to set lock on wallet {wallet_id}"))?;

    let placeholder = Transaction::create(conn, NewTransaction::pending(Some(wallet_id)))?;
    info!(
        "Locked wallet {} with placeholder transaction {}",
        wallet_id, placeholder.id
    );
    Ok(Some(placeholder))
}

/// Pool-level acquisition under serializable isolation.
pub async fn acquire(pool: &DbPool, wallet_id: &str) -> Result<Option<Transaction>> {
    let wallet_id = wallet_id.to_string();
    let now_ms = chrono::Utc::now().timestamp_millis();
    run_serializable(pool, move |conn| {
        try_lock_wallet_blocking(conn, &wallet_id, now_ms)
    })
    .await
}

/// Release a lock by settling its placeholder transaction. Used by the
/// failure paths of dispatchers; the success path settles through the sync
/// loop when the transaction confirms.
pub async fn release_failed(pool: &DbPool, transaction_id: &str) -> Result<()> {
    let transaction_id = transaction_id.to_string();
    run_serializable(pool, move |conn| {
        Transaction::settle(conn, &transaction_id, TxStatus::RolledBack)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap::initialize_schema;
    use crate::models::hot_wallet::{HotWallet, NewHotWallet};
    use crate::models::payment_source::{NewPaymentSource, PaymentSource};
    use crate::models::state::WalletRole;
    use masumi_codec::Network;

    fn setup() -> (SqliteConnection, String) {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        initialize_schema(&mut conn).unwrap();
        let admins: Vec<String> = vec!["addr_test1a".into(), "addr_test1b".into()];
        let source = PaymentSource::create(
            &mut conn,
            NewPaymentSource::new(Network::Preprod, "addr_test1s", "aa", "", 50, &admins, "key")
                .unwrap(),
        )
        .unwrap();
        let wallet = HotWallet::create(
            &mut conn,
            NewHotWallet::new(&source.id, WalletRole::Selling, &"ab".repeat(28), "addr_test1w", vec![0u8; 32]),
        )
        .unwrap();
        (conn, wallet.id)
    }

    #[test]
    fn test_lock_acquisition_is_exclusive() {
        let (mut conn, wallet_id) = setup();
        let now = 1_000_000i64;
        let first = try_lock_wallet_blocking(&mut conn, &wallet_id, now).unwrap();
        assert!(first.is_some());
        let second = try_lock_wallet_blocking(&mut conn, &wallet_id, now + 1).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_settle_releases_lock() {
        let (mut conn, wallet_id) = setup();
        let now = 1_000_000i64;
        let placeholder = try_lock_wallet_blocking(&mut conn, &wallet_id, now)
            .unwrap()
            .unwrap();
        Transaction::settle(&mut conn, &placeholder.id, TxStatus::Confirmed).unwrap();

        let wallet = HotWallet::find_by_id(&mut conn, &wallet_id).unwrap();
        assert!(wallet.locked_at.is_none());
        let again = try_lock_wallet_blocking(&mut conn, &wallet_id, now + 2).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_stale_lock_without_pending_tx_is_reclaimable() {
        let (mut conn, wallet_id) = setup();
        let now = 1_000_000i64;
        let placeholder = try_lock_wallet_blocking(&mut conn, &wallet_id, now)
            .unwrap()
            .unwrap();
        // Settle the pending tx but leave locked_at set, simulating a crash
        // between settle and lock clear is impossible (same txn), so instead
        // simulate a dispatcher that died before creating state: clear the
        // pending tx directly.
        diesel::update(transactions::table.filter(transactions::id.eq(&placeholder.id)))
            .set(transactions::status.eq(TxStatus::RolledBack.as_str()))
            .execute(&mut conn)
            .unwrap();

        // Within the timeout the lock still holds.
        let denied =
            try_lock_wallet_blocking(&mut conn, &wallet_id, now + LOCK_TIMEOUT_MS).unwrap();
        assert!(denied.is_none());
        // Past the timeout it is reclaimable.
        let reclaimed =
            try_lock_wallet_blocking(&mut conn, &wallet_id, now + LOCK_TIMEOUT_MS + 1).unwrap();
        assert!(reclaimed.is_some());
    }

    #[test]
    fn test_pending_tx_blocks_even_with_stale_timestamp() {
        let (mut conn, wallet_id) = setup();
        let now = 1_000_000i64;
        try_lock_wallet_blocking(&mut conn, &wallet_id, now)
            .unwrap()
            .unwrap();
        // Stale timestamp but the pending placeholder still exists.
        let denied =
            try_lock_wallet_blocking(&mut conn, &wallet_id, now + LOCK_TIMEOUT_MS + 1).unwrap();
        assert!(denied.is_none());
    }
}
