//! Transaction model and the ordered history join table.
//!
//! A Transaction may hold a wallet lock via `blocks_wallet_id`; settling the
//! status (`Pending` -> `Confirmed`/`RolledBack`) and releasing the lock
//! happen in one database transaction so invariant "at most one pending
//! transaction per wallet" can never be observed broken.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::hot_wallet::HotWallet;
use crate::models::state::TxStatus;
use crate::schema::{transaction_histories, transactions};

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = transactions)]
pub struct Transaction {
    pub id: String,
    /// Empty string until submission returns a hash.
    pub tx_hash: String,
    pub status: String,
    pub blocks_wallet_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub id: String,
    pub tx_hash: String,
    pub status: String,
    pub blocks_wallet_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewTransaction {
    /// A placeholder row for a transaction about to be authored. Holds the
    /// wallet lock until the status leaves Pending.
    pub fn pending(blocks_wallet_id: Option<&str>) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx_hash: String::new(),
            status: TxStatus::Pending.as_str().to_string(),
            blocks_wallet_id: blocks_wallet_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    /// A transaction observed on chain, already confirmed.
    pub fn confirmed(tx_hash: &str) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx_hash: tx_hash.to_string(),
            status: TxStatus::Confirmed.as_str().to_string(),
            blocks_wallet_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Transaction {
    pub fn create(conn: &mut SqliteConnection, new_transaction: NewTransaction) -> Result<Self> {
        let transaction_id = new_transaction.id.clone();
        diesel::insert_into(transactions::table)
            .values(&new_transaction)
            .execute(conn)
            .context("Failed to insert transaction")?;
        Self::find_by_id(conn, &transaction_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, transaction_id: &str) -> Result<Self> {
        transactions::table
            .filter(transactions::id.eq(transaction_id))
            .first(conn)
            .context(format!("Transaction {transaction_id} not found"))
    }

    pub fn find_by_tx_hash(conn: &mut SqliteConnection, tx_hash: &str) -> Result<Option<Self>> {
        transactions::table
            .filter(transactions::tx_hash.eq(tx_hash))
            .first(conn)
            .optional()
            .context(format!("Failed to query transaction by hash {tx_hash}"))
    }

    /// Every row carrying this hash. The two mirrors record an observed
    /// chain transaction as separate rows with the same hash.
    pub fn find_all_by_tx_hash(conn: &mut SqliteConnection, tx_hash: &str) -> Result<Vec<Self>> {
        transactions::table
            .filter(transactions::tx_hash.eq(tx_hash))
            .load(conn)
            .context(format!("Failed to query transactions by hash {tx_hash}"))
    }

    pub fn status(&self) -> Result<TxStatus> {
        TxStatus::parse(&self.status)
            .with_context(|| format!("transaction {} has unknown status {}", self.id, self.status))
    }

    /// Record the hash returned by the submit endpoint.
    pub fn set_tx_hash(
        conn: &mut SqliteConnection,
        transaction_id: &str,
        tx_hash: &str,
    ) -> Result<()> {
        diesel::update(transactions::table.filter(transactions::id.eq(transaction_id)))
            .set((
                transactions::tx_hash.eq(tx_hash),
                transactions::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set hash on transaction {transaction_id}"))?;
        Ok(())
    }

    /// True while any Pending transaction blocks the wallet.
    pub fn wallet_has_pending(conn: &mut SqliteConnection, wallet_id: &str) -> Result<bool> {
        let count: i64 = transactions::table
            .filter(transactions::blocks_wallet_id.eq(wallet_id))
            .filter(transactions::status.eq(TxStatus::Pending.as_str()))
            .count()
            .get_result(conn)
            .context("Failed to count pending transactions")?;
        Ok(count > 0)
    }

    /// Settle the status and atomically release the wallet lock, if held.
    pub fn settle(
        conn: &mut SqliteConnection,
        transaction_id: &str,
        status: TxStatus,
    ) -> Result<()> {
        debug_assert!(status != TxStatus::Pending);
        let transaction = Self::find_by_id(conn, transaction_id)?;
        diesel::update(transactions::table.filter(transactions::id.eq(transaction_id)))
            .set((
                transactions::status.eq(status.as_str()),
                transactions::blocks_wallet_id.eq(None::<String>),
                transactions::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to settle transaction {transaction_id}"))?;
        if let Some(wallet_id) = transaction.blocks_wallet_id {
            HotWallet::clear_lock(conn, &wallet_id)?;
        }
        Ok(())
    }
}

/// Ordered back-reference from a settled transaction to the request that
/// authored or observed it.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = transaction_histories)]
pub struct TransactionHistory {
    pub id: String,
    pub transaction_id: String,
    pub payment_request_id: Option<String>,
    pub purchase_request_id: Option<String>,
    pub registry_request_id: Option<String>,
    pub position: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = transaction_histories)]
pub struct NewTransactionHistory {
    pub id: String,
    pub transaction_id: String,
    pub payment_request_id: Option<String>,
    pub purchase_request_id: Option<String>,
    pub registry_request_id: Option<String>,
    pub position: i32,
    pub created_at: NaiveDateTime,
}

/// Which request owns a history entry.
#[derive(Debug, Clone, Copy)]
pub enum HistoryOwner<'a> {
    Payment(&'a str),
    Purchase(&'a str),
    Registry(&'a str),
}

impl TransactionHistory {
    /// Append a transaction to the owner's history, next position.
    pub fn append(
        conn: &mut SqliteConnection,
        owner: HistoryOwner<'_>,
        transaction_id: &str,
    ) -> Result<()> {
        let mut query = transaction_histories::table.into_boxed();
        query = match owner {
            HistoryOwner::Payment(id) => {
                query.filter(transaction_histories::payment_request_id.eq(id.to_string()))
            }
            HistoryOwner::Purchase(id) => {
                query.filter(transaction_histories::purchase_request_id.eq(id.to_string()))
            }
            HistoryOwner::Registry(id) => {
                query.filter(transaction_histories::registry_request_id.eq(id.to_string()))
            }
        };
        let count: i64 = query
            .count()
            .get_result(conn)
            .context("Failed to count history entries")?;

        let entry = NewTransactionHistory {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.to_string(),
            payment_request_id: match owner {
                HistoryOwner::Payment(id) => Some(id.to_string()),
                _ => None,
            },
            purchase_request_id: match owner {
                HistoryOwner::Purchase(id) => Some(id.to_string()),
                _ => None,
            },
            registry_request_id: match owner {
                HistoryOwner::Registry(id) => Some(id.to_string()),
                _ => None,
            },
            position: count as i32,
            created_at: chrono::Utc::now().naive_utc(),
        };
        diesel::insert_into(transaction_histories::table)
            .values(&entry)
            .execute(conn)
            .context("Failed to append transaction history")?;
        Ok(())
    }

    /// Hashes of every transaction in an owner's history, oldest first.
    pub fn hashes_for(conn: &mut SqliteConnection, owner: HistoryOwner<'_>) -> Result<Vec<String>> {
        let mut query = transaction_histories::table
            .inner_join(
                transactions::table.on(transactions::id.eq(transaction_histories::transaction_id)),
            )
            .into_boxed();
        query = match owner {
            HistoryOwner::Payment(id) => {
                query.filter(transaction_histories::payment_request_id.eq(id.to_string()))
            }
            HistoryOwner::Purchase(id) => {
                query.filter(transaction_histories::purchase_request_id.eq(id.to_string()))
            }
            HistoryOwner::Registry(id) => {
                query.filter(transaction_histories::registry_request_id.eq(id.to_string()))
            }
        };
        query
            .order(transaction_histories::position.asc())
            .select(transactions::tx_hash)
            .load(conn)
            .context("Failed to load transaction history hashes")
    }
}
