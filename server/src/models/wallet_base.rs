//! Counterparty wallets: foreign buyers and sellers observed on chain or
//! supplied at purchase creation. Create-or-connect by (vkey, address).

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::wallet_bases;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = wallet_bases)]
pub struct WalletBase {
    pub id: String,
    pub payment_source_id: String,
    pub vkey: String,
    pub address: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = wallet_bases)]
pub struct NewWalletBase {
    pub id: String,
    pub payment_source_id: String,
    pub vkey: String,
    pub address: String,
    pub created_at: NaiveDateTime,
}

impl WalletBase {
    pub fn find_by_id(conn: &mut SqliteConnection, wallet_id: &str) -> Result<Self> {
        wallet_bases::table
            .filter(wallet_bases::id.eq(wallet_id))
            .first(conn)
            .context(format!("Wallet base {wallet_id} not found"))
    }

    /// Look up an existing row for this counterparty or insert one.
    pub fn find_or_create(
        conn: &mut SqliteConnection,
        source_id: &str,
        vkey: &str,
        address: &str,
    ) -> Result<Self> {
        let vkey = vkey.to_lowercase();
        let existing: Option<WalletBase> = wallet_bases::table
            .filter(wallet_bases::payment_source_id.eq(source_id))
            .filter(wallet_bases::vkey.eq(&vkey))
            .filter(wallet_bases::address.eq(address))
            .first(conn)
            .optional()
            .context("Failed to query wallet bases")?;
        if let Some(wallet) = existing {
            return Ok(wallet);
        }
        let new_wallet = NewWalletBase {
            id: uuid::Uuid::new_v4().to_string(),
            payment_source_id: source_id.to_string(),
            vkey,
            address: address.to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        };
        let wallet_id = new_wallet.id.clone();
        diesel::insert_into(wallet_bases::table)
            .values(&new_wallet)
            .execute(conn)
            .context("Failed to insert wallet base")?;
        Self::find_by_id(conn, &wallet_id)
    }
}
