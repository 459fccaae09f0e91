//! HotWallet model: coordinator-controlled wallets, one lock each.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::WalletRole;
use crate::schema::hot_wallets;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = hot_wallets)]
pub struct HotWallet {
    pub id: String,
    pub payment_source_id: String,
    pub role: String,
    pub vkey: String,
    pub address: String,
    pub collection_address: Option<String>,
    /// Opaque blob; the engine never decrypts it, the signer seam does.
    #[serde(skip_serializing)]
    pub encrypted_mnemonic: Vec<u8>,
    /// Epoch-ms when a dispatcher took the wallet, NULL when free.
    pub locked_at: Option<i64>,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = hot_wallets)]
pub struct NewHotWallet {
    pub id: String,
    pub payment_source_id: String,
    pub role: String,
    pub vkey: String,
    pub address: String,
    pub collection_address: Option<String>,
    pub encrypted_mnemonic: Vec<u8>,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewHotWallet {
    pub fn new(
        payment_source_id: &str,
        role: WalletRole,
        vkey: &str,
        address: &str,
        encrypted_mnemonic: Vec<u8>,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payment_source_id: payment_source_id.to_string(),
            role: role.as_str().to_string(),
            vkey: vkey.to_lowercase(),
            address: address.to_string(),
            collection_address: None,
            encrypted_mnemonic,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl HotWallet {
    pub fn create(conn: &mut SqliteConnection, new_wallet: NewHotWallet) -> Result<Self> {
        let wallet_id = new_wallet.id.clone();
        diesel::insert_into(hot_wallets::table)
            .values(&new_wallet)
            .execute(conn)
            .context("Failed to insert hot wallet")?;
        Self::find_by_id(conn, &wallet_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, wallet_id: &str) -> Result<Self> {
        hot_wallets::table
            .filter(hot_wallets::id.eq(wallet_id))
            .first(conn)
            .context(format!("Hot wallet {wallet_id} not found"))
    }

    pub fn find_by_source_and_role(
        conn: &mut SqliteConnection,
        source_id: &str,
        role: WalletRole,
    ) -> Result<Vec<Self>> {
        hot_wallets::table
            .filter(hot_wallets::payment_source_id.eq(source_id))
            .filter(hot_wallets::role.eq(role.as_str()))
            .load(conn)
            .context(format!(
                "Failed to load {} wallets for source {source_id}",
                role.as_str()
            ))
    }

    pub fn find_by_source_and_vkey(
        conn: &mut SqliteConnection,
        source_id: &str,
        vkey: &str,
    ) -> Result<Self> {
        hot_wallets::table
            .filter(hot_wallets::payment_source_id.eq(source_id))
            .filter(hot_wallets::vkey.eq(vkey))
            .first(conn)
            .context(format!("No hot wallet with vkey {vkey} under source {source_id}"))
    }

    pub fn role(&self) -> Result<WalletRole> {
        WalletRole::parse(&self.role)
            .with_context(|| format!("hot wallet {} has unknown role {}", self.id, self.role))
    }

    /// Clear the lock timestamp. The caller is responsible for doing this in
    /// the same transaction that settles the blocking Transaction row.
    pub fn clear_lock(conn: &mut SqliteConnection, wallet_id: &str) -> Result<()> {
        diesel::update(hot_wallets::table.filter(hot_wallets::id.eq(wallet_id)))
            .set((
                hot_wallets::locked_at.eq(None::<i64>),
                hot_wallets::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to clear lock on wallet {wallet_id}"))?;
        Ok(())
    }
}
