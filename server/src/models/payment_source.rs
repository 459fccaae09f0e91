//! PaymentSource model: one record per contract deployment.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::payment_sources;
use masumi_codec::Network;

/// Contract deployment record. Column order must match schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = payment_sources)]
pub struct PaymentSource {
    pub id: String,
    pub network: String,
    pub smart_contract_address: String,
    pub policy_id: String,
    /// Hex of the final compiled validator (parameters applied).
    pub compiled_script: String,
    pub fee_rate_permille: i32,
    /// JSON array of bech32 addresses, ordered, 2..=5 entries.
    pub admin_wallet_addresses: String,
    pub rpc_provider_api_key: String,
    /// Tx-hash cursor of the newest chain transaction already applied.
    pub last_identifier_checked: Option<String>,
    pub sync_in_progress: bool,
    pub sync_started_at: Option<i64>,
    pub disabled_at: Option<NaiveDateTime>,
    pub deleted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = payment_sources)]
pub struct NewPaymentSource {
    pub id: String,
    pub network: String,
    pub smart_contract_address: String,
    pub policy_id: String,
    pub compiled_script: String,
    pub fee_rate_permille: i32,
    pub admin_wallet_addresses: String,
    pub rpc_provider_api_key: String,
    pub sync_in_progress: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewPaymentSource {
    pub fn new(
        network: Network,
        smart_contract_address: &str,
        policy_id: &str,
        compiled_script: &str,
        fee_rate_permille: i32,
        admin_wallet_addresses: &[String],
        rpc_provider_api_key: &str,
    ) -> Result<Self> {
        if !(2..=5).contains(&admin_wallet_addresses.len()) {
            anyhow::bail!(
                "payment source requires 2..=5 admin wallet addresses, got {}",
                admin_wallet_addresses.len()
            );
        }
        let now = chrono::Utc::now().naive_utc();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            network: network.as_str().to_string(),
            smart_contract_address: smart_contract_address.to_string(),
            policy_id: policy_id.to_string(),
            compiled_script: compiled_script.to_string(),
            fee_rate_permille,
            admin_wallet_addresses: serde_json::to_string(admin_wallet_addresses)
                .context("serialize admin wallet addresses")?,
            rpc_provider_api_key: rpc_provider_api_key.to_string(),
            sync_in_progress: false,
            created_at: now,
            updated_at: now,
        })
    }
}

impl PaymentSource {
    pub fn create(conn: &mut SqliteConnection, new_source: NewPaymentSource) -> Result<Self> {
        let source_id = new_source.id.clone();
        diesel::insert_into(payment_sources::table)
            .values(&new_source)
            .execute(conn)
            .context("Failed to insert payment source")?;
        Self::find_by_id(conn, &source_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, source_id: &str) -> Result<Self> {
        payment_sources::table
            .filter(payment_sources::id.eq(source_id))
            .first(conn)
            .context(format!("Payment source {source_id} not found"))
    }

    /// All sources the sync loop should visit: not disabled, not deleted.
    pub fn find_active(conn: &mut SqliteConnection) -> Result<Vec<Self>> {
        payment_sources::table
            .filter(payment_sources::disabled_at.is_null())
            .filter(payment_sources::deleted_at.is_null())
            .load(conn)
            .context("Failed to load active payment sources")
    }

    pub fn network(&self) -> Result<Network> {
        Network::parse(&self.network)
            .with_context(|| format!("payment source {} has unknown network {}", self.id, self.network))
    }

    pub fn admin_addresses(&self) -> Result<Vec<String>> {
        serde_json::from_str(&self.admin_wallet_addresses)
            .context("admin_wallet_addresses is not a JSON string array")
    }

    /// Multi-sig threshold: majority of the configured admin wallets.
    pub fn admin_threshold(&self) -> Result<usize> {
        let admins = self.admin_addresses()?;
        Ok(admins.len() / 2 + 1)
    }

    pub fn advance_cursor(
        conn: &mut SqliteConnection,
        source_id: &str,
        tx_hash: &str,
    ) -> Result<()> {
        diesel::update(payment_sources::table.filter(payment_sources::id.eq(source_id)))
            .set((
                payment_sources::last_identifier_checked.eq(tx_hash),
                payment_sources::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to advance cursor for source {source_id}"))?;
        Ok(())
    }

    /// Rewind the cursor to the fork point after a rollback.
    pub fn rewind_cursor(
        conn: &mut SqliteConnection,
        source_id: &str,
        tx_hash: Option<&str>,
    ) -> Result<()> {
        diesel::update(payment_sources::table.filter(payment_sources::id.eq(source_id)))
            .set((
                payment_sources::last_identifier_checked.eq(tx_hash),
                payment_sources::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to rewind cursor for source {source_id}"))?;
        Ok(())
    }

    pub fn soft_delete(conn: &mut SqliteConnection, source_id: &str) -> Result<()> {
        diesel::update(payment_sources::table.filter(payment_sources::id.eq(source_id)))
            .set((
                payment_sources::deleted_at.eq(diesel::dsl::now.nullable()),
                payment_sources::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to soft-delete source {source_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_address_bounds() {
        let one = vec!["addr_test1a".to_string()];
        assert!(NewPaymentSource::new(Network::Preprod, "addr", "p", "", 50, &one, "key").is_err());

        let three: Vec<String> = (0..3).map(|i| format!("addr_test1a{i}")).collect();
        let source =
            NewPaymentSource::new(Network::Preprod, "addr", "p", "", 50, &three, "key").unwrap();
        assert_eq!(source.network, "Preprod");
        assert_eq!(source.admin_wallet_addresses.matches("addr_test1a").count(), 3);
    }
}
