//! RegistryRequest model: a seller's intent to mint (or burn) an agent
//! identifier NFT.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::RegistrationState;
use crate::schema::registry_requests;

/// Pricing model for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingType {
    Fixed,
    Free,
}

impl PricingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingType::Fixed => "Fixed",
            PricingType::Free => "Free",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Fixed" => Some(PricingType::Fixed),
            "Free" => Some(PricingType::Free),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = registry_requests)]
pub struct RegistryRequest {
    pub id: String,
    pub payment_source_id: String,
    /// Selling-role wallet that pays for and signs the mint.
    pub hot_wallet_id: String,
    pub name: String,
    pub description: Option<String>,
    pub api_base_url: String,
    pub capability_name: Option<String>,
    pub capability_version: Option<String>,
    pub author_name: String,
    pub author_contact_email: Option<String>,
    pub author_organization: Option<String>,
    pub legal_privacy_policy: Option<String>,
    pub legal_terms: Option<String>,
    pub legal_other: Option<String>,
    /// JSON string array.
    pub tags: String,
    /// JSON string array.
    pub example_outputs: String,
    pub pricing_type: String,
    /// JSON array of `{unit, amount}` with decimal-string amounts.
    pub pricing: String,
    pub metadata_version: i32,
    /// `policy_id ++ asset_name` hex, set once the mint is submitted.
    pub agent_identifier: Option<String>,
    pub state: String,
    pub current_transaction_id: Option<String>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = registry_requests)]
pub struct NewRegistryRequest {
    pub id: String,
    pub payment_source_id: String,
    pub hot_wallet_id: String,
    pub name: String,
    pub description: Option<String>,
    pub api_base_url: String,
    pub capability_name: Option<String>,
    pub capability_version: Option<String>,
    pub author_name: String,
    pub author_contact_email: Option<String>,
    pub author_organization: Option<String>,
    pub legal_privacy_policy: Option<String>,
    pub legal_terms: Option<String>,
    pub legal_other: Option<String>,
    pub tags: String,
    pub example_outputs: String,
    pub pricing_type: String,
    pub pricing: String,
    pub metadata_version: i32,
    pub state: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl RegistryRequest {
    pub fn create(conn: &mut SqliteConnection, new_request: NewRegistryRequest) -> Result<Self> {
        let request_id = new_request.id.clone();
        diesel::insert_into(registry_requests::table)
            .values(&new_request)
            .execute(conn)
            .context("Failed to insert registry request")?;
        Self::find_by_id(conn, &request_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, request_id: &str) -> Result<Self> {
        registry_requests::table
            .filter(registry_requests::id.eq(request_id))
            .first(conn)
            .context(format!("Registry request {request_id} not found"))
    }

    pub fn find_in_state(
        conn: &mut SqliteConnection,
        source_id: &str,
        state: RegistrationState,
    ) -> Result<Vec<Self>> {
        registry_requests::table
            .filter(registry_requests::payment_source_id.eq(source_id))
            .filter(registry_requests::state.eq(state.as_str()))
            .order(registry_requests::created_at.asc())
            .load(conn)
            .context("Failed to load registry requests by state")
    }

    pub fn find_by_agent_identifier(
        conn: &mut SqliteConnection,
        agent_identifier: &str,
    ) -> Result<Option<Self>> {
        registry_requests::table
            .filter(registry_requests::agent_identifier.eq(agent_identifier))
            .first(conn)
            .optional()
            .context("Failed to query registry request by agent identifier")
    }

    pub fn find_by_current_transaction(
        conn: &mut SqliteConnection,
        transaction_id: &str,
    ) -> Result<Vec<Self>> {
        registry_requests::table
            .filter(registry_requests::current_transaction_id.eq(transaction_id))
            .load(conn)
            .context("Failed to load registry requests by current transaction")
    }

    pub fn state(&self) -> Result<RegistrationState> {
        RegistrationState::parse(&self.state)
            .with_context(|| format!("registry request {} has unknown state {}", self.id, self.state))
    }

    pub fn pricing_type(&self) -> Result<PricingType> {
        PricingType::parse(&self.pricing_type).with_context(|| {
            format!(
                "registry request {} has unknown pricing type {}",
                self.id, self.pricing_type
            )
        })
    }

    pub fn tags_vec(&self) -> Result<Vec<String>> {
        serde_json::from_str(&self.tags).context("tags is not a JSON string array")
    }

    pub fn example_outputs_vec(&self) -> Result<Vec<String>> {
        serde_json::from_str(&self.example_outputs)
            .context("example_outputs is not a JSON string array")
    }

    /// Parsed pricing entries: `(unit, amount)` with u64 amounts.
    pub fn pricing_entries(&self) -> Result<Vec<(String, u64)>> {
        #[derive(Deserialize)]
        struct Entry {
            unit: String,
            amount: String,
        }
        let entries: Vec<Entry> =
            serde_json::from_str(&self.pricing).context("pricing is not a JSON array")?;
        entries
            .into_iter()
            .map(|entry| {
                let amount = entry
                    .amount
                    .parse::<u64>()
                    .with_context(|| format!("pricing amount {:?} is not u64", entry.amount))?;
                Ok((entry.unit, amount))
            })
            .collect()
    }

    pub fn set_state(
        conn: &mut SqliteConnection,
        request_id: &str,
        state: RegistrationState,
        error: Option<&str>,
    ) -> Result<()> {
        diesel::update(registry_requests::table.filter(registry_requests::id.eq(request_id)))
            .set((
                registry_requests::state.eq(state.as_str()),
                registry_requests::error.eq(error),
                registry_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set state on registry request {request_id}"))?;
        Ok(())
    }

    pub fn set_agent_identifier(
        conn: &mut SqliteConnection,
        request_id: &str,
        agent_identifier: &str,
    ) -> Result<()> {
        diesel::update(registry_requests::table.filter(registry_requests::id.eq(request_id)))
            .set((
                registry_requests::agent_identifier.eq(agent_identifier),
                registry_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set agent identifier on {request_id}"))?;
        Ok(())
    }

    pub fn set_current_transaction(
        conn: &mut SqliteConnection,
        request_id: &str,
        transaction_id: Option<&str>,
    ) -> Result<()> {
        diesel::update(registry_requests::table.filter(registry_requests::id.eq(request_id)))
            .set((
                registry_requests::current_transaction_id.eq(transaction_id),
                registry_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!(
                "Failed to set current transaction on registry request {request_id}"
            ))?;
        Ok(())
    }

    pub fn delete(conn: &mut SqliteConnection, request_id: &str) -> Result<()> {
        diesel::delete(registry_requests::table.filter(registry_requests::id.eq(request_id)))
            .execute(conn)
            .context(format!("Failed to delete registry request {request_id}"))?;
        Ok(())
    }

    /// Cursor-paginated listing, newest first.
    pub fn page(
        conn: &mut SqliteConnection,
        source_id: &str,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<Vec<Self>> {
        let mut query = registry_requests::table
            .filter(registry_requests::payment_source_id.eq(source_id))
            .order(registry_requests::created_at.desc())
            .into_boxed();
        if let Some(cursor_id) = cursor {
            let anchor = Self::find_by_id(conn, cursor_id)?;
            query = query.filter(registry_requests::created_at.lt(anchor.created_at));
        }
        query
            .limit(page_size)
            .load(conn)
            .context("Failed to page registry requests")
    }
}
