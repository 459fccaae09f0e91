//! PurchaseRequest model: the buyer-side mirror of an escrow.
//!
//! Field-for-field twin of PaymentRequest with the wallet roles flipped: the
//! hot wallet here is the Purchasing wallet, and the counterparty reference
//! (the seller) is known from creation rather than discovered on chain.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::{OnChainState, PurchasingAction};
use crate::schema::purchase_requests;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = purchase_requests)]
pub struct PurchaseRequest {
    pub id: String,
    pub payment_source_id: String,
    pub blockchain_identifier: String,
    pub input_hash: String,
    pub result_hash: String,
    pub pay_by_time: i64,
    pub submit_result_time: i64,
    pub unlock_time: i64,
    pub external_dispute_unlock_time: i64,
    pub buyer_cooldown_time: i64,
    pub seller_cooldown_time: i64,
    pub collateral_return_lovelace: i64,
    pub on_chain_state: Option<String>,
    pub requested_action: String,
    pub error_type: Option<String>,
    pub error_note: Option<String>,
    /// The SmartContractWallet (Purchasing role).
    pub hot_wallet_id: String,
    /// Foreign seller, known at creation.
    pub seller_wallet_id: String,
    pub current_transaction_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = purchase_requests)]
pub struct NewPurchaseRequest {
    pub id: String,
    pub payment_source_id: String,
    pub blockchain_identifier: String,
    pub input_hash: String,
    pub result_hash: String,
    pub pay_by_time: i64,
    pub submit_result_time: i64,
    pub unlock_time: i64,
    pub external_dispute_unlock_time: i64,
    pub buyer_cooldown_time: i64,
    pub seller_cooldown_time: i64,
    pub collateral_return_lovelace: i64,
    pub requested_action: String,
    pub hot_wallet_id: String,
    pub seller_wallet_id: String,
    pub metadata: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PurchaseRequest {
    pub fn create(conn: &mut SqliteConnection, new_request: NewPurchaseRequest) -> Result<Self> {
        let request_id = new_request.id.clone();
        // One purchase request per (source, identifier).
        let existing: i64 = purchase_requests::table
            .filter(purchase_requests::payment_source_id.eq(&new_request.payment_source_id))
            .filter(
                purchase_requests::blockchain_identifier.eq(&new_request.blockchain_identifier),
            )
            .count()
            .get_result(conn)
            .context("Failed to check identifier uniqueness")?;
        if existing > 0 {
            anyhow::bail!(
                "purchase request with identifier {} already exists",
                new_request.blockchain_identifier
            );
        }
        diesel::insert_into(purchase_requests::table)
            .values(&new_request)
            .execute(conn)
            .context("Failed to insert purchase request")?;
        Self::find_by_id(conn, &request_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, request_id: &str) -> Result<Self> {
        purchase_requests::table
            .filter(purchase_requests::id.eq(request_id))
            .first(conn)
            .context(format!("Purchase request {request_id} not found"))
    }

    pub fn find_by_identifier(
        conn: &mut SqliteConnection,
        source_id: &str,
        blockchain_identifier: &str,
    ) -> Result<Option<Self>> {
        purchase_requests::table
            .filter(purchase_requests::payment_source_id.eq(source_id))
            .filter(purchase_requests::blockchain_identifier.eq(blockchain_identifier))
            .first(conn)
            .optional()
            .context("Failed to query purchase request by identifier")
    }

    pub fn find_in_action(
        conn: &mut SqliteConnection,
        source_id: &str,
        action: PurchasingAction,
    ) -> Result<Vec<Self>> {
        purchase_requests::table
            .filter(purchase_requests::payment_source_id.eq(source_id))
            .filter(purchase_requests::requested_action.eq(action.as_str()))
            .order(purchase_requests::created_at.asc())
            .load(conn)
            .context("Failed to load purchase requests by action")
    }

    pub fn find_by_current_transaction(
        conn: &mut SqliteConnection,
        transaction_id: &str,
    ) -> Result<Vec<Self>> {
        purchase_requests::table
            .filter(purchase_requests::current_transaction_id.eq(transaction_id))
            .load(conn)
            .context("Failed to load purchase requests by current transaction")
    }

    pub fn action(&self) -> Result<PurchasingAction> {
        PurchasingAction::parse(&self.requested_action).with_context(|| {
            format!(
                "purchase request {} has unknown action {}",
                self.id, self.requested_action
            )
        })
    }

    pub fn state(&self) -> Result<Option<OnChainState>> {
        match &self.on_chain_state {
            None => Ok(None),
            Some(s) => OnChainState::parse(s)
                .map(Some)
                .with_context(|| format!("purchase request {} has unknown state {s}", self.id)),
        }
    }

    pub fn set_action(
        conn: &mut SqliteConnection,
        request_id: &str,
        action: PurchasingAction,
        error_type: Option<&str>,
        error_note: Option<&str>,
    ) -> Result<()> {
        diesel::update(purchase_requests::table.filter(purchase_requests::id.eq(request_id)))
            .set((
                purchase_requests::requested_action.eq(action.as_str()),
                purchase_requests::error_type.eq(error_type),
                purchase_requests::error_note.eq(error_note),
                purchase_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!(
                "Failed to set action on purchase request {request_id}"
            ))?;
        Ok(())
    }

    pub fn set_on_chain_state(
        conn: &mut SqliteConnection,
        request_id: &str,
        state: OnChainState,
    ) -> Result<()> {
        diesel::update(purchase_requests::table.filter(purchase_requests::id.eq(request_id)))
            .set((
                purchase_requests::on_chain_state.eq(state.as_str()),
                purchase_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!(
                "Failed to set state on purchase request {request_id}"
            ))?;
        Ok(())
    }

    pub fn set_current_transaction(
        conn: &mut SqliteConnection,
        request_id: &str,
        transaction_id: Option<&str>,
    ) -> Result<()> {
        diesel::update(purchase_requests::table.filter(purchase_requests::id.eq(request_id)))
            .set((
                purchase_requests::current_transaction_id.eq(transaction_id),
                purchase_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!(
                "Failed to set current transaction on purchase request {request_id}"
            ))?;
        Ok(())
    }

    pub fn set_unlock_time(
        conn: &mut SqliteConnection,
        request_id: &str,
        unlock_time: i64,
    ) -> Result<()> {
        diesel::update(purchase_requests::table.filter(purchase_requests::id.eq(request_id)))
            .set((
                purchase_requests::unlock_time.eq(unlock_time),
                purchase_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set unlock time on {request_id}"))?;
        Ok(())
    }

    pub fn set_result_hash(
        conn: &mut SqliteConnection,
        request_id: &str,
        result_hash: &str,
    ) -> Result<()> {
        diesel::update(purchase_requests::table.filter(purchase_requests::id.eq(request_id)))
            .set((
                purchase_requests::result_hash.eq(result_hash),
                purchase_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set result hash on {request_id}"))?;
        Ok(())
    }

    /// Cursor-paginated listing, newest first.
    pub fn page(
        conn: &mut SqliteConnection,
        source_id: &str,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<Vec<Self>> {
        let mut query = purchase_requests::table
            .filter(purchase_requests::payment_source_id.eq(source_id))
            .order(purchase_requests::created_at.desc())
            .into_boxed();
        if let Some(cursor_id) = cursor {
            let anchor = Self::find_by_id(conn, cursor_id)?;
            query = query.filter(purchase_requests::created_at.lt(anchor.created_at));
        }
        query
            .limit(page_size)
            .load(conn)
            .context("Failed to page purchase requests")
    }
}
