//! PaymentRequest model: the seller-side view of an escrow.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::{OnChainState, PaymentAction};
use crate::schema::payment_requests;

/// Minimum hex length of an input hash (SHA-224 or wider).
pub const MIN_INPUT_HASH_HEX: usize = 56;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = payment_requests)]
pub struct PaymentRequest {
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
    /// The SmartContractWallet (Selling role).
    pub hot_wallet_id: String,
    /// Foreign buyer; NULL until funds are observed locked.
    pub buyer_wallet_id: Option<String>,
    pub current_transaction_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = payment_requests)]
pub struct NewPaymentRequest {
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
    pub metadata: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Validate the shared temporal and hash invariants of both mirrors.
pub fn validate_escrow_fields(
    input_hash: &str,
    pay_by_time: i64,
    submit_result_time: i64,
    unlock_time: i64,
    external_dispute_unlock_time: i64,
    collateral_return_lovelace: i64,
    min_collateral: i64,
) -> Result<()> {
    if input_hash.len() < MIN_INPUT_HASH_HEX
        || !input_hash.chars().all(|c| c.is_ascii_hexdigit())
        || input_hash.chars().any(|c| c.is_ascii_uppercase())
    {
        anyhow::bail!("inputHash must be lowercase hex of at least {MIN_INPUT_HASH_HEX} chars");
    }
    if !(pay_by_time < submit_result_time
        && submit_result_time <= unlock_time
        && unlock_time <= external_dispute_unlock_time)
    {
        anyhow::bail!(
            "time ordering violated: payByTime < submitResultTime <= unlockTime <= externalDisputeUnlockTime"
        );
    }
    if collateral_return_lovelace != 0 && collateral_return_lovelace < min_collateral {
        anyhow::bail!(
            "collateralReturnLovelace must be 0 or at least {min_collateral}, got {collateral_return_lovelace}"
        );
    }
    Ok(())
}

impl PaymentRequest {
    pub fn create(conn: &mut SqliteConnection, new_request: NewPaymentRequest) -> Result<Self> {
        let request_id = new_request.id.clone();
        // One payment request per (source, identifier).
        let existing: i64 = payment_requests::table
            .filter(payment_requests::payment_source_id.eq(&new_request.payment_source_id))
            .filter(
                payment_requests::blockchain_identifier.eq(&new_request.blockchain_identifier),
            )
            .count()
            .get_result(conn)
            .context("Failed to check identifier uniqueness")?;
        if existing > 0 {
            anyhow::bail!(
                "payment request with identifier {} already exists",
                new_request.blockchain_identifier
            );
        }
        diesel::insert_into(payment_requests::table)
            .values(&new_request)
            .execute(conn)
            .context("Failed to insert payment request")?;
        Self::find_by_id(conn, &request_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, request_id: &str) -> Result<Self> {
        payment_requests::table
            .filter(payment_requests::id.eq(request_id))
            .first(conn)
            .context(format!("Payment request {request_id} not found"))
    }

    pub fn find_by_identifier(
        conn: &mut SqliteConnection,
        source_id: &str,
        blockchain_identifier: &str,
    ) -> Result<Option<Self>> {
        payment_requests::table
            .filter(payment_requests::payment_source_id.eq(source_id))
            .filter(payment_requests::blockchain_identifier.eq(blockchain_identifier))
            .first(conn)
            .optional()
            .context("Failed to query payment request by identifier")
    }

    pub fn find_in_action(
        conn: &mut SqliteConnection,
        source_id: &str,
        action: PaymentAction,
    ) -> Result<Vec<Self>> {
        payment_requests::table
            .filter(payment_requests::payment_source_id.eq(source_id))
            .filter(payment_requests::requested_action.eq(action.as_str()))
            .order(payment_requests::created_at.asc())
            .load(conn)
            .context("Failed to load payment requests by action")
    }

    pub fn find_by_current_transaction(
        conn: &mut SqliteConnection,
        transaction_id: &str,
    ) -> Result<Vec<Self>> {
        payment_requests::table
            .filter(payment_requests::current_transaction_id.eq(transaction_id))
            .load(conn)
            .context("Failed to load payment requests by current transaction")
    }

    pub fn action(&self) -> Result<PaymentAction> {
        PaymentAction::parse(&self.requested_action).with_context(|| {
            format!(
                "payment request {} has unknown action {}",
                self.id, self.requested_action
            )
        })
    }

    pub fn state(&self) -> Result<Option<OnChainState>> {
        match &self.on_chain_state {
            None => Ok(None),
            Some(s) => OnChainState::parse(s)
                .map(Some)
                .with_context(|| format!("payment request {} has unknown state {s}", self.id)),
        }
    }

    pub fn set_action(
        conn: &mut SqliteConnection,
        request_id: &str,
        action: PaymentAction,
        error_type: Option<&str>,
        error_note: Option<&str>,
    ) -> Result<()> {
        diesel::update(payment_requests::table.filter(payment_requests::id.eq(request_id)))
            .set((
                payment_requests::requested_action.eq(action.as_str()),
                payment_requests::error_type.eq(error_type),
                payment_requests::error_note.eq(error_note),
                payment_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set action on payment request {request_id}"))?;
        Ok(())
    }

    pub fn set_on_chain_state(
        conn: &mut SqliteConnection,
        request_id: &str,
        state: OnChainState,
    ) -> Result<()> {
        diesel::update(payment_requests::table.filter(payment_requests::id.eq(request_id)))
            .set((
                payment_requests::on_chain_state.eq(state.as_str()),
                payment_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to set state on payment request {request_id}"))?;
        Ok(())
    }

    pub fn set_current_transaction(
        conn: &mut SqliteConnection,
        request_id: &str,
        transaction_id: Option<&str>,
    ) -> Result<()> {
        diesel::update(payment_requests::table.filter(payment_requests::id.eq(request_id)))
            .set((
                payment_requests::current_transaction_id.eq(transaction_id),
                payment_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!(
                "Failed to set current transaction on payment request {request_id}"
            ))?;
        Ok(())
    }

    pub fn attach_buyer_wallet(
        conn: &mut SqliteConnection,
        request_id: &str,
        wallet_id: &str,
    ) -> Result<()> {
        diesel::update(payment_requests::table.filter(payment_requests::id.eq(request_id)))
            .set((
                payment_requests::buyer_wallet_id.eq(wallet_id),
                payment_requests::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context(format!("Failed to attach buyer wallet to {request_id}"))?;
        Ok(())
    }

    pub fn set_result_hash(
        conn: &mut SqliteConnection,
        request_id: &str,
        result_hash: &str,
    ) -> Result<()> {
        diesel::update(payment_requests::table.filter(payment_requests::id.eq(request_id)))
            .set((
                payment_requests::result_hash.eq(result_hash),
                payment_requests::updated_at.eq(diesel::dsl::now),
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
        let mut query = payment_requests::table
            .filter(payment_requests::payment_source_id.eq(source_id))
            .order(payment_requests::created_at.desc())
            .into_boxed();
        if let Some(cursor_id) = cursor {
            let anchor = Self::find_by_id(conn, cursor_id)?;
            query = query.filter(payment_requests::created_at.lt(anchor.created_at));
        }
        query
            .limit(page_size)
            .load(conn)
            .context("Failed to page payment requests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_hash_validation() {
        let ok = "a".repeat(64);
        assert!(validate_escrow_fields(&ok, 1, 2, 3, 4, 0, 5_000_000).is_ok());
        // too short
        assert!(validate_escrow_fields("abc", 1, 2, 3, 4, 0, 5_000_000).is_err());
        // uppercase
        let upper = "A".repeat(64);
        assert!(validate_escrow_fields(&upper, 1, 2, 3, 4, 0, 5_000_000).is_err());
        // non-hex
        let bad = "z".repeat(64);
        assert!(validate_escrow_fields(&bad, 1, 2, 3, 4, 0, 5_000_000).is_err());
    }

    #[test]
    fn test_time_ordering_validation() {
        let hash = "a".repeat(64);
        // pay_by_time must be strictly before submit_result_time
        assert!(validate_escrow_fields(&hash, 2, 2, 3, 4, 0, 5_000_000).is_err());
        // submit_result_time == unlock_time is allowed
        assert!(validate_escrow_fields(&hash, 1, 3, 3, 4, 0, 5_000_000).is_ok());
        // unlock_time == external_dispute_unlock_time is allowed
        assert!(validate_escrow_fields(&hash, 1, 2, 4, 4, 0, 5_000_000).is_ok());
    }

    #[test]
    fn test_collateral_validation() {
        let hash = "a".repeat(64);
        assert!(validate_escrow_fields(&hash, 1, 2, 3, 4, 0, 5_000_000).is_ok());
        assert!(validate_escrow_fields(&hash, 1, 2, 3, 4, 4_999_999, 5_000_000).is_err());
        assert!(validate_escrow_fields(&hash, 1, 2, 3, 4, 5_000_000, 5_000_000).is_ok());
    }
}
