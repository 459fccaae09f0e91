//! Append-only trail of transaction hashes observed at the script address.
//! The trail is what makes rollback detection possible: when the chain no
//! longer contains the cursor, the newest trail entry still on chain is the
//! fork point.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::payment_source_identifiers;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = payment_source_identifiers)]
pub struct SourceIdentifier {
    pub id: String,
    pub payment_source_id: String,
    pub tx_hash: String,
    pub block_time: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = payment_source_identifiers)]
pub struct NewSourceIdentifier {
    pub id: String,
    pub payment_source_id: String,
    pub tx_hash: String,
    pub block_time: i64,
    pub created_at: NaiveDateTime,
}

impl SourceIdentifier {
    pub fn append(
        conn: &mut SqliteConnection,
        source_id: &str,
        tx_hash: &str,
        block_time: i64,
    ) -> Result<()> {
        // Replays re-deliver transactions; the trail stays duplicate-free.
        let existing: i64 = payment_source_identifiers::table
            .filter(payment_source_identifiers::payment_source_id.eq(source_id))
            .filter(payment_source_identifiers::tx_hash.eq(tx_hash))
            .count()
            .get_result(conn)
            .context("Failed to check identifier trail")?;
        if existing > 0 {
            return Ok(());
        }
        let row = NewSourceIdentifier {
            id: uuid::Uuid::new_v4().to_string(),
            payment_source_id: source_id.to_string(),
            tx_hash: tx_hash.to_string(),
            block_time,
            created_at: chrono::Utc::now().naive_utc(),
        };
        diesel::insert_into(payment_source_identifiers::table)
            .values(&row)
            .execute(conn)
            .context("Failed to append source identifier")?;
        Ok(())
    }

    /// Trail for a source, newest first.
    pub fn newest_first(conn: &mut SqliteConnection, source_id: &str) -> Result<Vec<Self>> {
        payment_source_identifiers::table
            .filter(payment_source_identifiers::payment_source_id.eq(source_id))
            .order((
                payment_source_identifiers::block_time.desc(),
                payment_source_identifiers::created_at.desc(),
            ))
            .load(conn)
            .context("Failed to load identifier trail")
    }

    /// Remove trail entries for hashes that rolled back.
    pub fn remove_hashes(
        conn: &mut SqliteConnection,
        source_id: &str,
        hashes: &[String],
    ) -> Result<()> {
        diesel::delete(
            payment_source_identifiers::table
                .filter(payment_source_identifiers::payment_source_id.eq(source_id))
                .filter(payment_source_identifiers::tx_hash.eq_any(hashes)),
        )
        .execute(conn)
        .context("Failed to remove rolled-back identifiers")?;
        Ok(())
    }
}
