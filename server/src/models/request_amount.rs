//! Amount rows: requested/paid/withdrawn multisets attached to a request.
//! The empty unit means lovelace.

use anyhow::{Context, Result};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::AmountKind;
use crate::schema::request_amounts;

/// One `{unit, amount}` entry. `unit` is `policy_id ++ asset_name` hex, or
/// empty for lovelace.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, PartialEq, Eq)]
#[diesel(table_name = request_amounts)]
pub struct RequestAmount {
    pub id: String,
    pub unit: String,
    pub amount: i64,
    pub kind: String,
    pub payment_request_id: Option<String>,
    pub purchase_request_id: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = request_amounts)]
pub struct NewRequestAmount {
    pub id: String,
    pub unit: String,
    pub amount: i64,
    pub kind: String,
    pub payment_request_id: Option<String>,
    pub purchase_request_id: Option<String>,
}

/// Which mirror an amount row belongs to.
#[derive(Debug, Clone, Copy)]
pub enum AmountOwner<'a> {
    Payment(&'a str),
    Purchase(&'a str),
}

impl RequestAmount {
    pub fn insert_all(
        conn: &mut SqliteConnection,
        owner: AmountOwner<'_>,
        kind: AmountKind,
        funds: &[(String, i64)],
    ) -> Result<()> {
        for (unit, amount) in funds {
            if *amount < 0 {
                anyhow::bail!("negative amount {amount} for unit {unit:?}");
            }
            let row = NewRequestAmount {
                id: uuid::Uuid::new_v4().to_string(),
                unit: unit.clone(),
                amount: *amount,
                kind: kind.as_str().to_string(),
                payment_request_id: match owner {
                    AmountOwner::Payment(id) => Some(id.to_string()),
                    AmountOwner::Purchase(_) => None,
                },
                purchase_request_id: match owner {
                    AmountOwner::Purchase(id) => Some(id.to_string()),
                    AmountOwner::Payment(_) => None,
                },
            };
            diesel::insert_into(request_amounts::table)
                .values(&row)
                .execute(conn)
                .context("Failed to insert request amount")?;
        }
        Ok(())
    }

    pub fn find_for(
        conn: &mut SqliteConnection,
        owner: AmountOwner<'_>,
        kind: AmountKind,
    ) -> Result<Vec<Self>> {
        let mut query = request_amounts::table
            .filter(request_amounts::kind.eq(kind.as_str()))
            .into_boxed();
        query = match owner {
            AmountOwner::Payment(id) => {
                query.filter(request_amounts::payment_request_id.eq(id.to_string()))
            }
            AmountOwner::Purchase(id) => {
                query.filter(request_amounts::purchase_request_id.eq(id.to_string()))
            }
        };
        query
            .order(request_amounts::unit.asc())
            .load(conn)
            .context("Failed to load request amounts")
    }

    /// `(unit, amount)` pairs for the given owner and kind.
    pub fn pairs_for(
        conn: &mut SqliteConnection,
        owner: AmountOwner<'_>,
        kind: AmountKind,
    ) -> Result<Vec<(String, i64)>> {
        Ok(Self::find_for(conn, owner, kind)?
            .into_iter()
            .map(|row| (row.unit, row.amount))
            .collect())
    }
}
