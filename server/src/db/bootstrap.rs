//! Embedded schema bootstrap.
//!
//! Production deployments manage the schema with external migrations; this
//! module creates the tables for fresh development databases and the test
//! suite. Every statement is idempotent.

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS payment_sources (
    id TEXT PRIMARY KEY NOT NULL,
    network TEXT NOT NULL,
    smart_contract_address TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    compiled_script TEXT NOT NULL DEFAULT '',
    fee_rate_permille INTEGER NOT NULL,
    admin_wallet_addresses TEXT NOT NULL,
    rpc_provider_api_key TEXT NOT NULL,
    last_identifier_checked TEXT,
    sync_in_progress BOOLEAN NOT NULL DEFAULT 0,
    sync_started_at BIGINT,
    disabled_at TIMESTAMP,
    deleted_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_source_identifiers (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    tx_hash TEXT NOT NULL,
    block_time BIGINT NOT NULL,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_source_identifiers_source
    ON payment_source_identifiers(payment_source_id, block_time DESC);

CREATE TABLE IF NOT EXISTS hot_wallets (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    role TEXT NOT NULL,
    vkey TEXT NOT NULL,
    address TEXT NOT NULL,
    collection_address TEXT,
    encrypted_mnemonic BLOB NOT NULL,
    locked_at BIGINT,
    note TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS wallet_bases (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    vkey TEXT NOT NULL,
    address TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_bases_identity
    ON wallet_bases(payment_source_id, vkey, address);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY NOT NULL,
    tx_hash TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    blocks_wallet_id TEXT REFERENCES hot_wallets(id),
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_hash ON transactions(tx_hash);
CREATE INDEX IF NOT EXISTS idx_transactions_wallet_status
    ON transactions(blocks_wallet_id, status);

CREATE TABLE IF NOT EXISTS payment_requests (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    blockchain_identifier TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    result_hash TEXT NOT NULL DEFAULT '',
    pay_by_time BIGINT NOT NULL,
    submit_result_time BIGINT NOT NULL,
    unlock_time BIGINT NOT NULL,
    external_dispute_unlock_time BIGINT NOT NULL,
    buyer_cooldown_time BIGINT NOT NULL DEFAULT 0,
    seller_cooldown_time BIGINT NOT NULL DEFAULT 0,
    collateral_return_lovelace BIGINT NOT NULL DEFAULT 0,
    on_chain_state TEXT,
    requested_action TEXT NOT NULL,
    error_type TEXT,
    error_note TEXT,
    hot_wallet_id TEXT NOT NULL REFERENCES hot_wallets(id),
    buyer_wallet_id TEXT REFERENCES wallet_bases(id),
    current_transaction_id TEXT REFERENCES transactions(id),
    metadata TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_requests_identifier
    ON payment_requests(payment_source_id, blockchain_identifier);
CREATE INDEX IF NOT EXISTS idx_payment_requests_action
    ON payment_requests(payment_source_id, requested_action);

CREATE TABLE IF NOT EXISTS purchase_requests (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    blockchain_identifier TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    result_hash TEXT NOT NULL DEFAULT '',
    pay_by_time BIGINT NOT NULL,
    submit_result_time BIGINT NOT NULL,
    unlock_time BIGINT NOT NULL,
    external_dispute_unlock_time BIGINT NOT NULL,
    buyer_cooldown_time BIGINT NOT NULL DEFAULT 0,
    seller_cooldown_time BIGINT NOT NULL DEFAULT 0,
    collateral_return_lovelace BIGINT NOT NULL DEFAULT 0,
    on_chain_state TEXT,
    requested_action TEXT NOT NULL,
    error_type TEXT,
    error_note TEXT,
    hot_wallet_id TEXT NOT NULL REFERENCES hot_wallets(id),
    seller_wallet_id TEXT NOT NULL REFERENCES wallet_bases(id),
    current_transaction_id TEXT REFERENCES transactions(id),
    metadata TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_purchase_requests_identifier
    ON purchase_requests(payment_source_id, blockchain_identifier);
CREATE INDEX IF NOT EXISTS idx_purchase_requests_action
    ON purchase_requests(payment_source_id, requested_action);

CREATE TABLE IF NOT EXISTS registry_requests (
    id TEXT PRIMARY KEY NOT NULL,
    payment_source_id TEXT NOT NULL REFERENCES payment_sources(id),
    hot_wallet_id TEXT NOT NULL REFERENCES hot_wallets(id),
    name TEXT NOT NULL,
    description TEXT,
    api_base_url TEXT NOT NULL,
    capability_name TEXT,
    capability_version TEXT,
    author_name TEXT NOT NULL,
    author_contact_email TEXT,
    author_organization TEXT,
    legal_privacy_policy TEXT,
    legal_terms TEXT,
    legal_other TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    example_outputs TEXT NOT NULL DEFAULT '[]',
    pricing_type TEXT NOT NULL,
    pricing TEXT NOT NULL DEFAULT '[]',
    metadata_version INTEGER NOT NULL DEFAULT 1,
    agent_identifier TEXT,
    state TEXT NOT NULL,
    current_transaction_id TEXT REFERENCES transactions(id),
    error TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_registry_requests_state
    ON registry_requests(payment_source_id, state);

CREATE TABLE IF NOT EXISTS request_amounts (
    id TEXT PRIMARY KEY NOT NULL,
    unit TEXT NOT NULL,
    amount BIGINT NOT NULL,
    kind TEXT NOT NULL,
    payment_request_id TEXT REFERENCES payment_requests(id),
    purchase_request_id TEXT REFERENCES purchase_requests(id)
);
CREATE INDEX IF NOT EXISTS idx_request_amounts_payment
    ON request_amounts(payment_request_id, kind);
CREATE INDEX IF NOT EXISTS idx_request_amounts_purchase
    ON request_amounts(purchase_request_id, kind);

CREATE TABLE IF NOT EXISTS transaction_histories (
    id TEXT PRIMARY KEY NOT NULL,
    transaction_id TEXT NOT NULL REFERENCES transactions(id),
    payment_request_id TEXT REFERENCES payment_requests(id),
    purchase_request_id TEXT REFERENCES purchase_requests(id),
    registry_request_id TEXT REFERENCES registry_requests(id),
    position INTEGER NOT NULL,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transaction_histories_payment
    ON transaction_histories(payment_request_id, position);
CREATE INDEX IF NOT EXISTS idx_transaction_histories_purchase
    ON transaction_histories(purchase_request_id, position);
"#;

/// Create all tables and indexes if they do not exist.
pub fn initialize_schema(conn: &mut SqliteConnection) -> Result<()> {
    conn.batch_execute(SCHEMA_SQL)
        .context("Failed to initialize database schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_bootstrap_is_idempotent() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        initialize_schema(&mut conn).unwrap();
        initialize_schema(&mut conn).unwrap();
    }
}
