// Table definitions for the coordinator store.

diesel::table! {
    payment_sources (id) {
        id -> Text,
        network -> Text,
        smart_contract_address -> Text,
        policy_id -> Text,
        compiled_script -> Text,
        fee_rate_permille -> Integer,
        admin_wallet_addresses -> Text,
        rpc_provider_api_key -> Text,
        last_identifier_checked -> Nullable<Text>,
        sync_in_progress -> Bool,
        sync_started_at -> Nullable<BigInt>,
        disabled_at -> Nullable<Timestamp>,
        deleted_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    payment_source_identifiers (id) {
        id -> Text,
        payment_source_id -> Text,
        tx_hash -> Text,
        block_time -> BigInt,
        created_at -> Timestamp,
    }
}

diesel::table! {
    hot_wallets (id) {
        id -> Text,
        payment_source_id -> Text,
        role -> Text,
        vkey -> Text,
        address -> Text,
        collection_address -> Nullable<Text>,
        encrypted_mnemonic -> Binary,
        locked_at -> Nullable<BigInt>,
        note -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    wallet_bases (id) {
        id -> Text,
        payment_source_id -> Text,
        vkey -> Text,
        address -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    transactions (id) {
        id -> Text,
        tx_hash -> Text,
        status -> Text,
        blocks_wallet_id -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    payment_requests (id) {
        id -> Text,
        payment_source_id -> Text,
        blockchain_identifier -> Text,
        input_hash -> Text,
        result_hash -> Text,
        pay_by_time -> BigInt,
        submit_result_time -> BigInt,
        unlock_time -> BigInt,
        external_dispute_unlock_time -> BigInt,
        buyer_cooldown_time -> BigInt,
        seller_cooldown_time -> BigInt,
        collateral_return_lovelace -> BigInt,
        on_chain_state -> Nullable<Text>,
        requested_action -> Text,
        error_type -> Nullable<Text>,
        error_note -> Nullable<Text>,
        hot_wallet_id -> Text,
        buyer_wallet_id -> Nullable<Text>,
        current_transaction_id -> Nullable<Text>,
        metadata -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    purchase_requests (id) {
        id -> Text,
        payment_source_id -> Text,
        blockchain_identifier -> Text,
        input_hash -> Text,
        result_hash -> Text,
        pay_by_time -> BigInt,
        submit_result_time -> BigInt,
        unlock_time -> BigInt,
        external_dispute_unlock_time -> BigInt,
        buyer_cooldown_time -> BigInt,
        seller_cooldown_time -> BigInt,
        collateral_return_lovelace -> BigInt,
        on_chain_state -> Nullable<Text>,
        requested_action -> Text,
        error_type -> Nullable<Text>,
        error_note -> Nullable<Text>,
        hot_wallet_id -> Text,
        seller_wallet_id -> Text,
        current_transaction_id -> Nullable<Text>,
        metadata -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    registry_requests (id) {
        id -> Text,
        payment_source_id -> Text,
        hot_wallet_id -> Text,
        name -> Text,
        description -> Nullable<Text>,
        api_base_url -> Text,
        capability_name -> Nullable<Text>,
        capability_version -> Nullable<Text>,
        author_name -> Text,
        author_contact_email -> Nullable<Text>,
        author_organization -> Nullable<Text>,
        legal_privacy_policy -> Nullable<Text>,
        legal_terms -> Nullable<Text>,
        legal_other -> Nullable<Text>,
        tags -> Text,
        example_outputs -> Text,
        pricing_type -> Text,
        pricing -> Text,
        metadata_version -> Integer,
        agent_identifier -> Nullable<Text>,
        state -> Text,
        current_transaction_id -> Nullable<Text>,
        error -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    request_amounts (id) {
        id -> Text,
        unit -> Text,
        amount -> BigInt,
        kind -> Text,
        payment_request_id -> Nullable<Text>,
        purchase_request_id -> Nullable<Text>,
    }
}

diesel::table! {
    transaction_histories (id) {
        id -> Text,
        transaction_id -> Text,
        payment_request_id -> Nullable<Text>,
        purchase_request_id -> Nullable<Text>,
        registry_request_id -> Nullable<Text>,
        position -> Integer,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    payment_sources,
    payment_source_identifiers,
    hot_wallets,
    wallet_bases,
    transactions,
    payment_requests,
    purchase_requests,
    registry_requests,
    request_amounts,
    transaction_histories,
);
