//! Core API operations: creation flows, queued actions and validation.

use server::db::run_serializable;
use server::models::registry_request::{NewRegistryRequest, RegistryRequest};
use server::models::state::{OnChainState, PaymentAction, RegistrationState};
use server::models::payment_request::PaymentRequest;
use server::services::api::{
    input_hash_of, CoreApi, CreatePaymentInput, CreatePurchaseInput, Envelope, FundsInput,
    RegisterAgentInput,
};

use crate::fixtures::{test_config, Fixture, HOUR_MS, T0_MS};

fn api(fixture: &Fixture) -> CoreApi {
    CoreApi::new(fixture.pool.clone(), test_config())
}

/// A confirmed registry entry for the fixture's selling wallet.
async fn seed_confirmed_agent(fixture: &Fixture) -> String {
    let agent_identifier = format!("{}{}", "ab".repeat(28), "cd".repeat(32));
    let source_id = fixture.source.id.clone();
    let wallet_id = fixture.selling_wallet.id.clone();
    let identifier = agent_identifier.clone();
    run_serializable(&fixture.pool, move |conn| {
        let now = chrono::Utc::now().naive_utc();
        let request = RegistryRequest::create(
            conn,
            NewRegistryRequest {
                id: uuid::Uuid::new_v4().to_string(),
                payment_source_id: source_id,
                hot_wallet_id: wallet_id,
                name: "A".into(),
                description: None,
                api_base_url: "https://agent.example".into(),
                capability_name: None,
                capability_version: None,
                author_name: "Author".into(),
                author_contact_email: None,
                author_organization: None,
                legal_privacy_policy: None,
                legal_terms: None,
                legal_other: None,
                tags: "[]".into(),
                example_outputs: "[]".into(),
                pricing_type: "Fixed".into(),
                pricing: r#"[{"unit":"lovelace","amount":"1000000"}]"#.into(),
                metadata_version: 1,
                state: RegistrationState::RegistrationConfirmed.as_str().to_string(),
                created_at: now,
                updated_at: now,
            },
        )?;
        RegistryRequest::set_agent_identifier(conn, &request.id, &identifier)?;
        Ok(())
    })
    .await
    .unwrap();
    agent_identifier
}

fn payment_input(agent_identifier: &str) -> CreatePaymentInput {
    CreatePaymentInput {
        network: "Preprod".into(),
        agent_identifier: agent_identifier.to_string(),
        payment_type: Some("Web3CardanoV1".into()),
        pay_by_time: T0_MS + 11 * HOUR_MS,
        submit_result_time: T0_MS + 12 * HOUR_MS,
        unlock_time: T0_MS + 18 * HOUR_MS,
        external_dispute_unlock_time: T0_MS + 24 * HOUR_MS,
        identifier_from_purchaser: "0123456789abcdef0123".into(),
        input_hash: input_hash_of(&serde_json::json!({"job": "itinerary"})),
        metadata: None,
        requested_funds: None,
        collateral_return_lovelace: 0,
    }
}

#[tokio::test]
async fn test_register_agent_creates_requested_entry() {
    let fixture = Fixture::new();
    let api = api(&fixture);

    let input = RegisterAgentInput {
        payment_source_id: fixture.source.id.clone(),
        selling_wallet_vkey: fixture.selling_wallet.vkey.clone(),
        name: "A".into(),
        description: Some("travel planning agent".into()),
        api_base_url: "https://agent.example".into(),
        capability_name: Some("planning".into()),
        capability_version: Some("1.0".into()),
        author_name: "Author".into(),
        author_contact_email: None,
        author_organization: None,
        legal_privacy_policy: None,
        legal_terms: None,
        legal_other: None,
        tags: vec!["travel".into()],
        example_outputs: vec![],
        pricing_type: "Fixed".into(),
        pricing: vec![FundsInput {
            unit: "lovelace".into(),
            amount: "1000000".into(),
        }],
    };
    let Envelope::Success { data } = api.register_agent(input.clone()).await else {
        panic!("register_agent failed");
    };
    assert_eq!(data.state, "RegistrationRequested");
    assert_eq!(data.agent_identifier, None);

    // Fixed pricing without entries is a validation failure.
    let mut bad = input;
    bad.pricing.clear();
    assert!(matches!(
        api.register_agent(bad).await,
        Envelope::Error { .. }
    ));
}

#[tokio::test]
async fn test_create_payment_uses_agent_pricing() {
    let fixture = Fixture::new();
    let agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    let Envelope::Success { data } = api.create_payment(payment_input(&agent)).await else {
        panic!("create_payment failed");
    };
    assert!(data
        .blockchain_identifier
        .ends_with("0123456789abcdef0123"));
    assert_eq!(data.next_action.requested_action, "WaitingForExternalAction");
    assert_eq!(data.requested_funds.len(), 1);
    assert_eq!(data.requested_funds[0].amount, "1000000");
    assert_eq!(data.on_chain_state, None);
}

#[tokio::test]
async fn test_create_payment_rejects_bad_purchaser_id() {
    let fixture = Fixture::new();
    let agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    let mut input = payment_input(&agent);
    input.identifier_from_purchaser = "UPPERCASE0123456789".into();
    let Envelope::Error { error } = api.create_payment(input).await else {
        panic!("expected validation failure");
    };
    assert_eq!(error.field.as_deref(), Some("identifierFromPurchaser"));
}

#[tokio::test]
async fn test_create_payment_rejects_time_disorder() {
    let fixture = Fixture::new();
    let agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    let mut input = payment_input(&agent);
    input.pay_by_time = input.submit_result_time; // must be strictly before
    assert!(matches!(
        api.create_payment(input).await,
        Envelope::Error { .. }
    ));
}

#[tokio::test]
async fn test_create_purchase_and_refund_queueing() {
    let fixture = Fixture::new();
    let _agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    let blockchain_identifier = format!("{}{}", "ee".repeat(20), "0123456789abcdef0123");
    let input = CreatePurchaseInput {
        blockchain_identifier: blockchain_identifier.clone(),
        network: "Preprod".into(),
        input_hash: input_hash_of(&serde_json::json!({"job": "itinerary"})),
        seller_vkey: fixture.seller_base.vkey.clone(),
        seller_address: Some(fixture.seller_base.address.clone()),
        agent_identifier: format!("{}{}", "ab".repeat(28), "cd".repeat(32)),
        payment_type: Some("Web3CardanoV1".into()),
        pay_by_time: T0_MS + 11 * HOUR_MS,
        submit_result_time: T0_MS + 12 * HOUR_MS,
        unlock_time: T0_MS + 18 * HOUR_MS,
        external_dispute_unlock_time: T0_MS + 24 * HOUR_MS,
        identifier_from_purchaser: "0123456789abcdef0123".into(),
        requested_funds: Some(vec![FundsInput {
            unit: "lovelace".into(),
            amount: "1000000".into(),
        }]),
        collateral_return_lovelace: 0,
        metadata: None,
    };
    let Envelope::Success { data } = api.create_purchase(input.clone()).await else {
        panic!("create_purchase failed");
    };
    assert_eq!(data.next_action.requested_action, "FundsLockingRequested");

    // Duplicate identifier is rejected.
    assert!(matches!(
        api.create_purchase(input).await,
        Envelope::Error { .. }
    ));

    // Refund request requires locked funds; no on-chain state yet.
    assert!(matches!(
        api.request_refund(&blockchain_identifier).await,
        Envelope::Error { .. }
    ));
}

#[tokio::test]
async fn test_submit_result_requires_locked_funds() {
    let fixture = Fixture::new();
    let agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    let Envelope::Success { data } = api.create_payment(payment_input(&agent)).await else {
        panic!("create_payment failed");
    };

    // No funds locked yet: rejected.
    assert!(matches!(
        api.submit_result("Preprod", &data.blockchain_identifier, &"ff00".repeat(16))
            .await,
        Envelope::Error { .. }
    ));

    // Once the sync loop has seen the lock, submission queues the action.
    let identifier = data.blockchain_identifier.clone();
    let source_id = fixture.source.id.clone();
    run_serializable(&fixture.pool, move |conn| {
        let request = PaymentRequest::find_by_identifier(conn, &source_id, &identifier)?
            .expect("payment exists");
        PaymentRequest::set_on_chain_state(conn, &request.id, OnChainState::FundsLocked)
    })
    .await
    .unwrap();

    let Envelope::Success { data } = api
        .submit_result("Preprod", &data.blockchain_identifier, &"ff00".repeat(16))
        .await
    else {
        panic!("submit_result failed");
    };
    assert_eq!(
        data.next_action.requested_action,
        PaymentAction::SubmitResultRequested.as_str()
    );
    assert_eq!(data.result_hash, "ff00".repeat(16));
}

#[tokio::test]
async fn test_query_payments_paginates_at_ten() {
    let fixture = Fixture::new();
    let agent = seed_confirmed_agent(&fixture).await;
    let api = api(&fixture);

    for index in 0..12 {
        let mut input = payment_input(&agent);
        input.identifier_from_purchaser = format!("{:020x}", 0x1000 + index);
        let Envelope::Success { .. } = api.create_payment(input).await else {
            panic!("create_payment {index} failed");
        };
    }

    let Envelope::Success { data: first_page } =
        api.query_payments(&fixture.source.id, None, false).await
    else {
        panic!("query failed");
    };
    assert_eq!(first_page.items.len(), 10);
    let cursor = first_page.next_cursor.expect("a second page exists");

    let Envelope::Success { data: second_page } = api
        .query_payments(&fixture.source.id, Some(&cursor), false)
        .await
    else {
        panic!("query failed");
    };
    assert_eq!(second_page.items.len(), 2);
}
