//! Core operations consumed by the HTTP layer.
//!
//! The engine owns these entry points; the REST surface above is a thin
//! serialization shell. Responses use an explicit envelope instead of
//! duck-typed `{status, data}` objects, and every validation failure names
//! the offending field.

use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::EngineConfig;
use crate::db::{run, run_serializable, DbPool};
use crate::models::hot_wallet::HotWallet;
use crate::models::payment_request::{validate_escrow_fields, NewPaymentRequest, PaymentRequest};
use crate::models::payment_source::PaymentSource;
use crate::models::purchase_request::{NewPurchaseRequest, PurchaseRequest};
use crate::models::registry_request::{NewRegistryRequest, PricingType, RegistryRequest};
use crate::models::request_amount::{AmountOwner, RequestAmount};
use crate::models::state::{
    AmountKind, OnChainState, PaymentAction, PurchasingAction, RegistrationState, WalletRole,
};
use crate::models::transaction::{HistoryOwner, Transaction, TransactionHistory};
use crate::models::wallet_base::WalletBase;
use masumi_codec::Network;

/// Query page size.
pub const PAGE_SIZE: i64 = 10;

/// Explicit response envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Success { data: T },
    Error { error: ApiError },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ApiError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }
}

impl<T> From<Result<T, ApiError>> for Envelope<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(data) => Envelope::Success { data },
            Err(error) => Envelope::Error { error },
        }
    }
}

/// SHA-256 of the canonical (sorted-key) JSON form, lowercase hex.
pub fn input_hash_of(payload: &serde_json::Value) -> String {
    // serde_json maps are sorted by key when the canonical feature set is
    // default; re-serialize through BTreeMap to force it for objects.
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> = map
                    .iter()
                    .map(|(key, val)| (key.clone(), canonicalize(val)))
                    .collect();
                serde_json::to_value(sorted).expect("canonical object serializes")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    let canonical = canonicalize(payload).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn validate_purchaser_id(identifier: &str) -> Result<(), ApiError> {
    if !(14..=26).contains(&identifier.len()) || !is_lower_hex(identifier) {
        return Err(ApiError::field(
            "identifierFromPurchaser",
            "must be 14-26 lowercase hex characters",
        ));
    }
    Ok(())
}

// --- views ----------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextActionView {
    pub requested_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_note: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub tx_hash: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsView {
    pub unit: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub id: String,
    pub blockchain_identifier: String,
    pub input_hash: String,
    pub result_hash: String,
    pub pay_by_time: i64,
    pub submit_result_time: i64,
    pub unlock_time: i64,
    pub external_dispute_unlock_time: i64,
    pub on_chain_state: Option<String>,
    pub next_action: NextActionView,
    pub requested_funds: Vec<FundsView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_transaction: Option<TransactionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_history: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryView {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as `cursorId` to fetch the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// --- inputs ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentInput {
    pub payment_source_id: String,
    pub selling_wallet_vkey: String,
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
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub example_outputs: Vec<String>,
    pub pricing_type: String,
    /// `{unit, amount}` with decimal-string amounts.
    #[serde(default)]
    pub pricing: Vec<FundsInput>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsInput {
    pub unit: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentInput {
    pub network: String,
    pub agent_identifier: String,
    pub payment_type: Option<String>,
    pub pay_by_time: i64,
    pub submit_result_time: i64,
    pub unlock_time: i64,
    pub external_dispute_unlock_time: i64,
    pub identifier_from_purchaser: String,
    pub input_hash: String,
    pub metadata: Option<String>,
    pub requested_funds: Option<Vec<FundsInput>>,
    #[serde(default)]
    pub collateral_return_lovelace: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseInput {
    pub blockchain_identifier: String,
    pub network: String,
    pub input_hash: String,
    pub seller_vkey: String,
    pub seller_address: Option<String>,
    pub agent_identifier: String,
    pub payment_type: Option<String>,
    pub pay_by_time: i64,
    pub submit_result_time: i64,
    pub unlock_time: i64,
    pub external_dispute_unlock_time: i64,
    pub identifier_from_purchaser: String,
    pub requested_funds: Option<Vec<FundsInput>>,
    #[serde(default)]
    pub collateral_return_lovelace: i64,
    pub metadata: Option<String>,
}

fn parse_funds(funds: &[FundsInput], field: &str) -> Result<Vec<(String, i64)>, ApiError> {
    funds
        .iter()
        .map(|entry| {
            let amount = entry
                .amount
                .parse::<u64>()
                .map_err(|_| ApiError::field(field, format!("amount {:?} is not a positive integer", entry.amount)))?;
            let unit = if entry.unit == "lovelace" {
                String::new()
            } else {
                entry.unit.clone()
            };
            Ok((unit, amount as i64))
        })
        .collect()
}

/// The core API facade.
pub struct CoreApi {
    pool: DbPool,
    config: EngineConfig,
}

impl CoreApi {
    pub fn new(pool: DbPool, config: EngineConfig) -> Self {
        Self { pool, config }
    }

    // --- registry ---------------------------------------------------------

    pub async fn register_agent(
        &self,
        input: RegisterAgentInput,
    ) -> Envelope<RegistryView> {
        self.register_agent_inner(input).await.into()
    }

    async fn register_agent_inner(
        &self,
        input: RegisterAgentInput,
    ) -> Result<RegistryView, ApiError> {
        let pricing_type = PricingType::parse(&input.pricing_type)
            .ok_or_else(|| ApiError::field("pricingType", "must be Fixed or Free"))?;
        if pricing_type == PricingType::Fixed && input.pricing.is_empty() {
            return Err(ApiError::field("pricing", "Fixed pricing requires entries"));
        }
        // Validate amounts parse before persisting.
        parse_funds(&input.pricing, "pricing")?;

        let pool_input = input.clone();
        let request = run_serializable(&self.pool, move |conn| {
            let wallet = HotWallet::find_by_source_and_vkey(
                conn,
                &pool_input.payment_source_id,
                &pool_input.selling_wallet_vkey,
            )?;
            if wallet.role()? != WalletRole::Selling {
                anyhow::bail!("wallet {} is not a selling wallet", wallet.id);
            }
            let now = chrono::Utc::now().naive_utc();
            RegistryRequest::create(
                conn,
                NewRegistryRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    payment_source_id: pool_input.payment_source_id.clone(),
                    hot_wallet_id: wallet.id,
                    name: pool_input.name.clone(),
                    description: pool_input.description.clone(),
                    api_base_url: pool_input.api_base_url.clone(),
                    capability_name: pool_input.capability_name.clone(),
                    capability_version: pool_input.capability_version.clone(),
                    author_name: pool_input.author_name.clone(),
                    author_contact_email: pool_input.author_contact_email.clone(),
                    author_organization: pool_input.author_organization.clone(),
                    legal_privacy_policy: pool_input.legal_privacy_policy.clone(),
                    legal_terms: pool_input.legal_terms.clone(),
                    legal_other: pool_input.legal_other.clone(),
                    tags: serde_json::to_string(&pool_input.tags)?,
                    example_outputs: serde_json::to_string(&pool_input.example_outputs)?,
                    pricing_type: pool_input.pricing_type.clone(),
                    pricing: serde_json::to_string(&pool_input.pricing)?,
                    metadata_version: 1,
                    state: RegistrationState::RegistrationRequested.as_str().to_string(),
                    created_at: now,
                    updated_at: now,
                },
            )
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;

        info!("Registry request {} created", request.id);
        Ok(registry_view(&request))
    }

    pub async fn request_deregistration(&self, request_id: &str) -> Envelope<RegistryView> {
        let request_id = request_id.to_string();
        let result = run_serializable(&self.pool, move |conn| {
            let request = RegistryRequest::find_by_id(conn, &request_id)?;
            if request.state()? != RegistrationState::RegistrationConfirmed {
                anyhow::bail!(
                    "deregistration requires RegistrationConfirmed, found {}",
                    request.state
                );
            }
            RegistryRequest::set_state(
                conn,
                &request_id,
                RegistrationState::DeregistrationRequested,
                None,
            )?;
            RegistryRequest::find_by_id(conn, &request_id)
        })
        .await
        .map(|request| registry_view(&request))
        .map_err(|err| ApiError::message(format!("{err:#}")));
        result.into()
    }

    pub async fn delete_agent_registration(&self, request_id: &str) -> Envelope<RegistryView> {
        let request_id = request_id.to_string();
        let result = run_serializable(&self.pool, move |conn| {
            let request = RegistryRequest::find_by_id(conn, &request_id)?;
            if !request.state()?.is_deletable() {
                anyhow::bail!(
                    "deletion requires RegistrationFailed or DeregistrationConfirmed, found {}",
                    request.state
                );
            }
            RegistryRequest::delete(conn, &request_id)?;
            Ok(request)
        })
        .await
        .map(|request| registry_view(&request))
        .map_err(|err| ApiError::message(format!("{err:#}")));
        result.into()
    }

    // --- payments ---------------------------------------------------------

    pub async fn create_payment(&self, input: CreatePaymentInput) -> Envelope<PaymentView> {
        self.create_payment_inner(input).await.into()
    }

    async fn create_payment_inner(
        &self,
        input: CreatePaymentInput,
    ) -> Result<PaymentView, ApiError> {
        let network = Network::parse(&input.network)
            .ok_or_else(|| ApiError::field("network", "must be Mainnet or Preprod"))?;
        validate_purchaser_id(&input.identifier_from_purchaser)?;
        validate_escrow_fields(
            &input.input_hash,
            input.pay_by_time,
            input.submit_result_time,
            input.unlock_time,
            input.external_dispute_unlock_time,
            input.collateral_return_lovelace,
            self.config.min_collateral_lovelace,
        )
        .map_err(|err| ApiError::message(format!("{err:#}")))?;

        // Buyer-authored handle: 20 random bytes hex, purchaser id suffixed.
        let mut random = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut random);
        let blockchain_identifier =
            format!("{}{}", hex::encode(random), input.identifier_from_purchaser);

        let explicit_funds = input
            .requested_funds
            .as_ref()
            .map(|funds| parse_funds(funds, "requestedFunds"))
            .transpose()?;

        let pool_input = input.clone();
        let identifier = blockchain_identifier.clone();
        let request = run_serializable(&self.pool, move |conn| {
            let registry = RegistryRequest::find_by_agent_identifier(
                conn,
                &pool_input.agent_identifier,
            )?
            .ok_or_else(|| anyhow::anyhow!("unknown agent identifier"))?;
            let source = PaymentSource::find_by_id(conn, &registry.payment_source_id)?;
            if source.network()? != network {
                anyhow::bail!("agent is registered on {}", source.network);
            }
            let requested = match explicit_funds {
                Some(funds) => funds,
                None => registry
                    .pricing_entries()?
                    .into_iter()
                    .map(|(unit, amount)| (unit, amount as i64))
                    .collect(),
            };
            if requested.is_empty() {
                anyhow::bail!("no requested funds and agent has no fixed pricing");
            }
            let now = chrono::Utc::now().naive_utc();
            let request = PaymentRequest::create(
                conn,
                NewPaymentRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    payment_source_id: source.id.clone(),
                    blockchain_identifier: identifier.clone(),
                    input_hash: pool_input.input_hash.clone(),
                    result_hash: String::new(),
                    pay_by_time: pool_input.pay_by_time,
                    submit_result_time: pool_input.submit_result_time,
                    unlock_time: pool_input.unlock_time,
                    external_dispute_unlock_time: pool_input.external_dispute_unlock_time,
                    buyer_cooldown_time: 0,
                    seller_cooldown_time: 0,
                    collateral_return_lovelace: pool_input.collateral_return_lovelace,
                    requested_action: PaymentAction::WaitingForExternalAction.as_str().to_string(),
                    hot_wallet_id: registry.hot_wallet_id.clone(),
                    metadata: pool_input.metadata.clone(),
                    created_at: now,
                    updated_at: now,
                },
            )?;
            RequestAmount::insert_all(
                conn,
                AmountOwner::Payment(&request.id),
                AmountKind::Requested,
                &requested,
            )?;
            Ok(request)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;

        info!("Payment request {} created", request.id);
        self.payment_view(&request, false).await
    }

    pub async fn create_purchase(&self, input: CreatePurchaseInput) -> Envelope<PaymentView> {
        self.create_purchase_inner(input).await.into()
    }

    async fn create_purchase_inner(
        &self,
        input: CreatePurchaseInput,
    ) -> Result<PaymentView, ApiError> {
        let network = Network::parse(&input.network)
            .ok_or_else(|| ApiError::field("network", "must be Mainnet or Preprod"))?;
        validate_purchaser_id(&input.identifier_from_purchaser)?;
        if !input
            .blockchain_identifier
            .ends_with(&input.identifier_from_purchaser)
        {
            return Err(ApiError::field(
                "blockchainIdentifier",
                "must end with identifierFromPurchaser",
            ));
        }
        if !is_lower_hex(&input.blockchain_identifier) {
            return Err(ApiError::field(
                "blockchainIdentifier",
                "must be lowercase hex",
            ));
        }
        validate_escrow_fields(
            &input.input_hash,
            input.pay_by_time,
            input.submit_result_time,
            input.unlock_time,
            input.external_dispute_unlock_time,
            input.collateral_return_lovelace,
            self.config.min_collateral_lovelace,
        )
        .map_err(|err| ApiError::message(format!("{err:#}")))?;

        let explicit_funds = input
            .requested_funds
            .as_ref()
            .map(|funds| parse_funds(funds, "requestedFunds"))
            .transpose()?;

        let pool_input = input.clone();
        let request = run_serializable(&self.pool, move |conn| {
            // The purchase must land on a source of the right network that
            // has a purchasing wallet.
            let sources = PaymentSource::find_active(conn)?;
            let source = sources
                .into_iter()
                .find(|source| source.network == network.as_str())
                .ok_or_else(|| anyhow::anyhow!("no payment source on {}", network))?;
            let purchasing = HotWallet::find_by_source_and_role(
                conn,
                &source.id,
                WalletRole::Purchasing,
            )?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no purchasing wallet configured"))?;

            let seller_address = match &pool_input.seller_address {
                Some(address) => address.clone(),
                None => {
                    let registry = RegistryRequest::find_by_agent_identifier(
                        conn,
                        &pool_input.agent_identifier,
                    )?
                    .ok_or_else(|| {
                        anyhow::anyhow!("sellerAddress required for foreign agents")
                    })?;
                    HotWallet::find_by_id(conn, &registry.hot_wallet_id)?.address
                }
            };
            let seller = WalletBase::find_or_create(
                conn,
                &source.id,
                &pool_input.seller_vkey,
                &seller_address,
            )?;

            let requested = explicit_funds
                .ok_or_else(|| anyhow::anyhow!("requestedFunds is required"))?;
            let now = chrono::Utc::now().naive_utc();
            let request = PurchaseRequest::create(
                conn,
                NewPurchaseRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    payment_source_id: source.id.clone(),
                    blockchain_identifier: pool_input.blockchain_identifier.clone(),
                    input_hash: pool_input.input_hash.clone(),
                    result_hash: String::new(),
                    pay_by_time: pool_input.pay_by_time,
                    submit_result_time: pool_input.submit_result_time,
                    unlock_time: pool_input.unlock_time,
                    external_dispute_unlock_time: pool_input.external_dispute_unlock_time,
                    buyer_cooldown_time: 0,
                    seller_cooldown_time: 0,
                    collateral_return_lovelace: pool_input.collateral_return_lovelace,
                    requested_action: PurchasingAction::FundsLockingRequested
                        .as_str()
                        .to_string(),
                    hot_wallet_id: purchasing.id,
                    seller_wallet_id: seller.id,
                    metadata: pool_input.metadata.clone(),
                    created_at: now,
                    updated_at: now,
                },
            )?;
            RequestAmount::insert_all(
                conn,
                AmountOwner::Purchase(&request.id),
                AmountKind::Requested,
                &requested,
            )?;
            Ok(request)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;

        info!("Purchase request {} created", request.id);
        self.purchase_view(&request, false).await
    }

    // --- queued actions ---------------------------------------------------

    pub async fn submit_result(
        &self,
        network: &str,
        blockchain_identifier: &str,
        submit_result_hash: &str,
    ) -> Envelope<PaymentView> {
        let result = self
            .submit_result_inner(network, blockchain_identifier, submit_result_hash)
            .await;
        result.into()
    }

    async fn submit_result_inner(
        &self,
        network: &str,
        blockchain_identifier: &str,
        submit_result_hash: &str,
    ) -> Result<PaymentView, ApiError> {
        Network::parse(network)
            .ok_or_else(|| ApiError::field("network", "must be Mainnet or Preprod"))?;
        if !is_lower_hex(submit_result_hash) {
            return Err(ApiError::field("submitResultHash", "must be lowercase hex"));
        }
        let identifier = blockchain_identifier.to_string();
        let result_hash = submit_result_hash.to_string();
        let request = run_serializable(&self.pool, move |conn| {
            let request = find_payment_by_identifier(conn, &identifier)?;
            let state = request.state()?;
            if !matches!(
                state,
                Some(OnChainState::FundsLocked)
                    | Some(OnChainState::RefundRequested)
                    | Some(OnChainState::Disputed)
            ) {
                anyhow::bail!("result submission requires locked funds, state is {:?}", state);
            }
            PaymentRequest::set_result_hash(conn, &request.id, &result_hash)?;
            PaymentRequest::set_action(
                conn,
                &request.id,
                PaymentAction::SubmitResultRequested,
                None,
                None,
            )?;
            PaymentRequest::find_by_id(conn, &request.id)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;
        self.payment_view(&request, false).await
    }

    pub async fn request_refund(&self, blockchain_identifier: &str) -> Envelope<PaymentView> {
        self.queue_purchase_action(
            blockchain_identifier,
            &[OnChainState::FundsLocked, OnChainState::ResultSubmitted],
            "refund request requires FundsLocked or ResultSubmitted",
        )
        .await
        .into()
    }

    pub async fn cancel_refund_request(
        &self,
        blockchain_identifier: &str,
    ) -> Envelope<PaymentView> {
        self.queue_purchase_action(
            blockchain_identifier,
            &[OnChainState::RefundRequested, OnChainState::Disputed],
            "cancel requires RefundRequested or Disputed",
        )
        .await
        .into()
    }

    async fn queue_purchase_action(
        &self,
        blockchain_identifier: &str,
        allowed: &[OnChainState],
        requirement: &str,
    ) -> Result<PaymentView, ApiError> {
        let identifier = blockchain_identifier.to_string();
        let allowed = allowed.to_vec();
        let requirement = requirement.to_string();
        let request = run_serializable(&self.pool, move |conn| {
            let request = find_purchase_by_identifier(conn, &identifier)?;
            let state = request.state()?;
            if !state.map(|s| allowed.contains(&s)).unwrap_or(false) {
                anyhow::bail!("{requirement}, state is {:?}", state);
            }
            PurchaseRequest::set_action(
                conn,
                &request.id,
                PurchasingAction::SetRefundRequestedRequested,
                None,
                None,
            )?;
            PurchaseRequest::find_by_id(conn, &request.id)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;
        self.purchase_view(&request, false).await
    }

    pub async fn authorize_refund(&self, blockchain_identifier: &str) -> Envelope<PaymentView> {
        let identifier = blockchain_identifier.to_string();
        let result = run_serializable(&self.pool, move |conn| {
            let request = find_payment_by_identifier(conn, &identifier)?;
            let state = request.state()?;
            if !matches!(
                state,
                Some(OnChainState::RefundRequested) | Some(OnChainState::Disputed)
            ) {
                anyhow::bail!(
                    "refund authorization requires RefundRequested or Disputed, state is {:?}",
                    state
                );
            }
            PaymentRequest::set_action(
                conn,
                &request.id,
                PaymentAction::AuthorizeRefundRequested,
                None,
                None,
            )?;
            PaymentRequest::find_by_id(conn, &request.id)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")));
        match result {
            Ok(request) => self.payment_view(&request, false).await.into(),
            Err(error) => Envelope::Error { error },
        }
    }

    // --- queries ----------------------------------------------------------

    pub async fn query_payments(
        &self,
        payment_source_id: &str,
        cursor_id: Option<&str>,
        include_history: bool,
    ) -> Envelope<Page<PaymentView>> {
        let source_id = payment_source_id.to_string();
        let cursor = cursor_id.map(str::to_string);
        let rows = run(&self.pool, move |conn| {
            PaymentRequest::page(conn, &source_id, cursor.as_deref(), PAGE_SIZE)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")));
        match rows {
            Ok(rows) => {
                let mut items = Vec::with_capacity(rows.len());
                for row in &rows {
                    match self.payment_view(row, include_history).await {
                        Ok(view) => items.push(view),
                        Err(error) => return Envelope::Error { error },
                    }
                }
                let next_cursor =
                    (rows.len() as i64 == PAGE_SIZE).then(|| rows.last().unwrap().id.clone());
                Envelope::Success {
                    data: Page { items, next_cursor },
                }
            }
            Err(error) => Envelope::Error { error },
        }
    }

    pub async fn query_purchases(
        &self,
        payment_source_id: &str,
        cursor_id: Option<&str>,
        include_history: bool,
    ) -> Envelope<Page<PaymentView>> {
        let source_id = payment_source_id.to_string();
        let cursor = cursor_id.map(str::to_string);
        let rows = run(&self.pool, move |conn| {
            PurchaseRequest::page(conn, &source_id, cursor.as_deref(), PAGE_SIZE)
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")));
        match rows {
            Ok(rows) => {
                let mut items = Vec::with_capacity(rows.len());
                for row in &rows {
                    match self.purchase_view(row, include_history).await {
                        Ok(view) => items.push(view),
                        Err(error) => return Envelope::Error { error },
                    }
                }
                let next_cursor =
                    (rows.len() as i64 == PAGE_SIZE).then(|| rows.last().unwrap().id.clone());
                Envelope::Success {
                    data: Page { items, next_cursor },
                }
            }
            Err(error) => Envelope::Error { error },
        }
    }

    pub async fn query_registry(
        &self,
        payment_source_id: &str,
        cursor_id: Option<&str>,
    ) -> Envelope<Page<RegistryView>> {
        let source_id = payment_source_id.to_string();
        let cursor = cursor_id.map(str::to_string);
        let result = run(&self.pool, move |conn| {
            RegistryRequest::page(conn, &source_id, cursor.as_deref(), PAGE_SIZE)
        })
        .await
        .map(|rows| {
            let next_cursor =
                (rows.len() as i64 == PAGE_SIZE).then(|| rows.last().unwrap().id.clone());
            Page {
                items: rows.iter().map(registry_view).collect(),
                next_cursor,
            }
        })
        .map_err(|err| ApiError::message(format!("{err:#}")));
        result.into()
    }

    // --- view assembly ----------------------------------------------------

    async fn payment_view(
        &self,
        request: &PaymentRequest,
        include_history: bool,
    ) -> Result<PaymentView, ApiError> {
        let request_id = request.id.clone();
        let current_id = request.current_transaction_id.clone();
        let parts = run(&self.pool, move |conn| {
            let funds = RequestAmount::pairs_for(
                conn,
                AmountOwner::Payment(&request_id),
                AmountKind::Requested,
            )?;
            let current = current_id
                .as_deref()
                .map(|id| Transaction::find_by_id(conn, id))
                .transpose()?;
            let history = if include_history {
                Some(TransactionHistory::hashes_for(
                    conn,
                    HistoryOwner::Payment(&request_id),
                )?)
            } else {
                None
            };
            Ok((funds, current, history))
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;
        let (funds, current, history) = parts;
        Ok(assemble_view(request_view_fields(request), funds, current, history))
    }

    async fn purchase_view(
        &self,
        request: &PurchaseRequest,
        include_history: bool,
    ) -> Result<PaymentView, ApiError> {
        let request_id = request.id.clone();
        let current_id = request.current_transaction_id.clone();
        let parts = run(&self.pool, move |conn| {
            let funds = RequestAmount::pairs_for(
                conn,
                AmountOwner::Purchase(&request_id),
                AmountKind::Requested,
            )?;
            let current = current_id
                .as_deref()
                .map(|id| Transaction::find_by_id(conn, id))
                .transpose()?;
            let history = if include_history {
                Some(TransactionHistory::hashes_for(
                    conn,
                    HistoryOwner::Purchase(&request_id),
                )?)
            } else {
                None
            };
            Ok((funds, current, history))
        })
        .await
        .map_err(|err| ApiError::message(format!("{err:#}")))?;
        let (funds, current, history) = parts;
        Ok(assemble_view(purchase_view_fields(request), funds, current, history))
    }
}

// Shared field bundle for the two mirror views.
struct ViewFields {
    id: String,
    blockchain_identifier: String,
    input_hash: String,
    result_hash: String,
    pay_by_time: i64,
    submit_result_time: i64,
    unlock_time: i64,
    external_dispute_unlock_time: i64,
    on_chain_state: Option<String>,
    requested_action: String,
    error_type: Option<String>,
    error_note: Option<String>,
}

fn request_view_fields(request: &PaymentRequest) -> ViewFields {
    ViewFields {
        id: request.id.clone(),
        blockchain_identifier: request.blockchain_identifier.clone(),
        input_hash: request.input_hash.clone(),
        result_hash: request.result_hash.clone(),
        pay_by_time: request.pay_by_time,
        submit_result_time: request.submit_result_time,
        unlock_time: request.unlock_time,
        external_dispute_unlock_time: request.external_dispute_unlock_time,
        on_chain_state: request.on_chain_state.clone(),
        requested_action: request.requested_action.clone(),
        error_type: request.error_type.clone(),
        error_note: request.error_note.clone(),
    }
}

fn purchase_view_fields(request: &PurchaseRequest) -> ViewFields {
    ViewFields {
        id: request.id.clone(),
        blockchain_identifier: request.blockchain_identifier.clone(),
        input_hash: request.input_hash.clone(),
        result_hash: request.result_hash.clone(),
        pay_by_time: request.pay_by_time,
        submit_result_time: request.submit_result_time,
        unlock_time: request.unlock_time,
        external_dispute_unlock_time: request.external_dispute_unlock_time,
        on_chain_state: request.on_chain_state.clone(),
        requested_action: request.requested_action.clone(),
        error_type: request.error_type.clone(),
        error_note: request.error_note.clone(),
    }
}

fn assemble_view(
    fields: ViewFields,
    funds: Vec<(String, i64)>,
    current: Option<Transaction>,
    history: Option<Vec<String>>,
) -> PaymentView {
    PaymentView {
        id: fields.id,
        blockchain_identifier: fields.blockchain_identifier,
        input_hash: fields.input_hash,
        result_hash: fields.result_hash,
        pay_by_time: fields.pay_by_time,
        submit_result_time: fields.submit_result_time,
        unlock_time: fields.unlock_time,
        external_dispute_unlock_time: fields.external_dispute_unlock_time,
        on_chain_state: fields.on_chain_state,
        next_action: NextActionView {
            requested_action: fields.requested_action,
            error_type: fields.error_type,
            error_note: fields.error_note,
        },
        requested_funds: funds
            .into_iter()
            .map(|(unit, amount)| FundsView {
                unit: if unit.is_empty() { "lovelace".into() } else { unit },
                amount: amount.to_string(),
            })
            .collect(),
        current_transaction: current.map(|tx| TransactionView {
            id: tx.id,
            tx_hash: tx.tx_hash,
            status: tx.status,
        }),
        transaction_history: history,
    }
}

fn registry_view(request: &RegistryRequest) -> RegistryView {
    RegistryView {
        id: request.id.clone(),
        name: request.name.clone(),
        state: request.state.clone(),
        agent_identifier: request.agent_identifier.clone(),
        error: request.error.clone(),
    }
}

fn find_payment_by_identifier(
    conn: &mut diesel::SqliteConnection,
    blockchain_identifier: &str,
) -> Result<PaymentRequest> {
    let sources = PaymentSource::find_active(conn)?;
    for source in sources {
        if let Some(request) =
            PaymentRequest::find_by_identifier(conn, &source.id, blockchain_identifier)?
        {
            return Ok(request);
        }
    }
    anyhow::bail!("no payment request for identifier {blockchain_identifier}")
}

fn find_purchase_by_identifier(
    conn: &mut diesel::SqliteConnection,
    blockchain_identifier: &str,
) -> Result<PurchaseRequest> {
    let sources = PaymentSource::find_active(conn)?;
    for source in sources {
        if let Some(request) =
            PurchaseRequest::find_by_identifier(conn, &source.id, blockchain_identifier)?
        {
            return Ok(request);
        }
    }
    anyhow::bail!("no purchase request for identifier {blockchain_identifier}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_hash_is_canonical() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(input_hash_of(&a), input_hash_of(&b));
        assert_eq!(input_hash_of(&a).len(), 64);
    }

    #[test]
    fn test_empty_object_hash_matches_sha256_of_braces() {
        // sha256("{}")
        let hash = input_hash_of(&serde_json::json!({}));
        assert_eq!(
            hash,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_purchaser_id_validation() {
        assert!(validate_purchaser_id("0123456789abcdef0123").is_ok());
        assert!(validate_purchaser_id("0123456789abc").is_err()); // 13 chars
        assert!(validate_purchaser_id(&"a".repeat(27)).is_err());
        assert!(validate_purchaser_id("0123456789ABCDEF0123").is_err());
    }

    #[test]
    fn test_parse_funds_normalizes_lovelace_unit() {
        let funds = vec![FundsInput {
            unit: "lovelace".into(),
            amount: "1000000".into(),
        }];
        let parsed = parse_funds(&funds, "requestedFunds").unwrap();
        assert_eq!(parsed, vec![(String::new(), 1_000_000)]);
    }

    #[test]
    fn test_parse_funds_rejects_decimals() {
        let funds = vec![FundsInput {
            unit: "lovelace".into(),
            amount: "1.5".into(),
        }];
        assert!(parse_funds(&funds, "requestedFunds").is_err());
    }
}
