//! Shared database and escrow fixtures for the offline engine tests.

use std::sync::Arc;

use server::chain::ChainAdapter;
use server::config::EngineConfig;
use server::db::{bootstrap, create_pool, DbPool};
use server::models::hot_wallet::{HotWallet, NewHotWallet};
use server::models::payment_request::{NewPaymentRequest, PaymentRequest};
use server::models::payment_source::{NewPaymentSource, PaymentSource};
use server::models::purchase_request::{NewPurchaseRequest, PurchaseRequest};
use server::models::request_amount::{AmountOwner, RequestAmount};
use server::models::state::{AmountKind, PaymentAction, PurchasingAction, WalletRole};
use server::models::wallet_base::WalletBase;
use server::services::SyncService;

use masumi_codec::{Address, EscrowDatum, Network, SmartContractState};

/// Base timestamp for all scenarios: some fixed recent instant, epoch ms.
pub const T0_MS: i64 = 1_700_000_000_000;

pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Deterministic key hashes for the three parties.
pub const BUYER_HASH: [u8; 28] = [0x21; 28];
pub const SELLER_HASH: [u8; 28] = [0x31; 28];
pub const SCRIPT_HASH: [u8; 28] = [0x41; 28];

pub fn buyer_address() -> String {
    Address::from_key_hash(BUYER_HASH, None).to_bech32(Network::Preprod)
}

pub fn seller_address() -> String {
    Address::from_key_hash(SELLER_HASH, None).to_bech32(Network::Preprod)
}

pub fn script_address() -> String {
    Address {
        payment: masumi_codec::Credential::Script(SCRIPT_HASH),
        stake: None,
    }
    .to_bech32(Network::Preprod)
}

pub struct Fixture {
    pub pool: DbPool,
    pub source: PaymentSource,
    pub selling_wallet: HotWallet,
    pub purchasing_wallet: HotWallet,
    pub seller_base: WalletBase,
    _db_file: tempfile::NamedTempFile,
}

/// Engine config tuned for tests: threshold 1, small history depth.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        block_confirmations_threshold: 1,
        ..EngineConfig::default()
    }
}

pub fn sync_service(fixture: &Fixture, chain: Arc<dyn ChainAdapter>) -> SyncService {
    SyncService::new(fixture.pool.clone(), chain, test_config())
}

impl Fixture {
    pub fn new() -> Self {
        let db_file = tempfile::NamedTempFile::new().expect("temp db");
        let pool = create_pool(db_file.path().to_str().unwrap()).expect("pool");
        let mut conn = pool.get().unwrap();
        bootstrap::initialize_schema(&mut conn).unwrap();

        let admins: Vec<String> = vec![
            Address::from_key_hash([0x51; 28], None).to_bech32(Network::Preprod),
            Address::from_key_hash([0x52; 28], None).to_bech32(Network::Preprod),
            Address::from_key_hash([0x53; 28], None).to_bech32(Network::Preprod),
        ];
        let source = PaymentSource::create(
            &mut conn,
            NewPaymentSource::new(
                Network::Preprod,
                &script_address(),
                &"ab".repeat(28),
                "",
                50,
                &admins,
                "test-key",
            )
            .unwrap(),
        )
        .unwrap();

        // The purchasing hot wallet is the buyer of the escrow; the selling
        // hot wallet is the seller.
        let purchasing_wallet = HotWallet::create(
            &mut conn,
            NewHotWallet::new(
                &source.id,
                WalletRole::Purchasing,
                &hex::encode(BUYER_HASH),
                &buyer_address(),
                vec![7u8; 32],
            ),
        )
        .unwrap();
        let selling_wallet = HotWallet::create(
            &mut conn,
            NewHotWallet::new(
                &source.id,
                WalletRole::Selling,
                &hex::encode(SELLER_HASH),
                &seller_address(),
                vec![8u8; 32],
            ),
        )
        .unwrap();
        let seller_base =
            WalletBase::find_or_create(&mut conn, &source.id, &hex::encode(SELLER_HASH), &seller_address())
                .unwrap();

        Fixture {
            pool,
            source,
            selling_wallet,
            purchasing_wallet,
            seller_base,
            _db_file: db_file,
        }
    }

    pub fn reload_source(&mut self) {
        let mut conn = self.pool.get().unwrap();
        self.source = PaymentSource::find_by_id(&mut conn, &self.source.id).unwrap();
    }

    /// A purchase request with no payment mirror, as a buyer-only
    /// coordinator would hold.
    pub fn seed_purchase_only(&self, identifier: &str) -> PurchaseRequest {
        let mut conn = self.pool.get().unwrap();
        let now = chrono::Utc::now().naive_utc();
        let purchase = PurchaseRequest::create(
            &mut conn,
            NewPurchaseRequest {
                id: uuid::Uuid::new_v4().to_string(),
                payment_source_id: self.source.id.clone(),
                blockchain_identifier: identifier.to_string(),
                input_hash: "e3".repeat(32),
                result_hash: String::new(),
                pay_by_time: T0_MS + 11 * HOUR_MS,
                submit_result_time: T0_MS + 12 * HOUR_MS,
                unlock_time: T0_MS + 18 * HOUR_MS,
                external_dispute_unlock_time: T0_MS + 24 * HOUR_MS,
                buyer_cooldown_time: 0,
                seller_cooldown_time: 0,
                collateral_return_lovelace: 0,
                requested_action: PurchasingAction::FundsLockingRequested.as_str().to_string(),
                hot_wallet_id: self.purchasing_wallet.id.clone(),
                seller_wallet_id: self.seller_base.id.clone(),
                metadata: None,
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
        RequestAmount::insert_all(
            &mut conn,
            AmountOwner::Purchase(&purchase.id),
            AmountKind::Requested,
            &[(String::new(), 2_000_000)],
        )
        .unwrap();
        purchase
    }

    /// A purchase request with its mirror payment request, sharing the
    /// standard escrow terms.
    pub fn seed_mirrors(&self, identifier: &str) -> (PurchaseRequest, PaymentRequest) {
        let mut conn = self.pool.get().unwrap();
        let now = chrono::Utc::now().naive_utc();
        let purchase = PurchaseRequest::create(
            &mut conn,
            NewPurchaseRequest {
                id: uuid::Uuid::new_v4().to_string(),
                payment_source_id: self.source.id.clone(),
                blockchain_identifier: identifier.to_string(),
                input_hash: "e3".repeat(32),
                result_hash: String::new(),
                pay_by_time: T0_MS + 11 * HOUR_MS,
                submit_result_time: T0_MS + 12 * HOUR_MS,
                unlock_time: T0_MS + 18 * HOUR_MS,
                external_dispute_unlock_time: T0_MS + 24 * HOUR_MS,
                buyer_cooldown_time: 0,
                seller_cooldown_time: 0,
                collateral_return_lovelace: 0,
                requested_action: PurchasingAction::FundsLockingRequested.as_str().to_string(),
                hot_wallet_id: self.purchasing_wallet.id.clone(),
                seller_wallet_id: self.seller_base.id.clone(),
                metadata: None,
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
        RequestAmount::insert_all(
            &mut conn,
            AmountOwner::Purchase(&purchase.id),
            AmountKind::Requested,
            &[(String::new(), 2_000_000)],
        )
        .unwrap();

        let payment = PaymentRequest::create(
            &mut conn,
            NewPaymentRequest {
                id: uuid::Uuid::new_v4().to_string(),
                payment_source_id: self.source.id.clone(),
                blockchain_identifier: identifier.to_string(),
                input_hash: "e3".repeat(32),
                result_hash: String::new(),
                pay_by_time: T0_MS + 11 * HOUR_MS,
                submit_result_time: T0_MS + 12 * HOUR_MS,
                unlock_time: T0_MS + 18 * HOUR_MS,
                external_dispute_unlock_time: T0_MS + 24 * HOUR_MS,
                buyer_cooldown_time: 0,
                seller_cooldown_time: 0,
                collateral_return_lovelace: 0,
                requested_action: PaymentAction::WaitingForExternalAction.as_str().to_string(),
                hot_wallet_id: self.selling_wallet.id.clone(),
                metadata: None,
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
        RequestAmount::insert_all(
            &mut conn,
            AmountOwner::Payment(&payment.id),
            AmountKind::Requested,
            &[(String::new(), 2_000_000)],
        )
        .unwrap();

        (purchase, payment)
    }
}

/// The datum of a freshly locked escrow matching `seed_mirrors`.
pub fn locked_datum(identifier: &str) -> EscrowDatum {
    EscrowDatum {
        buyer_vkey: BUYER_HASH,
        buyer_address: Address::from_key_hash(BUYER_HASH, None),
        seller_vkey: SELLER_HASH,
        seller_address: Address::from_key_hash(SELLER_HASH, None),
        blockchain_identifier: identifier.to_string(),
        result_hash: String::new(),
        result_time: (T0_MS + 12 * HOUR_MS) as u64,
        unlock_time: (T0_MS + 18 * HOUR_MS) as u64,
        external_dispute_unlock_time: (T0_MS + 24 * HOUR_MS) as u64,
        pay_by_time: (T0_MS + 11 * HOUR_MS) as u64,
        buyer_cooldown_time: 0,
        seller_cooldown_time: 0,
        state: SmartContractState::FundsLocked,
        input_hash: "e3".repeat(32),
        collateral_return_lovelace: 0,
    }
}
