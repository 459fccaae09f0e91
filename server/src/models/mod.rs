//! Database models. Column order in every Queryable struct must match
//! schema.rs exactly.

pub mod hot_wallet;
pub mod payment_request;
pub mod payment_source;
pub mod purchase_request;
pub mod registry_request;
pub mod request_amount;
pub mod source_identifier;
pub mod state;
pub mod transaction;
pub mod wallet_base;

pub use hot_wallet::{HotWallet, NewHotWallet};
pub use payment_request::{validate_escrow_fields, NewPaymentRequest, PaymentRequest};
pub use payment_source::{NewPaymentSource, PaymentSource};
pub use purchase_request::{NewPurchaseRequest, PurchaseRequest};
pub use registry_request::{NewRegistryRequest, PricingType, RegistryRequest};
pub use request_amount::{AmountOwner, NewRequestAmount, RequestAmount};
pub use source_identifier::{NewSourceIdentifier, SourceIdentifier};
pub use state::{
    AmountKind, OnChainState, PaymentAction, PurchasingAction, RegistrationState, TxStatus,
    WalletRole,
};
pub use transaction::{
    HistoryOwner, NewTransaction, NewTransactionHistory, Transaction, TransactionHistory,
};
pub use wallet_base::{NewWalletBase, WalletBase};
