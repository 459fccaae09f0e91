//! State enumerations shared across the engine.
//!
//! Stored as their string form in the database, so every variant has a stable
//! `as_str`/`parse` pair. Parsing is strict: an unknown string in the store is
//! data corruption and surfaces as an error, never a silent default.

use serde::{Deserialize, Serialize};

use masumi_codec::SmartContractState;

/// Escrow state as reconstructed from chain observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnChainState {
    FundsLocked,
    ResultSubmitted,
    RefundRequested,
    Disputed,
    Withdrawn,
    RefundWithdrawn,
    DisputedWithdrawn,
    FundsOrDatumInvalid,
}

impl OnChainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnChainState::FundsLocked => "FundsLocked",
            OnChainState::ResultSubmitted => "ResultSubmitted",
            OnChainState::RefundRequested => "RefundRequested",
            OnChainState::Disputed => "Disputed",
            OnChainState::Withdrawn => "Withdrawn",
            OnChainState::RefundWithdrawn => "RefundWithdrawn",
            OnChainState::DisputedWithdrawn => "DisputedWithdrawn",
            OnChainState::FundsOrDatumInvalid => "FundsOrDatumInvalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "FundsLocked" => OnChainState::FundsLocked,
            "ResultSubmitted" => OnChainState::ResultSubmitted,
            "RefundRequested" => OnChainState::RefundRequested,
            "Disputed" => OnChainState::Disputed,
            "Withdrawn" => OnChainState::Withdrawn,
            "RefundWithdrawn" => OnChainState::RefundWithdrawn,
            "DisputedWithdrawn" => OnChainState::DisputedWithdrawn,
            "FundsOrDatumInvalid" => OnChainState::FundsOrDatumInvalid,
            _ => return None,
        })
    }

    /// True when the escrow has been fully spent and no further transition
    /// can touch it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OnChainState::Withdrawn
                | OnChainState::RefundWithdrawn
                | OnChainState::DisputedWithdrawn
        )
    }

    /// Map a datum-level contract state to the observed on-chain state.
    pub fn from_contract_state(state: SmartContractState) -> Self {
        match state {
            SmartContractState::FundsLocked => OnChainState::FundsLocked,
            SmartContractState::ResultSubmitted => OnChainState::ResultSubmitted,
            SmartContractState::RefundRequested => OnChainState::RefundRequested,
            SmartContractState::Disputed => OnChainState::Disputed,
        }
    }
}

/// Seller-side work queue states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentAction {
    None,
    WaitingForExternalAction,
    WaitingForManualAction,
    WithdrawRequested,
    WithdrawInitiated,
    SubmitResultRequested,
    SubmitResultInitiated,
    AuthorizeRefundRequested,
    AuthorizeRefundInitiated,
}

impl PaymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentAction::None => "None",
            PaymentAction::WaitingForExternalAction => "WaitingForExternalAction",
            PaymentAction::WaitingForManualAction => "WaitingForManualAction",
            PaymentAction::WithdrawRequested => "WithdrawRequested",
            PaymentAction::WithdrawInitiated => "WithdrawInitiated",
            PaymentAction::SubmitResultRequested => "SubmitResultRequested",
            PaymentAction::SubmitResultInitiated => "SubmitResultInitiated",
            PaymentAction::AuthorizeRefundRequested => "AuthorizeRefundRequested",
            PaymentAction::AuthorizeRefundInitiated => "AuthorizeRefundInitiated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "None" => PaymentAction::None,
            "WaitingForExternalAction" => PaymentAction::WaitingForExternalAction,
            "WaitingForManualAction" => PaymentAction::WaitingForManualAction,
            "WithdrawRequested" => PaymentAction::WithdrawRequested,
            "WithdrawInitiated" => PaymentAction::WithdrawInitiated,
            "SubmitResultRequested" => PaymentAction::SubmitResultRequested,
            "SubmitResultInitiated" => PaymentAction::SubmitResultInitiated,
            "AuthorizeRefundRequested" => PaymentAction::AuthorizeRefundRequested,
            "AuthorizeRefundInitiated" => PaymentAction::AuthorizeRefundInitiated,
            _ => return None,
        })
    }

    /// In-flight transaction authored by a dispatcher for this entity.
    pub fn is_initiated(&self) -> bool {
        matches!(
            self,
            PaymentAction::WithdrawInitiated
                | PaymentAction::SubmitResultInitiated
                | PaymentAction::AuthorizeRefundInitiated
        )
    }
}

/// Buyer-side work queue states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurchasingAction {
    None,
    FundsLockingRequested,
    FundsLockingInitiated,
    WaitingForExternalAction,
    WaitingForManualAction,
    SetRefundRequestedRequested,
    SetRefundRequestedInitiated,
    WithdrawRefundRequested,
    WithdrawRefundInitiated,
}

impl PurchasingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchasingAction::None => "None",
            PurchasingAction::FundsLockingRequested => "FundsLockingRequested",
            PurchasingAction::FundsLockingInitiated => "FundsLockingInitiated",
            PurchasingAction::WaitingForExternalAction => "WaitingForExternalAction",
            PurchasingAction::WaitingForManualAction => "WaitingForManualAction",
            PurchasingAction::SetRefundRequestedRequested => "SetRefundRequestedRequested",
            PurchasingAction::SetRefundRequestedInitiated => "SetRefundRequestedInitiated",
            PurchasingAction::WithdrawRefundRequested => "WithdrawRefundRequested",
            PurchasingAction::WithdrawRefundInitiated => "WithdrawRefundInitiated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "None" => PurchasingAction::None,
            "FundsLockingRequested" => PurchasingAction::FundsLockingRequested,
            "FundsLockingInitiated" => PurchasingAction::FundsLockingInitiated,
            "WaitingForExternalAction" => PurchasingAction::WaitingForExternalAction,
            "WaitingForManualAction" => PurchasingAction::WaitingForManualAction,
            "SetRefundRequestedRequested" => PurchasingAction::SetRefundRequestedRequested,
            "SetRefundRequestedInitiated" => PurchasingAction::SetRefundRequestedInitiated,
            "WithdrawRefundRequested" => PurchasingAction::WithdrawRefundRequested,
            "WithdrawRefundInitiated" => PurchasingAction::WithdrawRefundInitiated,
            _ => return None,
        })
    }

    pub fn is_initiated(&self) -> bool {
        matches!(
            self,
            PurchasingAction::FundsLockingInitiated
                | PurchasingAction::SetRefundRequestedInitiated
                | PurchasingAction::WithdrawRefundInitiated
        )
    }
}

/// Lifecycle of an agent registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    RegistrationRequested,
    RegistrationInitiated,
    RegistrationConfirmed,
    RegistrationFailed,
    DeregistrationRequested,
    DeregistrationInitiated,
    DeregistrationConfirmed,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::RegistrationRequested => "RegistrationRequested",
            RegistrationState::RegistrationInitiated => "RegistrationInitiated",
            RegistrationState::RegistrationConfirmed => "RegistrationConfirmed",
            RegistrationState::RegistrationFailed => "RegistrationFailed",
            RegistrationState::DeregistrationRequested => "DeregistrationRequested",
            RegistrationState::DeregistrationInitiated => "DeregistrationInitiated",
            RegistrationState::DeregistrationConfirmed => "DeregistrationConfirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RegistrationRequested" => RegistrationState::RegistrationRequested,
            "RegistrationInitiated" => RegistrationState::RegistrationInitiated,
            "RegistrationConfirmed" => RegistrationState::RegistrationConfirmed,
            "RegistrationFailed" => RegistrationState::RegistrationFailed,
            "DeregistrationRequested" => RegistrationState::DeregistrationRequested,
            "DeregistrationInitiated" => RegistrationState::DeregistrationInitiated,
            "DeregistrationConfirmed" => RegistrationState::DeregistrationConfirmed,
            _ => return None,
        })
    }

    /// States in which the registry entry may be deleted.
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            RegistrationState::RegistrationFailed | RegistrationState::DeregistrationConfirmed
        )
    }
}

/// Lifecycle of an authored transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    RolledBack,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "Pending",
            TxStatus::Confirmed => "Confirmed",
            TxStatus::RolledBack => "RolledBack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Pending" => TxStatus::Pending,
            "Confirmed" => TxStatus::Confirmed,
            "RolledBack" => TxStatus::RolledBack,
            _ => return None,
        })
    }
}

/// Role of a hot wallet within a payment source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletRole {
    Selling,
    Purchasing,
    FeeReceiver,
}

impl WalletRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletRole::Selling => "Selling",
            WalletRole::Purchasing => "Purchasing",
            WalletRole::FeeReceiver => "FeeReceiver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Selling" => WalletRole::Selling,
            "Purchasing" => WalletRole::Purchasing,
            "FeeReceiver" => WalletRole::FeeReceiver,
            _ => return None,
        })
    }
}

/// Classification of stored amount rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmountKind {
    Requested,
    Paid,
    WithdrawnSeller,
    WithdrawnBuyer,
}

impl AmountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmountKind::Requested => "Requested",
            AmountKind::Paid => "Paid",
            AmountKind::WithdrawnSeller => "WithdrawnSeller",
            AmountKind::WithdrawnBuyer => "WithdrawnBuyer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Requested" => AmountKind::Requested,
            "Paid" => AmountKind::Paid,
            "WithdrawnSeller" => AmountKind::WithdrawnSeller,
            "WithdrawnBuyer" => AmountKind::WithdrawnBuyer,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_chain_state_roundtrip() {
        for s in [
            OnChainState::FundsLocked,
            OnChainState::ResultSubmitted,
            OnChainState::RefundRequested,
            OnChainState::Disputed,
            OnChainState::Withdrawn,
            OnChainState::RefundWithdrawn,
            OnChainState::DisputedWithdrawn,
            OnChainState::FundsOrDatumInvalid,
        ] {
            assert_eq!(OnChainState::parse(s.as_str()), Some(s));
        }
        assert_eq!(OnChainState::parse("Completed"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OnChainState::Withdrawn.is_terminal());
        assert!(!OnChainState::Disputed.is_terminal());
    }

    #[test]
    fn test_initiated_classification() {
        assert!(PaymentAction::WithdrawInitiated.is_initiated());
        assert!(!PaymentAction::WithdrawRequested.is_initiated());
        assert!(PurchasingAction::FundsLockingInitiated.is_initiated());
        assert!(!PurchasingAction::WaitingForExternalAction.is_initiated());
    }

    #[test]
    fn test_registration_deletable_states() {
        assert!(RegistrationState::RegistrationFailed.is_deletable());
        assert!(RegistrationState::DeregistrationConfirmed.is_deletable());
        assert!(!RegistrationState::RegistrationConfirmed.is_deletable());
    }
}
