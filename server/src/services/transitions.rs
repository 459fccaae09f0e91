//! The deterministic transition tables.
//!
//! Two pure mappings drive the whole engine: the redeemer table (what a
//! spend did to the escrow) and the next-action tables (what each mirror
//! should do about it). Keeping them as plain functions makes every
//! property in the test suite a direct table check.

use crate::error::EntityErrorType;
use crate::models::state::{OnChainState, PaymentAction, PurchasingAction};
use masumi_codec::{EscrowDatum, Redeemer, SmartContractState};

/// Outcome of the next-action tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome<A> {
    pub action: A,
    pub error_type: Option<EntityErrorType>,
    pub error_note: Option<String>,
}

impl<A> ActionOutcome<A> {
    fn ok(action: A) -> Self {
        ActionOutcome {
            action,
            error_type: None,
            error_note: None,
        }
    }

    fn manual(action: A, error_type: EntityErrorType, note: impl Into<String>) -> Self {
        ActionOutcome {
            action,
            error_type: Some(error_type),
            error_note: Some(note.into()),
        }
    }
}

/// Map `(redeemer, new_datum, amount_ok)` to the resulting on-chain state.
pub fn state_after_redeemer(
    redeemer: Redeemer,
    new_datum: Option<&EscrowDatum>,
    amount_ok: bool,
) -> OnChainState {
    let result_hash_set = new_datum.map(|d| !d.result_hash.is_empty()).unwrap_or(false);
    match redeemer {
        Redeemer::Withdraw => OnChainState::Withdrawn,
        Redeemer::RequestRefund => {
            if result_hash_set {
                OnChainState::Disputed
            } else {
                OnChainState::RefundRequested
            }
        }
        Redeemer::CancelRefundRequest => {
            if result_hash_set {
                OnChainState::ResultSubmitted
            } else if amount_ok {
                OnChainState::FundsLocked
            } else {
                OnChainState::FundsOrDatumInvalid
            }
        }
        Redeemer::WithdrawRefund => OnChainState::RefundWithdrawn,
        Redeemer::WithdrawDisputed => OnChainState::DisputedWithdrawn,
        Redeemer::SubmitResult => {
            let disputed = new_datum
                .map(|d| {
                    matches!(
                        d.state,
                        SmartContractState::RefundRequested | SmartContractState::Disputed
                    )
                })
                .unwrap_or(false);
            if disputed {
                OnChainState::Disputed
            } else {
                OnChainState::ResultSubmitted
            }
        }
        Redeemer::AllowRefund => OnChainState::RefundRequested,
    }
}

/// States an in-flight payment-side transaction is allowed to land in.
fn payment_expected_states(action: PaymentAction) -> &'static [OnChainState] {
    match action {
        PaymentAction::SubmitResultInitiated => {
            &[OnChainState::ResultSubmitted, OnChainState::Disputed]
        }
        PaymentAction::WithdrawInitiated => &[OnChainState::Withdrawn],
        PaymentAction::AuthorizeRefundInitiated => &[OnChainState::RefundRequested],
        _ => &[],
    }
}

fn purchasing_expected_states(action: PurchasingAction) -> &'static [OnChainState] {
    match action {
        PurchasingAction::FundsLockingInitiated => &[OnChainState::FundsLocked],
        // Covers both directions of the refund toggle: requesting lands in
        // RefundRequested/Disputed, cancelling in FundsLocked/ResultSubmitted.
        PurchasingAction::SetRefundRequestedInitiated => &[
            OnChainState::RefundRequested,
            OnChainState::Disputed,
            OnChainState::FundsLocked,
            OnChainState::ResultSubmitted,
        ],
        PurchasingAction::WithdrawRefundInitiated => &[OnChainState::RefundWithdrawn],
        _ => &[],
    }
}

/// Next action for the seller mirror after observing `new_state`.
pub fn next_payment_action(
    current: PaymentAction,
    new_state: OnChainState,
) -> ActionOutcome<PaymentAction> {
    // Once parked for an operator, only an operator moves it.
    if current == PaymentAction::WaitingForManualAction {
        return ActionOutcome::ok(PaymentAction::WaitingForManualAction);
    }
    if current.is_initiated() && !payment_expected_states(current).contains(&new_state) {
        return ActionOutcome::manual(
            PaymentAction::WaitingForManualAction,
            EntityErrorType::InvalidState,
            format!(
                "On-chain state {} observed while {} was in flight",
                new_state.as_str(),
                current.as_str()
            ),
        );
    }
    match new_state {
        OnChainState::FundsLocked => ActionOutcome::ok(PaymentAction::WaitingForExternalAction),
        OnChainState::ResultSubmitted => ActionOutcome::ok(PaymentAction::WithdrawRequested),
        OnChainState::RefundRequested => ActionOutcome::ok(PaymentAction::WaitingForExternalAction),
        OnChainState::Disputed => ActionOutcome::ok(PaymentAction::WaitingForExternalAction),
        OnChainState::Withdrawn
        | OnChainState::RefundWithdrawn
        | OnChainState::DisputedWithdrawn => ActionOutcome::ok(PaymentAction::None),
        OnChainState::FundsOrDatumInvalid => ActionOutcome::manual(
            PaymentAction::WaitingForManualAction,
            EntityErrorType::InvalidState,
            "Funds or datum invalid on chain",
        ),
    }
}

/// Next action for the buyer mirror after observing `new_state`.
pub fn next_purchasing_action(
    current: PurchasingAction,
    new_state: OnChainState,
) -> ActionOutcome<PurchasingAction> {
    if current == PurchasingAction::WaitingForManualAction {
        return ActionOutcome::ok(PurchasingAction::WaitingForManualAction);
    }
    if current.is_initiated() && !purchasing_expected_states(current).contains(&new_state) {
        return ActionOutcome::manual(
            PurchasingAction::WaitingForManualAction,
            EntityErrorType::InvalidState,
            format!(
                "On-chain state {} observed while {} was in flight",
                new_state.as_str(),
                current.as_str()
            ),
        );
    }
    match new_state {
        OnChainState::FundsLocked => ActionOutcome::ok(PurchasingAction::WaitingForExternalAction),
        OnChainState::ResultSubmitted => {
            ActionOutcome::ok(PurchasingAction::WaitingForExternalAction)
        }
        OnChainState::RefundRequested => {
            ActionOutcome::ok(PurchasingAction::WithdrawRefundRequested)
        }
        OnChainState::Disputed => ActionOutcome::ok(PurchasingAction::WaitingForExternalAction),
        OnChainState::Withdrawn
        | OnChainState::RefundWithdrawn
        | OnChainState::DisputedWithdrawn => ActionOutcome::ok(PurchasingAction::None),
        OnChainState::FundsOrDatumInvalid => ActionOutcome::manual(
            PurchasingAction::WaitingForManualAction,
            EntityErrorType::InvalidState,
            "Funds or datum invalid on chain",
        ),
    }
}

/// Amount-correctness predicate for a continuing escrow output: lovelace must
/// cover requested plus collateral return, native assets must match exactly.
pub fn amounts_cover(
    requested: &[(String, i64)],
    collateral_return_lovelace: i64,
    output_lovelace: u64,
    output_quantity_of: impl Fn(&str) -> u64,
) -> bool {
    for (unit, amount) in requested {
        if unit.is_empty() || unit == "lovelace" {
            let needed = (*amount + collateral_return_lovelace).max(0) as u64;
            if output_lovelace < needed {
                return false;
            }
        } else if output_quantity_of(unit) != *amount as u64 {
            return false;
        }
    }
    true
}
