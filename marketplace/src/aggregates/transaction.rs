//! Purchase transaction aggregate.
//!
//! `PENDING → COMPLETED | FAILED`, `COMPLETED → REFUNDED`. The amount is
//! frozen when the transaction is initiated. Completion and refund emit the
//! audit record and the buyer/seller notification as post-commit effects.

use super::MarketplaceEnvironment;
use crate::audit::{audit_effect, AuditRecord};
use crate::error::MarketplaceError;
use crate::notification::{notify_effect, Notification};
use crate::types::{
    generate_number, ListingId, Money, PaymentMethod, TicketId, Transaction, TransactionId,
    TransactionStatus, TransactionType, UserId,
};
use chrono::{DateTime, Utc};
use marketplace_core::{effect::Effect, reducer::Reducer, smallvec, SmallVec};
use serde_json::json;

/// State for one transaction command
#[derive(Clone, Debug, Default)]
pub struct TransactionState {
    /// The transaction, absent before initiation
    pub transaction: Option<Transaction>,
    /// Rejection of the last command
    pub last_error: Option<MarketplaceError>,
}

impl TransactionState {
    /// Wraps a loaded transaction
    #[must_use]
    pub const fn loaded(transaction: Transaction) -> Self {
        Self {
            transaction: Some(transaction),
            last_error: None,
        }
    }
}

/// Transaction commands and events
#[derive(Clone, Debug)]
pub enum TransactionAction {
    // Commands
    /// Open a PENDING transaction
    Initiate {
        /// Transaction id
        transaction_id: TransactionId,
        /// Primary or secondary
        kind: TransactionType,
        /// Buyer
        buyer_id: UserId,
        /// Seller (event creator or listing seller)
        seller_id: Option<UserId>,
        /// Ticket being bought
        ticket_id: TicketId,
        /// Listing being bought (secondary)
        listing_id: Option<ListingId>,
        /// Frozen amount
        amount: Money,
        /// Card or balance
        payment_method: PaymentMethod,
    },
    /// Record the gateway intent of a card payment
    AttachIntent {
        /// Gateway reference
        intent_ref: String,
    },
    /// Payment confirmed and ownership transferred
    Complete,
    /// Give up on a PENDING transaction
    Fail {
        /// Why
        reason: String,
    },
    /// Return the money of a COMPLETED transaction
    Refund {
        /// Why
        reason: String,
    },

    // Events
    /// Transaction opened
    Initiated {
        /// The new transaction
        transaction: Transaction,
    },
    /// Intent recorded
    IntentAttached {
        /// Gateway reference
        intent_ref: String,
    },
    /// Transaction completed
    Completed {
        /// Completion time
        completed_at: DateTime<Utc>,
    },
    /// Transaction failed
    Failed {
        /// Why
        reason: String,
    },
    /// Transaction refunded
    Refunded {
        /// Why
        reason: String,
        /// Refund time
        refunded_at: DateTime<Utc>,
    },
    /// Command rejected
    Rejected {
        /// Why
        error: MarketplaceError,
    },
}

/// Reducer for purchase transactions
#[derive(Clone, Debug, Default)]
pub struct TransactionReducer;

impl TransactionReducer {
    /// Creates a new `TransactionReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn require(
        state: &TransactionState,
        expected: TransactionStatus,
    ) -> Result<&Transaction, MarketplaceError> {
        let transaction = state
            .transaction
            .as_ref()
            .ok_or_else(|| MarketplaceError::InvalidState("transaction not loaded".to_string()))?;
        if transaction.status != expected {
            return Err(MarketplaceError::InvalidState(format!(
                "transaction {} is {}, expected {expected}",
                transaction.transaction_number, transaction.status
            )));
        }
        Ok(transaction)
    }

    fn validate_initiate(state: &TransactionState, amount: Money) -> Result<(), MarketplaceError> {
        if state.transaction.is_some() {
            return Err(MarketplaceError::InvalidState(
                "transaction already initiated".to_string(),
            ));
        }
        if !amount.is_positive() {
            return Err(MarketplaceError::InvalidAmount { amount });
        }
        Ok(())
    }

    fn apply_event(state: &mut TransactionState, action: &TransactionAction) {
        match action {
            TransactionAction::Initiated { transaction } => {
                state.transaction = Some(transaction.clone());
                state.last_error = None;
            },
            TransactionAction::IntentAttached { intent_ref } => {
                if let Some(transaction) = state.transaction.as_mut() {
                    transaction.payment_intent_ref = Some(intent_ref.clone());
                }
                state.last_error = None;
            },
            TransactionAction::Completed { completed_at } => {
                if let Some(transaction) = state.transaction.as_mut() {
                    transaction.status = TransactionStatus::Completed;
                    transaction.completed_at = Some(*completed_at);
                }
                state.last_error = None;
            },
            TransactionAction::Failed { reason } => {
                if let Some(transaction) = state.transaction.as_mut() {
                    transaction.status = TransactionStatus::Failed;
                    transaction.failure_reason = Some(reason.clone());
                }
                state.last_error = None;
            },
            TransactionAction::Refunded {
                reason,
                refunded_at,
            } => {
                if let Some(transaction) = state.transaction.as_mut() {
                    transaction.status = TransactionStatus::Refunded;
                    transaction.refund_reason = Some(reason.clone());
                    transaction.refunded_at = Some(*refunded_at);
                }
                state.last_error = None;
            },
            TransactionAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            TransactionAction::Initiate { .. }
            | TransactionAction::AttachIntent { .. }
            | TransactionAction::Complete
            | TransactionAction::Fail { .. }
            | TransactionAction::Refund { .. } => {},
        }
    }

    fn record(
        env: &MarketplaceEnvironment,
        action: &'static str,
        transaction: &Transaction,
    ) -> AuditRecord {
        AuditRecord::new(
            action,
            "Transaction",
            transaction.id,
            Some(transaction.buyer_id),
            env.clock.now(),
        )
        .with_details(json!({
            "transaction_number": transaction.transaction_number,
            "amount_cents": transaction.amount.cents(),
            "kind": transaction.kind.as_str(),
            "status": transaction.status.as_str(),
            "payment_method": transaction.payment_method.as_str(),
            "ticket_id": transaction.ticket_id.to_string(),
            "seller_id": transaction.seller_id.map(|id| id.to_string()),
            "listing_id": transaction.listing_id.map(|id| id.to_string()),
            "failure_reason": transaction.failure_reason,
            "refund_reason": transaction.refund_reason,
        }))
    }

    fn reject(state: &mut TransactionState, error: MarketplaceError) -> SmallVec<[Effect<TransactionAction>; 4]> {
        Self::apply_event(state, &TransactionAction::Rejected { error });
        SmallVec::new()
    }
}

impl Reducer for TransactionReducer {
    type State = TransactionState;
    type Action = TransactionAction;
    type Environment = MarketplaceEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            TransactionAction::Initiate {
                transaction_id,
                kind,
                buyer_id,
                seller_id,
                ticket_id,
                listing_id,
                amount,
                payment_method,
            } => {
                if let Err(error) = Self::validate_initiate(state, amount) {
                    return Self::reject(state, error);
                }
                let transaction = Transaction {
                    id: transaction_id,
                    transaction_number: generate_number("TXN"),
                    amount,
                    kind,
                    status: TransactionStatus::Pending,
                    buyer_id,
                    seller_id,
                    ticket_id,
                    listing_id,
                    payment_method,
                    payment_intent_ref: None,
                    failure_reason: None,
                    refund_reason: None,
                    transaction_date: env.clock.now(),
                    completed_at: None,
                    refunded_at: None,
                };
                let record = Self::record(env, "PAYMENT_INITIATED", &transaction);
                Self::apply_event(state, &TransactionAction::Initiated { transaction });
                smallvec![audit_effect(&env.audit, record)]
            },

            TransactionAction::AttachIntent { intent_ref } => {
                if let Err(error) = Self::require(state, TransactionStatus::Pending) {
                    return Self::reject(state, error);
                }
                Self::apply_event(state, &TransactionAction::IntentAttached { intent_ref });
                SmallVec::new()
            },

            TransactionAction::Complete => {
                if let Err(error) = Self::require(state, TransactionStatus::Pending) {
                    return Self::reject(state, error);
                }
                Self::apply_event(
                    state,
                    &TransactionAction::Completed {
                        completed_at: env.clock.now(),
                    },
                );
                let Some(transaction) = state.transaction.clone() else {
                    return SmallVec::new();
                };
                let action = match transaction.kind {
                    TransactionType::PrimaryPurchase => "PRIMARY_PURCHASE",
                    TransactionType::SecondaryPurchase => "SECONDARY_PURCHASE",
                };
                smallvec![
                    audit_effect(&env.audit, Self::record(env, action, &transaction)),
                    notify_effect(&env.notifier, Notification::PurchaseCompleted { transaction }),
                ]
            },

            TransactionAction::Fail { reason } => {
                if let Err(error) = Self::require(state, TransactionStatus::Pending) {
                    return Self::reject(state, error);
                }
                Self::apply_event(state, &TransactionAction::Failed { reason });
                match &state.transaction {
                    Some(transaction) => {
                        smallvec![audit_effect(&env.audit, Self::record(env, "TRANSACTION_FAILED", transaction))]
                    },
                    None => SmallVec::new(),
                }
            },

            TransactionAction::Refund { reason } => {
                if let Err(error) = Self::require(state, TransactionStatus::Completed) {
                    return Self::reject(state, error);
                }
                Self::apply_event(
                    state,
                    &TransactionAction::Refunded {
                        reason,
                        refunded_at: env.clock.now(),
                    },
                );
                let Some(transaction) = state.transaction.clone() else {
                    return SmallVec::new();
                };
                smallvec![
                    audit_effect(&env.audit, Self::record(env, "TRANSACTION_REFUND", &transaction)),
                    notify_effect(&env.notifier, Notification::Refunded { transaction }),
                ]
            },

            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::test_support::test_env;
    use marketplace_testing::{assertions, ReducerTest};

    fn initiate(amount: Money) -> TransactionAction {
        TransactionAction::Initiate {
            transaction_id: TransactionId::new(),
            kind: TransactionType::PrimaryPurchase,
            buyer_id: UserId::new(),
            seller_id: None,
            ticket_id: TicketId::new(),
            listing_id: None,
            amount,
            payment_method: PaymentMethod::Balance,
        }
    }

    #[test]
    fn test_initiate_opens_pending_transaction() {
        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_action(initiate(Money::from_dollars(100)))
            .then_state(|state| {
                let txn = state.transaction.as_ref().unwrap();
                assert_eq!(txn.status(), TransactionStatus::Pending);
                assert_eq!(txn.amount(), Money::from_dollars(100));
                assert!(txn.transaction_number().starts_with("TXN-"));
                assert!(txn.payment_intent_ref().is_none());
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_initiate_rejects_zero_amount() {
        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_action(initiate(Money::ZERO))
            .then_state(|state| {
                assert!(state.transaction.is_none());
                assert!(matches!(state.last_error, Some(MarketplaceError::InvalidAmount { .. })));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_complete_emits_audit_and_notification() {
        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_actions([
                initiate(Money::from_dollars(80)),
                TransactionAction::AttachIntent {
                    intent_ref: "pi_1".to_string(),
                },
                TransactionAction::Complete,
            ])
            .then_state(|state| {
                let txn = state.transaction.as_ref().unwrap();
                assert_eq!(txn.status(), TransactionStatus::Completed);
                assert!(txn.completed_at().is_some());
                assert_eq!(txn.payment_intent_ref(), Some("pi_1"));
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 3))
            .run();
    }

    #[test]
    fn test_failed_is_terminal() {
        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_actions([
                initiate(Money::from_dollars(80)),
                TransactionAction::Fail {
                    reason: "card declined".to_string(),
                },
                TransactionAction::Complete,
            ])
            .then_state(|state| {
                let txn = state.transaction.as_ref().unwrap();
                assert_eq!(txn.status(), TransactionStatus::Failed);
                assert_eq!(txn.failure_reason(), Some("card declined"));
                assert!(matches!(state.last_error, Some(MarketplaceError::InvalidState(_))));
            })
            .run();
    }

    #[test]
    fn test_refund_requires_completed() {
        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_actions([
                initiate(Money::from_dollars(80)),
                TransactionAction::Refund {
                    reason: "changed mind".to_string(),
                },
            ])
            .then_state(|state| {
                assert_eq!(state.transaction.as_ref().unwrap().status(), TransactionStatus::Pending);
                assert!(matches!(state.last_error, Some(MarketplaceError::InvalidState(_))));
            })
            .run();

        ReducerTest::new(TransactionReducer::new())
            .with_env(test_env())
            .given_state(TransactionState::default())
            .when_actions([
                initiate(Money::from_dollars(80)),
                TransactionAction::Complete,
                TransactionAction::Refund {
                    reason: "event cancelled".to_string(),
                },
            ])
            .then_state(|state| {
                let txn = state.transaction.as_ref().unwrap();
                assert_eq!(txn.status(), TransactionStatus::Refunded);
                assert_eq!(txn.refund_reason(), Some("event cancelled"));
                assert!(txn.refunded_at().is_some());
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 5))
            .run();
    }
}
