//! Wallet aggregate.
//!
//! Owns a user's balance and the ledger entries that explain it. Every
//! accepted command produces exactly one [`BalanceLedgerEntry`] whose signed
//! amount is the balance change, and the balance never goes below zero.

use super::MarketplaceEnvironment;
use crate::audit::{audit_effect, AuditRecord};
use crate::error::MarketplaceError;
use crate::types::{
    BalanceLedgerEntry, LedgerEntryId, LedgerEntryKind, LedgerReference, Money, WalletBalance,
};
use marketplace_core::{effect::Effect, reducer::Reducer, smallvec, SmallVec};
use serde_json::json;

/// State for one wallet command
#[derive(Clone, Debug)]
pub struct WalletState {
    /// Locked wallet row
    pub wallet: WalletBalance,
    /// Entries posted by this command, to be appended to the ledger
    pub posted: Vec<BalanceLedgerEntry>,
    /// Rejection of the last command
    pub last_error: Option<MarketplaceError>,
}

impl WalletState {
    /// Wraps a loaded wallet
    #[must_use]
    pub const fn new(wallet: WalletBalance) -> Self {
        Self {
            wallet,
            posted: Vec::new(),
            last_error: None,
        }
    }
}

/// Wallet commands and events
#[derive(Clone, Debug)]
pub enum WalletAction {
    // Commands
    /// Add money (sale proceeds, top-up)
    Credit {
        /// Amount, must be positive
        amount: Money,
        /// Ledger description
        description: String,
        /// Cause
        reference: LedgerReference,
    },
    /// Spend money on a purchase
    Debit {
        /// Amount, must be positive and covered by the balance
        amount: Money,
        /// Ledger description
        description: String,
        /// Cause
        reference: LedgerReference,
    },
    /// Return money for a refunded transaction
    Refund {
        /// Amount, must be positive
        amount: Money,
        /// Ledger description
        description: String,
        /// Cause
        reference: LedgerReference,
    },
    /// Take money out of the marketplace
    Withdraw {
        /// Amount, must be positive and covered by the balance
        amount: Money,
        /// Ledger description
        description: String,
        /// Cause
        reference: LedgerReference,
    },

    // Events
    /// A ledger entry was posted and the balance moved by its signed amount
    EntryPosted {
        /// The new entry
        entry: BalanceLedgerEntry,
    },
    /// The command was rejected
    Rejected {
        /// Why
        error: MarketplaceError,
    },
}

/// Reducer for the wallet aggregate
#[derive(Clone, Debug, Default)]
pub struct WalletReducer;

impl WalletReducer {
    /// Creates a new `WalletReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate(wallet: &WalletBalance, kind: LedgerEntryKind, amount: Money) -> Result<(), MarketplaceError> {
        if !amount.is_positive() {
            return Err(MarketplaceError::InvalidAmount { amount });
        }
        if kind.is_inflow() {
            if wallet.balance.checked_add(amount).is_none() {
                return Err(MarketplaceError::InvalidAmount { amount });
            }
        } else if wallet.balance < amount {
            return Err(MarketplaceError::InsufficientBalance {
                available: wallet.balance,
                required: amount,
            });
        }
        Ok(())
    }

    fn apply_event(state: &mut WalletState, action: &WalletAction) {
        match action {
            WalletAction::EntryPosted { entry } => {
                let next = state.wallet.balance.checked_add(entry.signed_amount());
                if let Some(balance) = next.filter(|b| b.cents() >= 0) {
                    state.wallet.balance = balance;
                    state.wallet.last_updated = entry.created_at;
                    state.posted.push(entry.clone());
                    state.last_error = None;
                }
            },
            WalletAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            _ => {},
        }
    }
}

impl Reducer for WalletReducer {
    type State = WalletState;
    type Action = WalletAction;
    type Environment = MarketplaceEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let (kind, amount, description, reference) = match action {
            WalletAction::Credit {
                amount,
                description,
                reference,
            } => (LedgerEntryKind::Credit, amount, description, reference),
            WalletAction::Debit {
                amount,
                description,
                reference,
            } => (LedgerEntryKind::Debit, amount, description, reference),
            WalletAction::Refund {
                amount,
                description,
                reference,
            } => (LedgerEntryKind::Refund, amount, description, reference),
            WalletAction::Withdraw {
                amount,
                description,
                reference,
            } => (LedgerEntryKind::Withdrawal, amount, description, reference),
            event @ (WalletAction::EntryPosted { .. } | WalletAction::Rejected { .. }) => {
                Self::apply_event(state, &event);
                return SmallVec::new();
            },
        };

        if let Err(error) = Self::validate(&state.wallet, kind, amount) {
            Self::apply_event(state, &WalletAction::Rejected { error });
            return SmallVec::new();
        }

        let now = env.clock.now();
        let entry = BalanceLedgerEntry {
            id: LedgerEntryId::new(),
            user_id: state.wallet.user_id,
            amount,
            kind,
            description,
            reference,
            created_at: now,
        };
        Self::apply_event(state, &WalletAction::EntryPosted { entry: entry.clone() });

        let record = AuditRecord::new(
            match kind {
                LedgerEntryKind::Credit => "BALANCE_CREDIT",
                LedgerEntryKind::Debit => "BALANCE_DEBIT",
                LedgerEntryKind::Refund => "BALANCE_REFUND",
                LedgerEntryKind::Withdrawal => "BALANCE_WITHDRAWAL",
            },
            "WalletBalance",
            state.wallet.user_id,
            Some(state.wallet.user_id),
            now,
        )
        .with_details(json!({
            "entry_id": entry.id.to_string(),
            "amount_cents": amount.cents(),
            "balance_after_cents": state.wallet.balance.cents(),
            "reference_type": entry.reference.kind.as_str(),
            "reference_id": entry.reference.id.map(|id| id.to_string()),
        }));

        smallvec![audit_effect(&env.audit, record)]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::test_support::test_env;
    use crate::types::UserId;
    use marketplace_core::environment::Clock;
    use marketplace_testing::{assertions, test_clock, ReducerTest};

    fn wallet_with(cents: i64) -> WalletBalance {
        let mut wallet = WalletBalance::empty(UserId::new(), test_clock().now());
        wallet.balance = Money::from_cents(cents);
        wallet
    }

    fn credit(cents: i64) -> WalletAction {
        WalletAction::Credit {
            amount: Money::from_cents(cents),
            description: "top-up".to_string(),
            reference: LedgerReference::admin(),
        }
    }

    fn debit(cents: i64) -> WalletAction {
        WalletAction::Debit {
            amount: Money::from_cents(cents),
            description: "ticket".to_string(),
            reference: LedgerReference::admin(),
        }
    }

    #[test]
    fn test_credit_posts_entry() {
        ReducerTest::new(WalletReducer::new())
            .with_env(test_env())
            .given_state(WalletState::new(wallet_with(0)))
            .when_action(credit(15_000))
            .then_state(|state| {
                assert_eq!(state.wallet.balance(), Money::from_dollars(150));
                assert_eq!(state.posted.len(), 1);
                assert_eq!(state.posted[0].kind(), LedgerEntryKind::Credit);
                assert_eq!(state.posted[0].amount(), Money::from_dollars(150));
                assert!(state.last_error.is_none());
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn test_debit_within_balance() {
        ReducerTest::new(WalletReducer::new())
            .with_env(test_env())
            .given_state(WalletState::new(wallet_with(15_000)))
            .when_action(debit(10_000))
            .then_state(|state| {
                assert_eq!(state.wallet.balance(), Money::from_dollars(50));
                assert_eq!(state.posted[0].signed_amount(), Money::from_dollars(-100));
            })
            .run();
    }

    #[test]
    fn test_debit_exceeding_balance_is_rejected() {
        ReducerTest::new(WalletReducer::new())
            .with_env(test_env())
            .given_state(WalletState::new(wallet_with(5_000)))
            .when_action(debit(5_001))
            .then_state(|state| {
                assert_eq!(state.wallet.balance(), Money::from_dollars(50));
                assert!(state.posted.is_empty());
                assert_eq!(
                    state.last_error,
                    Some(MarketplaceError::InsufficientBalance {
                        available: Money::from_dollars(50),
                        required: Money::from_cents(5_001),
                    })
                );
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_non_positive_amounts_are_rejected() {
        for cents in [0, -1, -10_000] {
            ReducerTest::new(WalletReducer::new())
                .with_env(test_env())
                .given_state(WalletState::new(wallet_with(1_000)))
                .when_actions([credit(cents), debit(cents)])
                .then_state(move |state| {
                    assert_eq!(state.wallet.balance(), Money::from_dollars(10));
                    assert!(state.posted.is_empty());
                    assert_eq!(
                        state.last_error,
                        Some(MarketplaceError::InvalidAmount {
                            amount: Money::from_cents(cents)
                        })
                    );
                })
                .then_effects(assertions::assert_no_effects)
                .run();
        }
    }

    #[test]
    fn test_credit_overflow_is_rejected() {
        ReducerTest::new(WalletReducer::new())
            .with_env(test_env())
            .given_state(WalletState::new(wallet_with(i64::MAX)))
            .when_action(credit(1))
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(MarketplaceError::InvalidAmount { .. })));
                assert_eq!(state.wallet.balance().cents(), i64::MAX);
            })
            .run();
    }

    #[test]
    fn test_withdraw_and_refund_kinds() {
        ReducerTest::new(WalletReducer::new())
            .with_env(test_env())
            .given_state(WalletState::new(wallet_with(2_000)))
            .when_actions([
                WalletAction::Withdraw {
                    amount: Money::from_cents(500),
                    description: "cash out".to_string(),
                    reference: LedgerReference::admin(),
                },
                WalletAction::Refund {
                    amount: Money::from_cents(300),
                    description: "refund".to_string(),
                    reference: LedgerReference::admin(),
                },
            ])
            .then_state(|state| {
                assert_eq!(state.wallet.balance(), Money::from_cents(1_800));
                let kinds: Vec<_> = state.posted.iter().map(BalanceLedgerEntry::kind).collect();
                assert_eq!(kinds, vec![LedgerEntryKind::Withdrawal, LedgerEntryKind::Refund]);
                let net: Money = state.posted.iter().map(BalanceLedgerEntry::signed_amount).sum();
                assert_eq!(net, Money::from_cents(-200));
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 2))
            .run();
    }
}
