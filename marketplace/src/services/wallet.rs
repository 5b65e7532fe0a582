//! Wallet ledger service.

use super::{finish, require_user, PostCommit};
use crate::aggregates::wallet::{WalletAction, WalletReducer, WalletState};
use crate::aggregates::MarketplaceEnvironment;
use crate::error::Result;
use crate::metrics;
use crate::store::{MarketplaceStore, UnitOfWork};
use crate::types::{BalanceLedgerEntry, LedgerReference, Money, UserId, WalletBalance};
use marketplace_core::reducer::Reducer;
use std::sync::Arc;

/// Result of [`WalletLedger::verify_ledger`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerCheck {
    /// Stored balance
    pub balance: Money,
    /// Sum of signed ledger entries
    pub ledger_total: Money,
}

impl LedgerCheck {
    /// Whether the stored balance is explained by the ledger
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_total
    }
}

/// Wallet balances and their append-only ledger.
///
/// Every mutation locks the user's wallet row, so concurrent debits cannot
/// both pass the sufficiency check.
pub struct WalletLedger<S> {
    store: Arc<S>,
    env: MarketplaceEnvironment,
    reducer: WalletReducer,
}

impl<S> Clone for WalletLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            env: self.env.clone(),
            reducer: WalletReducer::new(),
        }
    }
}

impl<S: MarketplaceStore> WalletLedger<S> {
    /// Creates a new `WalletLedger`
    #[must_use]
    pub const fn new(store: Arc<S>, env: MarketplaceEnvironment) -> Self {
        Self {
            store,
            env,
            reducer: WalletReducer::new(),
        }
    }

    /// Returns the user's wallet, creating a zero balance on first access
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown user
    /// - [`MarketplaceError::Storage`] on storage failure
    pub async fn get_or_create_balance(&self, user_id: UserId) -> Result<WalletBalance> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, user_id).await?;
        let wallet = uow.lock_wallet(user_id, self.env.clock.now()).await?;
        uow.commit().await?;
        Ok(wallet)
    }

    /// Current balance
    ///
    /// # Errors
    ///
    /// Same as [`WalletLedger::get_or_create_balance`]
    pub async fn current_balance(&self, user_id: UserId) -> Result<Money> {
        Ok(self.get_or_create_balance(user_id).await?.balance())
    }

    /// Adds money to a wallet
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::InvalidAmount`] if `amount <= 0`
    /// - [`MarketplaceError::NotFound`] for an unknown user
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Money,
        description: impl Into<String>,
        reference: LedgerReference,
    ) -> Result<WalletBalance> {
        let action = WalletAction::Credit {
            amount,
            description: description.into(),
            reference,
        };
        self.mutate("wallet.credit", user_id, action).await
    }

    /// Takes money from a wallet
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::InvalidAmount`] if `amount <= 0`
    /// - [`MarketplaceError::InsufficientBalance`] if the balance does not cover `amount`
    /// - [`MarketplaceError::NotFound`] for an unknown user
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Money,
        description: impl Into<String>,
        reference: LedgerReference,
    ) -> Result<WalletBalance> {
        let action = WalletAction::Debit {
            amount,
            description: description.into(),
            reference,
        };
        self.mutate("wallet.debit", user_id, action).await
    }

    /// Pays money out of the marketplace
    ///
    /// # Errors
    ///
    /// Same as [`WalletLedger::debit`]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount: Money,
        description: impl Into<String>,
    ) -> Result<WalletBalance> {
        let action = WalletAction::Withdraw {
            amount,
            description: description.into(),
            reference: LedgerReference::admin(),
        };
        self.mutate("wallet.withdraw", user_id, action).await
    }

    /// Whether the balance currently covers `amount`.
    ///
    /// Advisory only: the debit re-checks under the wallet lock.
    ///
    /// # Errors
    ///
    /// Same as [`WalletLedger::get_or_create_balance`]
    pub async fn can_afford(&self, user_id: UserId, amount: Money) -> Result<bool> {
        Ok(self.current_balance(user_id).await? >= amount)
    }

    /// Ledger entries, most recent first
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown user
    pub async fn history(&self, user_id: UserId) -> Result<Vec<BalanceLedgerEntry>> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, user_id).await?;
        uow.ledger_entries(user_id).await
    }

    /// Compares the stored balance with the sum of the ledger
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown user
    pub async fn verify_ledger(&self, user_id: UserId) -> Result<LedgerCheck> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, user_id).await?;
        let wallet = uow.lock_wallet(user_id, self.env.clock.now()).await?;
        let entries = uow.ledger_entries(user_id).await?;
        let check = LedgerCheck {
            balance: wallet.balance(),
            ledger_total: entries.iter().map(BalanceLedgerEntry::signed_amount).sum(),
        };
        if !check.is_consistent() {
            tracing::error!(
                user_id = %user_id,
                balance = %check.balance,
                ledger_total = %check.ledger_total,
                "Wallet balance does not match its ledger"
            );
        }
        Ok(check)
    }

    /// Runs a wallet command inside an open unit of work.
    ///
    /// Locks the wallet, posts the ledger entry and queues the audit effect
    /// and metrics on `post`. Nothing is written when the command is rejected.
    pub(crate) async fn apply_in(
        &self,
        uow: &mut S::Tx,
        user_id: UserId,
        action: WalletAction,
        post: &mut PostCommit,
    ) -> Result<WalletBalance> {
        let wallet = uow.lock_wallet(user_id, self.env.clock.now()).await?;
        let mut state = WalletState::new(wallet);
        let effects = self.reducer.reduce(&mut state, action, &self.env);
        if let Some(error) = state.last_error {
            return Err(error);
        }
        post.effects(effects);

        uow.save_wallet(&state.wallet).await?;
        for entry in &state.posted {
            uow.append_ledger_entry(entry).await?;
            let kind = entry.kind();
            post.then(move || metrics::record_wallet_mutation(kind));
            tracing::debug!(
                user_id = %user_id,
                kind = %kind,
                amount = %entry.amount(),
                balance = %state.wallet.balance(),
                "Ledger entry posted"
            );
        }
        Ok(state.wallet)
    }

    async fn try_mutate(
        &self,
        user_id: UserId,
        action: WalletAction,
    ) -> Result<(WalletBalance, PostCommit)> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, user_id).await?;
        let mut post = PostCommit::new();
        let wallet = self.apply_in(&mut uow, user_id, action, &mut post).await?;
        uow.commit().await?;
        Ok((wallet, post))
    }

    async fn mutate(
        &self,
        operation: &'static str,
        user_id: UserId,
        action: WalletAction,
    ) -> Result<WalletBalance> {
        let wallet = finish(operation, self.try_mutate(user_id, action).await).await?;
        tracing::info!(operation, user_id = %user_id, balance = %wallet.balance(), "Wallet updated");
        Ok(wallet)
    }
}

impl<S> std::fmt::Debug for WalletLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletLedger").finish_non_exhaustive()
    }
}
