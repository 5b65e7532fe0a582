//! Application services: the imperative shell around the reducers.
//!
//! Every public operation follows the same steps:
//!
//! 1. open a unit of work and load (and lock) the rows it needs
//! 2. run the reducer; a rejection returns the error and drops the unit
//!    of work, so nothing is written
//! 3. save the changed rows and commit
//! 4. run the post-commit work: audit and notification effects returned by
//!    the reducers, metrics, cache invalidation
//!
//! Operations that span several aggregates (a purchase touches a wallet, a
//! ticket, a listing and a transaction) run every step inside one unit of
//! work through the crate-internal `*_in` methods, and commit once.

pub mod inventory;
pub mod listing;
pub mod orchestrator;
pub mod wallet;

pub use inventory::TicketInventory;
pub use listing::ResaleListingEngine;
pub use orchestrator::{PurchaseIntent, TransactionOrchestrator};
pub use wallet::WalletLedger;

use crate::aggregates::MarketplaceEnvironment;
use crate::cache::{Cache, InMemoryCache};
use crate::config::PaymentConfig;
use crate::error::{MarketplaceError, Result};
use crate::payment_gateway::PaymentGateway;
use crate::store::{MarketplaceStore, UnitOfWork};
use crate::types::{EventAvailability, EventId, User, UserId};
use futures::future::BoxFuture;
use futures::FutureExt;
use marketplace_core::effect::Effect;
use std::sync::Arc;

/// Cache of event availability read models
pub type AvailabilityCache = Arc<dyn Cache<EventId, EventAvailability>>;

/// Work deferred until the unit of work has committed.
///
/// Dropped unrun when the operation fails, so a rejected or rolled-back
/// operation never audits, notifies or counts anything.
#[derive(Default)]
pub struct PostCommit {
    tasks: Vec<BoxFuture<'static, ()>>,
}

impl PostCommit {
    /// Creates an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues reducer effects; any actions they produce are discarded
    pub fn effects<A, I>(&mut self, effects: I)
    where
        A: Send + 'static,
        I: IntoIterator<Item = Effect<A>>,
    {
        for effect in effects {
            if !effect.is_none() {
                self.tasks.push(effect.run().map(|_| ()).boxed());
            }
        }
    }

    /// Queues a synchronous step (metrics, cache invalidation)
    pub fn then<F>(&mut self, step: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.push(async move { step() }.boxed());
    }

    /// Number of queued tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs the queued work in order
    pub async fn run(self) {
        for task in self.tasks {
            task.await;
        }
    }
}

/// Logs a failed operation: `warn` for business rejections, `error` for
/// storage and gateway failures.
pub(crate) fn log_failure(operation: &'static str, error: &MarketplaceError) {
    if error.is_retryable() {
        tracing::error!(operation, code = error.code(), %error, "Operation failed");
    } else {
        tracing::warn!(operation, code = error.code(), %error, "Operation rejected");
    }
}

/// Completes an operation whose unit of work has been committed (or
/// abandoned): runs the post-commit work on success, logs the failure
/// otherwise.
pub(crate) async fn finish<T>(operation: &'static str, outcome: Result<(T, PostCommit)>) -> Result<T> {
    match outcome {
        Ok((value, post)) => {
            post.run().await;
            Ok(value)
        },
        Err(error) => {
            log_failure(operation, &error);
            Err(error)
        },
    }
}

/// Loads a user or fails with `NotFound`
pub(crate) async fn require_user<T: UnitOfWork>(uow: &mut T, user_id: UserId) -> Result<User> {
    uow.find_user(user_id)
        .await?
        .ok_or_else(|| MarketplaceError::not_found("user", user_id))
}

/// All marketplace services over one store.
pub struct Marketplace<S> {
    /// Wallet balances and ledger
    pub wallets: WalletLedger<S>,
    /// Events, tiers and tickets
    pub inventory: TicketInventory<S>,
    /// Resale listings
    pub listings: ResaleListingEngine<S>,
    /// Purchases, confirmations and refunds
    pub transactions: TransactionOrchestrator<S>,
}

impl<S: MarketplaceStore> Marketplace<S> {
    /// Wires the services with an in-process availability cache
    #[must_use]
    pub fn new(
        store: S,
        env: MarketplaceEnvironment,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentConfig,
    ) -> Self {
        let cache: AvailabilityCache = Arc::new(InMemoryCache::<EventId, EventAvailability>::default());
        Self::with_cache(store, env, gateway, payments, cache)
    }

    /// Wires the services with a caller-supplied availability cache
    #[must_use]
    pub fn with_cache(
        store: S,
        env: MarketplaceEnvironment,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentConfig,
        cache: AvailabilityCache,
    ) -> Self {
        let store = Arc::new(store);
        let wallets = WalletLedger::new(Arc::clone(&store), env.clone());
        let inventory = TicketInventory::new(Arc::clone(&store), env.clone(), cache);
        let listings = ResaleListingEngine::new(Arc::clone(&store), env.clone());
        let transactions = TransactionOrchestrator::new(
            store,
            env,
            gateway,
            payments,
            wallets.clone(),
            inventory.clone(),
            listings.clone(),
        );
        Self {
            wallets,
            inventory,
            listings,
            transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_post_commit_runs_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut post = PostCommit::new();

        let seen = Arc::clone(&counter);
        post.effects([Effect::<()>::future(async move {
            assert_eq!(seen.fetch_add(1, Ordering::SeqCst), 0);
            None
        })]);
        post.effects([Effect::<()>::None]);
        let seen = Arc::clone(&counter);
        post.then(move || {
            assert_eq!(seen.fetch_add(1, Ordering::SeqCst), 1);
        });

        assert_eq!(post.len(), 2);
        post.run().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_batch_runs_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut post = PostCommit::new();
        let seen = Arc::clone(&counter);
        post.then(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(post);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
