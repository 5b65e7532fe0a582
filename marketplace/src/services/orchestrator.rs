//! Purchase orchestration: initiation, payment confirmation and refunds.
//!
//! A purchase is opened as a PENDING transaction with a frozen amount and
//! touches nothing else. Confirmation runs the whole completion sequence
//! (buyer debit, seller credit, listing and ticket transitions, transaction
//! COMPLETED) inside one unit of work. Business-rule failures found before
//! that sequence starts leave the transaction PENDING; a failure inside it
//! rolls the unit of work back and then marks the transaction FAILED in a
//! fresh one.
//!
//! Gateway calls are made with no unit of work open, so no row stays locked
//! for the duration of a network call, and each is bounded by the configured
//! timeout.

use super::{
    finish, log_failure, require_user, PostCommit, ResaleListingEngine, TicketInventory,
    WalletLedger,
};
use crate::aggregates::transaction::{TransactionAction, TransactionReducer, TransactionState};
use crate::aggregates::wallet::WalletAction;
use crate::aggregates::MarketplaceEnvironment;
use crate::config::PaymentConfig;
use crate::error::{MarketplaceError, Result};
use crate::metrics;
use crate::payment_gateway::{GatewayFuture, GatewayResult, IntentStatus, PaymentGateway, PaymentGatewayError};
use crate::store::{MarketplaceStore, UnitOfWork};
use crate::types::{
    LedgerReference, ListingId, ListingStatus, Money, PaymentMethod, TicketId, TicketStatus,
    Transaction, TransactionId, TransactionStatus, TransactionType, UserId,
};
use chrono::{DateTime, Utc};
use marketplace_core::reducer::Reducer;
use std::sync::Arc;

/// A freshly initiated purchase
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseIntent {
    /// The PENDING transaction
    pub transaction: Transaction,
    /// Secret the client needs to finish a card payment; `None` for balance
    pub client_secret: Option<String>,
}

/// How a confirmed purchase is paid for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Funding {
    /// Debit the buyer's wallet, which must belong to `buyer_id`
    Wallet { buyer_id: UserId },
    /// The gateway already collected the money
    Gateway,
}

/// Drives purchases across wallets, inventory and listings.
pub struct TransactionOrchestrator<S> {
    store: Arc<S>,
    env: MarketplaceEnvironment,
    reducer: TransactionReducer,
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentConfig,
    wallets: WalletLedger<S>,
    inventory: TicketInventory<S>,
    listings: ResaleListingEngine<S>,
}

impl<S> Clone for TransactionOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            env: self.env.clone(),
            reducer: TransactionReducer::new(),
            gateway: Arc::clone(&self.gateway),
            payments: self.payments.clone(),
            wallets: self.wallets.clone(),
            inventory: self.inventory.clone(),
            listings: self.listings.clone(),
        }
    }
}

impl<S> std::fmt::Debug for TransactionOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionOrchestrator")
            .field("payments", &self.payments)
            .finish_non_exhaustive()
    }
}

impl<S: MarketplaceStore> TransactionOrchestrator<S> {
    /// Creates a new `TransactionOrchestrator`
    #[must_use]
    pub const fn new(
        store: Arc<S>,
        env: MarketplaceEnvironment,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentConfig,
        wallets: WalletLedger<S>,
        inventory: TicketInventory<S>,
        listings: ResaleListingEngine<S>,
    ) -> Self {
        Self {
            store,
            env,
            reducer: TransactionReducer::new(),
            gateway,
            payments,
            wallets,
            inventory,
            listings,
        }
    }

    // ========================================================================
    // Initiation
    // ========================================================================

    /// Opens a primary purchase of an AVAILABLE ticket at its current price.
    /// The event creator, if any, is recorded as seller.
    ///
    /// For card payments a gateway intent is opened and its client secret
    /// returned; if that fails the transaction is marked FAILED.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket or buyer
    /// - [`MarketplaceError::InvalidState`] unless the ticket is AVAILABLE
    /// - [`MarketplaceError::Gateway`] if the intent cannot be opened
    pub async fn initiate_primary_purchase(
        &self,
        ticket_id: TicketId,
        buyer_id: UserId,
        payment_method: PaymentMethod,
    ) -> Result<PurchaseIntent> {
        let outcome = self
            .try_initiate_primary(ticket_id, buyer_id, payment_method)
            .await;
        let transaction = finish("orchestrator.initiate_primary_purchase", outcome).await?;
        self.open_payment("orchestrator.initiate_primary_purchase", transaction)
            .await
    }

    async fn try_initiate_primary(
        &self,
        ticket_id: TicketId,
        buyer_id: UserId,
        payment_method: PaymentMethod,
    ) -> Result<(Transaction, PostCommit)> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, buyer_id).await?;
        let ticket = TicketInventory::<S>::load_ticket(&mut uow, ticket_id).await?;
        if ticket.status != TicketStatus::Available {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} is not available (status {})",
                ticket.id, ticket.status
            )));
        }
        let event = TicketInventory::<S>::load_event(&mut uow, ticket.event_id).await?;

        let action = TransactionAction::Initiate {
            transaction_id: TransactionId::new(),
            kind: TransactionType::PrimaryPurchase,
            buyer_id,
            seller_id: event.creator_id,
            ticket_id,
            listing_id: None,
            amount: ticket.current_price,
            payment_method,
        };
        let mut post = PostCommit::new();
        let transaction = self.transition(TransactionState::default(), action, &mut post)?;
        uow.save_transaction(&transaction).await?;
        uow.commit().await?;
        post.then(|| metrics::record_transaction(TransactionStatus::Pending));
        Ok((transaction, post))
    }

    /// Opens a resale purchase of an ACTIVE listing at its asking price
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown listing or buyer
    /// - [`MarketplaceError::InvalidState`] unless the listing is ACTIVE
    /// - [`MarketplaceError::SelfPurchase`] if the buyer is the seller
    /// - [`MarketplaceError::Gateway`] if the intent cannot be opened
    pub async fn initiate_secondary_purchase(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        payment_method: PaymentMethod,
    ) -> Result<PurchaseIntent> {
        let outcome = self
            .try_initiate_secondary(listing_id, buyer_id, payment_method)
            .await;
        let transaction = finish("orchestrator.initiate_secondary_purchase", outcome).await?;
        self.open_payment("orchestrator.initiate_secondary_purchase", transaction)
            .await
    }

    async fn try_initiate_secondary(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        payment_method: PaymentMethod,
    ) -> Result<(Transaction, PostCommit)> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, buyer_id).await?;
        let listing = uow
            .find_listing(listing_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("listing", listing_id))?;
        if listing.status != ListingStatus::Active {
            return Err(MarketplaceError::InvalidState(format!(
                "listing {} is {}",
                listing.id, listing.status
            )));
        }
        if listing.seller_id == buyer_id {
            return Err(MarketplaceError::SelfPurchase { listing_id });
        }

        let action = TransactionAction::Initiate {
            transaction_id: TransactionId::new(),
            kind: TransactionType::SecondaryPurchase,
            buyer_id,
            seller_id: Some(listing.seller_id),
            ticket_id: listing.ticket_id,
            listing_id: Some(listing_id),
            amount: listing.asking_price,
            payment_method,
        };
        let mut post = PostCommit::new();
        let transaction = self.transition(TransactionState::default(), action, &mut post)?;
        uow.save_transaction(&transaction).await?;
        uow.commit().await?;
        post.then(|| metrics::record_transaction(TransactionStatus::Pending));
        Ok((transaction, post))
    }

    /// Opens the gateway intent of a card purchase and records its reference
    async fn open_payment(&self, operation: &'static str, transaction: Transaction) -> Result<PurchaseIntent> {
        if transaction.payment_method != PaymentMethod::Card {
            tracing::info!(
                transaction_id = %transaction.id,
                number = %transaction.transaction_number,
                amount = %transaction.amount,
                "Balance purchase initiated"
            );
            return Ok(PurchaseIntent {
                transaction,
                client_secret: None,
            });
        }

        let description = format!("Ticket purchase {}", transaction.transaction_number);
        let created = self
            .call_gateway(self.gateway.create_intent(
                transaction.amount,
                &self.payments.currency,
                &description,
            ))
            .await;
        let created = match created {
            Ok(created) => created,
            Err(error) => {
                self.fail_quietly(transaction.id, &format!("payment intent failed: {error}"))
                    .await;
                let error = MarketplaceError::Gateway(error);
                log_failure(operation, &error);
                return Err(error);
            },
        };

        let outcome = self.try_attach_intent(transaction.id, created.intent_ref).await;
        let transaction = finish(operation, outcome).await?;
        tracing::info!(
            transaction_id = %transaction.id,
            number = %transaction.transaction_number,
            amount = %transaction.amount,
            intent_ref = ?transaction.payment_intent_ref,
            "Card purchase initiated"
        );
        Ok(PurchaseIntent {
            transaction,
            client_secret: Some(created.client_secret),
        })
    }

    async fn try_attach_intent(
        &self,
        transaction_id: TransactionId,
        intent_ref: String,
    ) -> Result<(Transaction, PostCommit)> {
        let mut uow = self.store.begin().await?;
        let transaction = Self::load(&mut uow, transaction_id).await?;
        let mut post = PostCommit::new();
        let transaction = self.transition(
            TransactionState::loaded(transaction),
            TransactionAction::AttachIntent { intent_ref },
            &mut post,
        )?;
        uow.save_transaction(&transaction).await?;
        uow.commit().await?;
        Ok((transaction, post))
    }

    // ========================================================================
    // Confirmation
    // ========================================================================

    /// Pays a PENDING balance purchase from the buyer's wallet and completes it.
    ///
    /// # Errors
    ///
    /// Leave the transaction PENDING:
    /// - [`MarketplaceError::NotFound`] for an unknown transaction
    /// - [`MarketplaceError::InvalidState`] unless PENDING and paid by balance
    /// - [`MarketplaceError::NotOwner`] if `buyer_id` is not the buyer
    /// - [`MarketplaceError::InsufficientBalance`] if the wallet cannot cover it
    ///
    /// Any other failure during completion (the ticket was sold meanwhile,
    /// the listing closed, a storage error) rolls back every write, marks
    /// the transaction FAILED and is returned.
    pub async fn confirm_with_balance(&self, transaction_id: TransactionId, buyer_id: UserId) -> Result<Transaction> {
        let outcome = self
            .settle(transaction_id, Funding::Wallet { buyer_id })
            .await;
        let transaction = finish("orchestrator.confirm_with_balance", outcome).await?;
        tracing::info!(
            transaction_id = %transaction.id,
            number = %transaction.transaction_number,
            buyer_id = %buyer_id,
            amount = %transaction.amount,
            "Purchase completed from balance"
        );
        Ok(transaction)
    }

    /// Checks the gateway intent of a PENDING card purchase and, once it has
    /// succeeded, completes the purchase. The buyer's wallet is not touched.
    /// Confirming an already COMPLETED transaction returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::PaymentNotSucceeded`] while the intent is
    ///   pending (transaction stays PENDING) or after it failed or was
    ///   canceled (transaction FAILED)
    /// - [`MarketplaceError::Gateway`] if the gateway errs or times out
    ///   (transaction FAILED)
    /// - [`MarketplaceError::InvalidState`] if the transaction is not a
    ///   PENDING card purchase with an intent, or the captured amount differs
    ///   (transaction FAILED)
    pub async fn confirm_with_gateway(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let operation = "orchestrator.confirm_with_gateway";
        let checked = self.check_gateway_payment(transaction_id).await;
        let transaction = match checked {
            Ok(GatewayCheck::AlreadyCompleted(transaction)) => return Ok(transaction),
            Ok(GatewayCheck::Captured) => {
                let outcome = self.settle(transaction_id, Funding::Gateway).await;
                finish(operation, outcome).await?
            },
            Err(error) => {
                log_failure(operation, &error);
                return Err(error);
            },
        };
        tracing::info!(
            transaction_id = %transaction.id,
            number = %transaction.transaction_number,
            amount = %transaction.amount,
            "Purchase completed from gateway payment"
        );
        Ok(transaction)
    }

    async fn check_gateway_payment(&self, transaction_id: TransactionId) -> Result<GatewayCheck> {
        let transaction = self.transaction(transaction_id).await?;
        if transaction.status == TransactionStatus::Completed {
            return Ok(GatewayCheck::AlreadyCompleted(transaction));
        }
        Self::check_pending(&transaction)?;
        if transaction.payment_method != PaymentMethod::Card {
            return Err(MarketplaceError::InvalidState(format!(
                "transaction {} is not a card payment",
                transaction.transaction_number
            )));
        }
        let intent_ref = transaction.payment_intent_ref.clone().ok_or_else(|| {
            MarketplaceError::InvalidState(format!(
                "transaction {} has no payment intent",
                transaction.transaction_number
            ))
        })?;

        let intent = match self.call_gateway(self.gateway.retrieve_intent(&intent_ref)).await {
            Ok(intent) => intent,
            Err(error) => {
                self.fail_quietly(transaction_id, &format!("gateway error: {error}"))
                    .await;
                return Err(MarketplaceError::Gateway(error));
            },
        };

        match intent.status {
            IntentStatus::Succeeded if intent.amount == transaction.amount => Ok(GatewayCheck::Captured),
            IntentStatus::Succeeded => {
                self.fail_quietly(
                    transaction_id,
                    &format!("captured {} but expected {}", intent.amount, transaction.amount),
                )
                .await;
                Err(MarketplaceError::InvalidState(format!(
                    "intent {intent_ref} captured {}, transaction {} is for {}",
                    intent.amount, transaction.transaction_number, transaction.amount
                )))
            },
            IntentStatus::Pending => Err(MarketplaceError::PaymentNotSucceeded {
                intent_ref,
                status: intent.status,
            }),
            IntentStatus::Failed | IntentStatus::Canceled => {
                self.fail_quietly(transaction_id, &format!("payment {}", intent.status))
                    .await;
                Err(MarketplaceError::PaymentNotSucceeded {
                    intent_ref,
                    status: intent.status,
                })
            },
        }
    }

    /// Runs the completion sequence for a PENDING transaction
    async fn settle(&self, transaction_id: TransactionId, funding: Funding) -> Result<(Transaction, PostCommit)> {
        let mut uow = self.store.begin().await?;
        let transaction = Self::load(&mut uow, transaction_id).await?;
        if funding == Funding::Gateway && transaction.status == TransactionStatus::Completed {
            return Ok((transaction, PostCommit::new()));
        }
        self.check_settleable(&mut uow, &transaction, funding).await?;

        let mut post = PostCommit::new();
        let completed = match self.complete_in(&mut uow, transaction, funding, &mut post).await {
            Ok(completed) => uow.commit().await.map(|()| completed),
            Err(error) => {
                drop(uow);
                Err(error)
            },
        };
        match completed {
            Ok(completed) => Ok((completed, post)),
            Err(error) => {
                self.fail_quietly(transaction_id, &error.to_string()).await;
                if funding == Funding::Gateway {
                    tracing::error!(
                        transaction_id = %transaction_id,
                        %error,
                        "Gateway payment captured but purchase could not complete"
                    );
                }
                Err(error)
            },
        }
    }

    /// Checks made before any write; failing them leaves the transaction PENDING
    async fn check_settleable(&self, uow: &mut S::Tx, transaction: &Transaction, funding: Funding) -> Result<()> {
        Self::check_pending(transaction)?;

        let mut participants = Vec::with_capacity(2);
        if let Funding::Wallet { buyer_id } = funding {
            if transaction.buyer_id != buyer_id {
                return Err(MarketplaceError::NotOwner(format!(
                    "user {buyer_id} is not the buyer of transaction {}",
                    transaction.transaction_number
                )));
            }
            if transaction.payment_method != PaymentMethod::Balance {
                return Err(MarketplaceError::InvalidState(format!(
                    "transaction {} is not a balance payment",
                    transaction.transaction_number
                )));
            }
            participants.push(buyer_id);
        }
        if transaction.kind == TransactionType::SecondaryPurchase {
            participants.extend(transaction.seller_id);
        }

        // Wallets are locked in id order so two purchases between the same
        // pair of users cannot deadlock.
        participants.sort_unstable();
        participants.dedup();
        let payer = match funding {
            Funding::Wallet { buyer_id } => Some(buyer_id),
            Funding::Gateway => None,
        };
        let now = self.env.clock.now();
        for user_id in participants {
            let wallet = uow.lock_wallet(user_id, now).await?;
            if payer == Some(user_id) && wallet.balance() < transaction.amount {
                return Err(MarketplaceError::InsufficientBalance {
                    available: wallet.balance(),
                    required: transaction.amount,
                });
            }
        }
        Ok(())
    }

    /// The completion sequence. Every write goes through `uow`.
    async fn complete_in(
        &self,
        uow: &mut S::Tx,
        transaction: Transaction,
        funding: Funding,
        post: &mut PostCommit,
    ) -> Result<Transaction> {
        let reference = LedgerReference::transaction(transaction.id);
        let number = transaction.transaction_number.clone();

        if matches!(funding, Funding::Wallet { .. }) {
            let debit = WalletAction::Debit {
                amount: transaction.amount,
                description: format!("Ticket purchase {number}"),
                reference,
            };
            self.wallets.apply_in(uow, transaction.buyer_id, debit, post).await?;
        }

        match transaction.kind {
            TransactionType::PrimaryPurchase => {
                self.inventory
                    .complete_primary_in(uow, transaction.ticket_id, transaction.buyer_id, post)
                    .await?;
            },
            TransactionType::SecondaryPurchase => {
                let listing_id = transaction.listing_id.ok_or_else(|| {
                    MarketplaceError::InvalidState(format!("transaction {number} has no listing"))
                })?;
                self.listings
                    .mark_sold_in(uow, listing_id, transaction.buyer_id, post)
                    .await?;
                self.inventory
                    .complete_secondary_in(uow, transaction.ticket_id, transaction.buyer_id, post)
                    .await?;
                if let Some(seller_id) = transaction.seller_id {
                    let credit = WalletAction::Credit {
                        amount: transaction.amount,
                        description: format!("Ticket sale {number}"),
                        reference,
                    };
                    self.wallets.apply_in(uow, seller_id, credit, post).await?;
                }
            },
        }

        let completed = self.transition(
            TransactionState::loaded(transaction),
            TransactionAction::Complete,
            post,
        )?;
        uow.save_transaction(&completed).await?;
        let (kind, amount) = (completed.kind, completed.amount);
        post.then(move || metrics::record_purchase_completed(kind, amount));
        Ok(completed)
    }

    /// Initiates and immediately pays a resale purchase from the buyer's wallet
    ///
    /// # Errors
    ///
    /// Those of [`Self::initiate_secondary_purchase`] and [`Self::confirm_with_balance`]
    pub async fn purchase_listing_with_balance(&self, listing_id: ListingId, buyer_id: UserId) -> Result<Transaction> {
        let intent = self
            .initiate_secondary_purchase(listing_id, buyer_id, PaymentMethod::Balance)
            .await?;
        self.confirm_with_balance(intent.transaction.id, buyer_id).await
    }

    // ========================================================================
    // Refunds and failures
    // ========================================================================

    /// Refunds a COMPLETED purchase to the buyer's wallet.
    ///
    /// Card payments are refunded at the gateway first; the wallet is then
    /// credited in every case. Ticket ownership, inventory counters and the
    /// seller's proceeds are left as they are.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown transaction
    /// - [`MarketplaceError::InvalidState`] unless COMPLETED
    /// - [`MarketplaceError::Gateway`] if the gateway refund fails; the
    ///   transaction stays COMPLETED
    pub async fn refund(&self, transaction_id: TransactionId, reason: &str) -> Result<Transaction> {
        let outcome = self.try_refund(transaction_id, reason).await;
        let transaction = finish("orchestrator.refund", outcome).await?;
        tracing::info!(
            transaction_id = %transaction.id,
            number = %transaction.transaction_number,
            amount = %transaction.amount,
            reason,
            "Transaction refunded"
        );
        Ok(transaction)
    }

    async fn try_refund(&self, transaction_id: TransactionId, reason: &str) -> Result<(Transaction, PostCommit)> {
        let transaction = self.transaction(transaction_id).await?;
        if transaction.status != TransactionStatus::Completed {
            return Err(MarketplaceError::InvalidState(format!(
                "transaction {} is {}, only COMPLETED transactions can be refunded",
                transaction.transaction_number, transaction.status
            )));
        }

        if let (PaymentMethod::Card, Some(intent_ref)) =
            (transaction.payment_method, transaction.payment_intent_ref.as_deref())
        {
            // Keyed by transaction: concurrent or retried refunds of the same
            // purchase collapse into one at the gateway.
            let idempotency_key = format!("refund-{transaction_id}");
            let refund_ref = self
                .call_gateway(self.gateway.create_refund(intent_ref, transaction.amount, &idempotency_key))
                .await?;
            tracing::debug!(transaction_id = %transaction_id, refund_ref = %refund_ref, "Gateway refund issued");
        }

        let mut uow = self.store.begin().await?;
        let transaction = Self::load(&mut uow, transaction_id).await?;
        let mut post = PostCommit::new();
        let refunded = self.transition(
            TransactionState::loaded(transaction),
            TransactionAction::Refund {
                reason: reason.to_string(),
            },
            &mut post,
        )?;
        let credit = WalletAction::Refund {
            amount: refunded.amount,
            description: format!("Refund {}: {reason}", refunded.transaction_number),
            reference: LedgerReference::refund(refunded.id),
        };
        self.wallets
            .apply_in(&mut uow, refunded.buyer_id, credit, &mut post)
            .await?;
        uow.save_transaction(&refunded).await?;
        uow.commit().await?;

        let amount = refunded.amount;
        post.then(move || metrics::record_refund(amount));
        Ok((refunded, post))
    }

    /// Marks a PENDING transaction FAILED. Returns `None` when it is no
    /// longer PENDING.
    pub(crate) async fn mark_failed(&self, transaction_id: TransactionId, reason: &str) -> Result<Option<Transaction>> {
        let mut uow = self.store.begin().await?;
        let transaction = Self::load(&mut uow, transaction_id).await?;
        if transaction.status != TransactionStatus::Pending {
            return Ok(None);
        }
        let mut post = PostCommit::new();
        let failed = self.transition(
            TransactionState::loaded(transaction),
            TransactionAction::Fail {
                reason: reason.to_string(),
            },
            &mut post,
        )?;
        uow.save_transaction(&failed).await?;
        uow.commit().await?;

        post.then(|| metrics::record_transaction(TransactionStatus::Failed));
        post.run().await;
        tracing::warn!(
            transaction_id = %failed.id,
            number = %failed.transaction_number,
            reason,
            "Transaction failed"
        );
        Ok(Some(failed))
    }

    async fn fail_quietly(&self, transaction_id: TransactionId, reason: &str) {
        if let Err(error) = self.mark_failed(transaction_id, reason).await {
            tracing::error!(transaction_id = %transaction_id, %error, "Could not mark transaction failed");
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Loads a transaction
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown transaction
    pub async fn transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let mut uow = self.store.begin().await?;
        Self::load(&mut uow, transaction_id).await
    }

    /// Loads a transaction by its `TXN-…` number
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown number
    pub async fn transaction_by_number(&self, number: &str) -> Result<Transaction> {
        let mut uow = self.store.begin().await?;
        uow.find_transaction_by_number(number)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("transaction", number))
    }

    /// The transaction owning a gateway intent, if any
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn transaction_by_intent(&self, intent_ref: &str) -> Result<Option<Transaction>> {
        let mut uow = self.store.begin().await?;
        uow.find_transaction_by_intent(intent_ref).await
    }

    /// Purchases made by a user, newest first
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn transactions_by_buyer(&self, buyer_id: UserId) -> Result<Vec<Transaction>> {
        let mut uow = self.store.begin().await?;
        uow.transactions_by_buyer(buyer_id).await
    }

    /// Sales made by a user, newest first
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn transactions_by_seller(&self, seller_id: UserId) -> Result<Vec<Transaction>> {
        let mut uow = self.store.begin().await?;
        uow.transactions_by_seller(seller_id).await
    }

    /// Sum of the user's COMPLETED sales
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn total_sales_by_user(&self, user_id: UserId) -> Result<Money> {
        Ok(completed_total(&self.transactions_by_seller(user_id).await?))
    }

    /// Sum of the user's COMPLETED purchases
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn total_purchases_by_user(&self, user_id: UserId) -> Result<Money> {
        Ok(completed_total(&self.transactions_by_buyer(user_id).await?))
    }

    /// PENDING transactions opened before `cutoff`, oldest first
    pub(crate) async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let mut uow = self.store.begin().await?;
        uow.pending_transactions_before(cutoff).await
    }

    /// Current time of the service clock
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.env.clock.now()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn transition(
        &self,
        mut state: TransactionState,
        action: TransactionAction,
        post: &mut PostCommit,
    ) -> Result<Transaction> {
        let effects = self.reducer.reduce(&mut state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error);
        }
        post.effects(effects);
        state
            .transaction
            .ok_or_else(|| MarketplaceError::InvalidState("transaction not loaded".to_string()))
    }

    fn check_pending(transaction: &Transaction) -> Result<()> {
        if transaction.status == TransactionStatus::Pending {
            Ok(())
        } else {
            Err(MarketplaceError::InvalidState(format!(
                "transaction {} is {}, expected PENDING",
                transaction.transaction_number, transaction.status
            )))
        }
    }

    async fn call_gateway<T>(&self, call: GatewayFuture<T>) -> GatewayResult<T> {
        tokio::time::timeout(self.payments.gateway_timeout(), call)
            .await
            .unwrap_or(Err(PaymentGatewayError::Timeout))
    }

    async fn load(uow: &mut S::Tx, transaction_id: TransactionId) -> Result<Transaction> {
        uow.find_transaction(transaction_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("transaction", transaction_id))
    }
}

/// Outcome of checking a card payment before completion
enum GatewayCheck {
    AlreadyCompleted(Transaction),
    Captured,
}

fn completed_total(transactions: &[Transaction]) -> Money {
    transactions
        .iter()
        .filter(|txn| txn.status == TransactionStatus::Completed)
        .map(|txn| txn.amount)
        .sum()
}
