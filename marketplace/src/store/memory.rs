//! In-memory store for tests and the demo binary.
//!
//! A single async mutex guards all tables, so units of work are fully
//! serialised. Writes go to a private copy of the tables, taken on the first
//! write, which replaces the shared tables on commit.

use super::{MarketplaceStore, UnitOfWork};
use crate::error::Result;
use crate::types::{
    BalanceLedgerEntry, Event, EventId, ListingId, ListingStatus, PricingTier, PricingTierId,
    Ticket, TicketId, TicketListing, TicketStatus, Transaction, TransactionId, TransactionStatus,
    User, UserId, WalletBalance,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    wallets: HashMap<UserId, WalletBalance>,
    ledger: Vec<BalanceLedgerEntry>,
    events: HashMap<EventId, Event>,
    tiers: HashMap<PricingTierId, PricingTier>,
    tickets: HashMap<TicketId, Ticket>,
    listings: HashMap<ListingId, TicketListing>,
    transactions: HashMap<TransactionId, Transaction>,
}

/// In-memory [`MarketplaceStore`]. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarketplaceStore for InMemoryStore {
    type Tx = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<InMemoryUnitOfWork> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        Ok(InMemoryUnitOfWork {
            guard,
            working: None,
        })
    }
}

/// Unit of work over [`InMemoryStore`]
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    working: Option<Tables>,
}

impl InMemoryUnitOfWork {
    fn read(&self) -> &Tables {
        self.working.as_ref().unwrap_or(&self.guard)
    }

    fn write(&mut self) -> &mut Tables {
        let guard = &self.guard;
        self.working.get_or_insert_with(|| Tables::clone(guard))
    }
}

fn sorted_by<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(key);
    rows
}

impl UnitOfWork for InMemoryUnitOfWork {
    async fn find_user(&mut self, id: UserId) -> Result<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    async fn insert_user(&mut self, user: &User) -> Result<()> {
        self.write().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn lock_wallet(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<WalletBalance> {
        if let Some(wallet) = self.read().wallets.get(&user_id) {
            return Ok(wallet.clone());
        }
        let wallet = WalletBalance::empty(user_id, now);
        self.write().wallets.insert(user_id, wallet.clone());
        Ok(wallet)
    }

    async fn save_wallet(&mut self, wallet: &WalletBalance) -> Result<()> {
        self.write().wallets.insert(wallet.user_id, wallet.clone());
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &BalanceLedgerEntry) -> Result<()> {
        self.write().ledger.push(entry.clone());
        Ok(())
    }

    async fn ledger_entries(&mut self, user_id: UserId) -> Result<Vec<BalanceLedgerEntry>> {
        // Stable sort over reversed insertion order keeps newest-first among equal timestamps.
        let rows: Vec<_> = self
            .read()
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |entry| std::cmp::Reverse(entry.created_at)))
    }

    async fn find_event(&mut self, id: EventId) -> Result<Option<Event>> {
        Ok(self.read().events.get(&id).cloned())
    }

    async fn save_event(&mut self, event: &Event) -> Result<()> {
        self.write().events.insert(event.id, event.clone());
        Ok(())
    }

    async fn find_tier(&mut self, id: PricingTierId) -> Result<Option<PricingTier>> {
        Ok(self.read().tiers.get(&id).cloned())
    }

    async fn save_tier(&mut self, tier: &PricingTier) -> Result<()> {
        self.write().tiers.insert(tier.id, tier.clone());
        Ok(())
    }

    async fn tiers_for_event(&mut self, event_id: EventId) -> Result<Vec<PricingTier>> {
        let rows = self
            .read()
            .tiers
            .values()
            .filter(|tier| tier.event_id == event_id)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |tier| tier.name.clone()))
    }

    async fn find_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>> {
        Ok(self.read().tickets.get(&id).cloned())
    }

    async fn save_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.write().tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn tickets_for_event(&mut self, event_id: EventId) -> Result<Vec<Ticket>> {
        let rows = self
            .read()
            .tickets
            .values()
            .filter(|ticket| ticket.event_id == event_id)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |ticket| ticket.ticket_number.clone()))
    }

    async fn unsold_tickets_for_tier(&mut self, tier_id: PricingTierId) -> Result<Vec<Ticket>> {
        let tables = self.read();
        let rows = tables
            .tickets
            .values()
            .filter(|ticket| ticket.pricing_tier_id == tier_id && ticket.status == TicketStatus::Available)
            .filter(|ticket| !tables.transactions.values().any(|txn| txn.ticket_id == ticket.id))
            .cloned()
            .collect();
        Ok(sorted_by(rows, |ticket| ticket.ticket_number.clone()))
    }

    async fn delete_ticket(&mut self, id: TicketId) -> Result<()> {
        self.write().tickets.remove(&id);
        Ok(())
    }

    async fn tickets_owned_by(&mut self, owner_id: UserId) -> Result<Vec<Ticket>> {
        let rows = self
            .read()
            .tickets
            .values()
            .filter(|ticket| ticket.owner_id == Some(owner_id))
            .cloned()
            .collect();
        Ok(sorted_by(rows, |ticket| ticket.ticket_number.clone()))
    }

    async fn find_listing(&mut self, id: ListingId) -> Result<Option<TicketListing>> {
        Ok(self.read().listings.get(&id).cloned())
    }

    async fn find_listing_by_ticket(&mut self, ticket_id: TicketId) -> Result<Option<TicketListing>> {
        Ok(self
            .read()
            .listings
            .values()
            .find(|listing| listing.ticket_id == ticket_id)
            .cloned())
    }

    async fn save_listing(&mut self, listing: &TicketListing) -> Result<()> {
        self.write().listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn listings_by_seller(&mut self, seller_id: UserId) -> Result<Vec<TicketListing>> {
        let rows = self
            .read()
            .listings
            .values()
            .filter(|listing| listing.seller_id == seller_id)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |listing| std::cmp::Reverse(listing.listing_date)))
    }

    async fn active_listings_for_event(&mut self, event_id: EventId) -> Result<Vec<TicketListing>> {
        let tables = self.read();
        let rows = tables
            .listings
            .values()
            .filter(|listing| listing.status == ListingStatus::Active)
            .filter(|listing| {
                tables
                    .tickets
                    .get(&listing.ticket_id)
                    .is_some_and(|ticket| ticket.event_id == event_id)
            })
            .cloned()
            .collect();
        Ok(sorted_by(rows, |listing| (listing.asking_price, listing.listing_date)))
    }

    async fn find_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.read().transactions.get(&id).cloned())
    }

    async fn find_transaction_by_number(&mut self, number: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read()
            .transactions
            .values()
            .find(|txn| txn.transaction_number == number)
            .cloned())
    }

    async fn find_transaction_by_intent(&mut self, intent_ref: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read()
            .transactions
            .values()
            .find(|txn| txn.payment_intent_ref.as_deref() == Some(intent_ref))
            .cloned())
    }

    async fn save_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.write()
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn transactions_by_buyer(&mut self, buyer_id: UserId) -> Result<Vec<Transaction>> {
        let rows = self
            .read()
            .transactions
            .values()
            .filter(|txn| txn.buyer_id == buyer_id)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |txn| std::cmp::Reverse(txn.transaction_date)))
    }

    async fn transactions_by_seller(&mut self, seller_id: UserId) -> Result<Vec<Transaction>> {
        let rows = self
            .read()
            .transactions
            .values()
            .filter(|txn| txn.seller_id == Some(seller_id))
            .cloned()
            .collect();
        Ok(sorted_by(rows, |txn| std::cmp::Reverse(txn.transaction_date)))
    }

    async fn pending_transactions_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let rows = self
            .read()
            .transactions
            .values()
            .filter(|txn| txn.status == TransactionStatus::Pending && txn.transaction_date < cutoff)
            .cloned()
            .collect();
        Ok(sorted_by(rows, |txn| txn.transaction_date))
    }

    async fn commit(mut self) -> Result<()> {
        if let Some(working) = self.working.take() {
            *self.guard = working;
        }
        Ok(())
    }
}
