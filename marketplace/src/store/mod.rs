//! Persistence layer.
//!
//! Services never talk to storage directly. They open a [`UnitOfWork`] from a
//! [`MarketplaceStore`], load the rows a command needs, run the reducer, save
//! the outcome and [`UnitOfWork::commit`]. Dropping a unit of work without
//! committing discards every write made through it.
//!
//! `find_*` methods are locking reads: in `PostgreSQL` they take a row lock
//! (`SELECT … FOR UPDATE`) that is held until the unit of work ends, and the
//! in-memory store serialises whole units of work. A check made after a
//! `find_*` therefore stays true until commit.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::types::{
    BalanceLedgerEntry, Event, EventId, ListingId, PricingTier, PricingTierId, Ticket, TicketId,
    TicketListing, Transaction, TransactionId, User, UserId, WalletBalance,
};
use chrono::{DateTime, Utc};
use std::future::Future;

/// Factory for units of work
pub trait MarketplaceStore: Send + Sync + 'static {
    /// Unit of work type
    type Tx: UnitOfWork;

    /// Opens a new unit of work
    ///
    /// # Errors
    ///
    /// Returns [`crate::MarketplaceError::Storage`] if the store is unreachable
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// One atomic unit of work against the store.
///
/// All methods return [`crate::MarketplaceError::Storage`] on storage failure.
#[allow(clippy::missing_errors_doc)]
pub trait UnitOfWork: Send {
    // ----- users -----

    /// Loads a user
    fn find_user(&mut self, id: UserId) -> impl Future<Output = Result<Option<User>>> + Send;

    /// Inserts a new user
    fn insert_user(&mut self, user: &User) -> impl Future<Output = Result<()>> + Send;

    // ----- wallets -----

    /// Loads and locks a user's wallet, creating a zero balance on first access
    fn lock_wallet(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<WalletBalance>> + Send;

    /// Persists a wallet previously returned by `lock_wallet`
    fn save_wallet(&mut self, wallet: &WalletBalance) -> impl Future<Output = Result<()>> + Send;

    /// Appends an immutable ledger entry
    fn append_ledger_entry(
        &mut self,
        entry: &BalanceLedgerEntry,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ledger of a user, most recent first (insertion order breaks ties)
    fn ledger_entries(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<BalanceLedgerEntry>>> + Send;

    // ----- events and tiers -----

    /// Loads an event
    fn find_event(&mut self, id: EventId) -> impl Future<Output = Result<Option<Event>>> + Send;

    /// Inserts or updates an event
    fn save_event(&mut self, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Loads a pricing tier
    fn find_tier(
        &mut self,
        id: PricingTierId,
    ) -> impl Future<Output = Result<Option<PricingTier>>> + Send;

    /// Inserts or updates a pricing tier
    fn save_tier(&mut self, tier: &PricingTier) -> impl Future<Output = Result<()>> + Send;

    /// Tiers of an event, by name
    fn tiers_for_event(
        &mut self,
        event_id: EventId,
    ) -> impl Future<Output = Result<Vec<PricingTier>>> + Send;

    // ----- tickets -----

    /// Loads a ticket
    fn find_ticket(&mut self, id: TicketId) -> impl Future<Output = Result<Option<Ticket>>> + Send;

    /// Inserts or updates a ticket
    fn save_ticket(&mut self, ticket: &Ticket) -> impl Future<Output = Result<()>> + Send;

    /// Tickets of an event, by ticket number
    fn tickets_for_event(
        &mut self,
        event_id: EventId,
    ) -> impl Future<Output = Result<Vec<Ticket>>> + Send;

    /// AVAILABLE tickets of a tier that no transaction references, by ticket
    /// number. These can be withdrawn without orphaning a purchase.
    fn unsold_tickets_for_tier(
        &mut self,
        tier_id: PricingTierId,
    ) -> impl Future<Output = Result<Vec<Ticket>>> + Send;

    /// Deletes a withdrawn ticket
    fn delete_ticket(&mut self, id: TicketId) -> impl Future<Output = Result<()>> + Send;

    /// Tickets owned by a user, by ticket number
    fn tickets_owned_by(
        &mut self,
        owner_id: UserId,
    ) -> impl Future<Output = Result<Vec<Ticket>>> + Send;

    // ----- listings -----

    /// Loads a listing
    fn find_listing(
        &mut self,
        id: ListingId,
    ) -> impl Future<Output = Result<Option<TicketListing>>> + Send;

    /// The listing record of a ticket, whatever its status (at most one exists)
    fn find_listing_by_ticket(
        &mut self,
        ticket_id: TicketId,
    ) -> impl Future<Output = Result<Option<TicketListing>>> + Send;

    /// Inserts or updates a listing
    fn save_listing(&mut self, listing: &TicketListing) -> impl Future<Output = Result<()>> + Send;

    /// Listings of a seller, newest first
    fn listings_by_seller(
        &mut self,
        seller_id: UserId,
    ) -> impl Future<Output = Result<Vec<TicketListing>>> + Send;

    /// ACTIVE listings for an event, cheapest first
    fn active_listings_for_event(
        &mut self,
        event_id: EventId,
    ) -> impl Future<Output = Result<Vec<TicketListing>>> + Send;

    // ----- transactions -----

    /// Loads a transaction
    fn find_transaction(
        &mut self,
        id: TransactionId,
    ) -> impl Future<Output = Result<Option<Transaction>>> + Send;

    /// Loads a transaction by its printed number
    fn find_transaction_by_number(
        &mut self,
        number: &str,
    ) -> impl Future<Output = Result<Option<Transaction>>> + Send;

    /// Loads the transaction that owns a gateway intent
    fn find_transaction_by_intent(
        &mut self,
        intent_ref: &str,
    ) -> impl Future<Output = Result<Option<Transaction>>> + Send;

    /// Inserts or updates a transaction
    fn save_transaction(
        &mut self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Transactions a user bought, newest first
    fn transactions_by_buyer(
        &mut self,
        buyer_id: UserId,
    ) -> impl Future<Output = Result<Vec<Transaction>>> + Send;

    /// Transactions a user sold, newest first
    fn transactions_by_seller(
        &mut self,
        seller_id: UserId,
    ) -> impl Future<Output = Result<Vec<Transaction>>> + Send;

    /// PENDING transactions created before `cutoff`, oldest first
    fn pending_transactions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Transaction>>> + Send;

    /// Makes every write of this unit of work visible atomically
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
