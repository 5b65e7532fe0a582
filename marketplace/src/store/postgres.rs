//! `PostgreSQL` store.
//!
//! Each unit of work is one database transaction. Locking reads use
//! `SELECT … FOR UPDATE`, so two purchases of the same ticket queue on the
//! ticket row and the second one sees the first one's result. Wallet rows are
//! created with `INSERT … ON CONFLICT DO NOTHING` before being locked.
//!
//! # Example
//!
//! ```no_run
//! use marketplace::store::PostgresStore;
//! use sqlx::PgPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgresql://localhost/marketplace").await?;
//! let store = PostgresStore::new(pool);
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

use super::{MarketplaceStore, UnitOfWork};
use crate::config::PostgresConfig;
use crate::error::{MarketplaceError, Result};
use crate::types::{
    BalanceLedgerEntry, Event, EventId, LedgerEntryId, LedgerEntryKind, LedgerReference,
    ListingId, ListingStatus, Money, PaymentMethod, PricingTier, PricingTierId, ReferenceKind,
    Ticket, TicketId, TicketListing, TicketStatus, Transaction, TransactionId, TransactionStatus,
    TransactionType, User, UserId, WalletBalance,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> MarketplaceError {
    move |e| MarketplaceError::Storage(format!("Failed to {context}: {e}"))
}

fn counter(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MarketplaceError::Storage(format!("Column {column} out of range: {value}")))
}

fn parsed<T>(value: &str, parse: fn(&str) -> Option<T>, column: &str) -> Result<T> {
    parse(value).ok_or_else(|| MarketplaceError::Storage(format!("Unknown {column}: {value}")))
}

/// `PostgreSQL` [`MarketplaceStore`]
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool sized from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the database is unreachable
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect(&config.url)
            .await
            .map_err(storage("connect to database"))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MarketplaceError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl MarketplaceStore for PostgresStore {
    type Tx = PostgresUnitOfWork;

    async fn begin(&self) -> Result<PostgresUnitOfWork> {
        let tx = self.pool.begin().await.map_err(storage("start transaction"))?;
        Ok(PostgresUnitOfWork { tx })
    }
}

/// Unit of work backed by a database transaction; rolled back on drop
pub struct PostgresUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

// ============================================================================
// Row mapping
// ============================================================================

fn user_from_row(row: &PgRow) -> std::result::Result<User, sqlx::Error> {
    Ok(User {
        id: UserId::from_uuid(row.try_get("id")?),
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn wallet_from_row(row: &PgRow) -> std::result::Result<WalletBalance, sqlx::Error> {
    Ok(WalletBalance {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        balance: Money::from_cents(row.try_get("balance_cents")?),
        last_updated: row.try_get("last_updated")?,
    })
}

fn ledger_from_row(row: &PgRow) -> Result<BalanceLedgerEntry> {
    let decode = || storage("decode ledger entry");
    let kind: String = row.try_get("kind").map_err(decode())?;
    let reference_type: String = row.try_get("reference_type").map_err(decode())?;
    Ok(BalanceLedgerEntry {
        id: LedgerEntryId::from_uuid(row.try_get("id").map_err(decode())?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode())?),
        amount: Money::from_cents(row.try_get("amount_cents").map_err(decode())?),
        kind: parsed(&kind, LedgerEntryKind::parse, "ledger kind")?,
        description: row.try_get("description").map_err(decode())?,
        reference: LedgerReference {
            kind: parsed(&reference_type, ReferenceKind::parse, "reference type")?,
            id: row.try_get("reference_id").map_err(decode())?,
        },
        created_at: row.try_get("created_at").map_err(decode())?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let decode = || storage("decode event");
    let total: i64 = row.try_get("total_tickets").map_err(decode())?;
    let available: i64 = row.try_get("available_tickets").map_err(decode())?;
    Ok(Event {
        id: EventId::from_uuid(row.try_get("id").map_err(decode())?),
        name: row.try_get("name").map_err(decode())?,
        creator_id: row
            .try_get::<Option<Uuid>, _>("creator_id")
            .map_err(decode())?
            .map(UserId::from_uuid),
        venue: row.try_get("venue").map_err(decode())?,
        starts_at: row.try_get("starts_at").map_err(decode())?,
        total_tickets: counter(total, "total_tickets")?,
        available_tickets: counter(available, "available_tickets")?,
        created_at: row.try_get("created_at").map_err(decode())?,
    })
}

fn tier_from_row(row: &PgRow) -> Result<PricingTier> {
    let decode = || storage("decode pricing tier");
    let quantity: i64 = row.try_get("quantity").map_err(decode())?;
    let available: i64 = row.try_get("available").map_err(decode())?;
    Ok(PricingTier {
        id: PricingTierId::from_uuid(row.try_get("id").map_err(decode())?),
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(decode())?),
        name: row.try_get("name").map_err(decode())?,
        section: row.try_get("section").map_err(decode())?,
        price: Money::from_cents(row.try_get("price_cents").map_err(decode())?),
        quantity: counter(quantity, "quantity")?,
        available: counter(available, "available")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket> {
    let decode = || storage("decode ticket");
    let status: String = row.try_get("status").map_err(decode())?;
    Ok(Ticket {
        id: TicketId::from_uuid(row.try_get("id").map_err(decode())?),
        ticket_number: row.try_get("ticket_number").map_err(decode())?,
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(decode())?),
        pricing_tier_id: PricingTierId::from_uuid(row.try_get("pricing_tier_id").map_err(decode())?),
        owner_id: row
            .try_get::<Option<Uuid>, _>("owner_id")
            .map_err(decode())?
            .map(UserId::from_uuid),
        original_price: Money::from_cents(row.try_get("original_price_cents").map_err(decode())?),
        current_price: Money::from_cents(row.try_get("current_price_cents").map_err(decode())?),
        section: row.try_get("section").map_err(decode())?,
        row: row.try_get("seat_row").map_err(decode())?,
        seat: row.try_get("seat").map_err(decode())?,
        status: parsed(&status, TicketStatus::parse, "ticket status")?,
        purchase_date: row.try_get("purchase_date").map_err(decode())?,
        used: row.try_get("used").map_err(decode())?,
        qr_payload: row.try_get("qr_payload").map_err(decode())?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<TicketListing> {
    let decode = || storage("decode listing");
    let status: String = row.try_get("status").map_err(decode())?;
    Ok(TicketListing {
        id: ListingId::from_uuid(row.try_get("id").map_err(decode())?),
        ticket_id: TicketId::from_uuid(row.try_get("ticket_id").map_err(decode())?),
        seller_id: UserId::from_uuid(row.try_get("seller_id").map_err(decode())?),
        asking_price: Money::from_cents(row.try_get("asking_price_cents").map_err(decode())?),
        description: row.try_get("description").map_err(decode())?,
        listing_date: row.try_get("listing_date").map_err(decode())?,
        status: parsed(&status, ListingStatus::parse, "listing status")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let decode = || storage("decode transaction");
    let kind: String = row.try_get("kind").map_err(decode())?;
    let status: String = row.try_get("status").map_err(decode())?;
    let method: String = row.try_get("payment_method").map_err(decode())?;
    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(decode())?),
        transaction_number: row.try_get("transaction_number").map_err(decode())?,
        amount: Money::from_cents(row.try_get("amount_cents").map_err(decode())?),
        kind: parsed(&kind, TransactionType::parse, "transaction kind")?,
        status: parsed(&status, TransactionStatus::parse, "transaction status")?,
        buyer_id: UserId::from_uuid(row.try_get("buyer_id").map_err(decode())?),
        seller_id: row
            .try_get::<Option<Uuid>, _>("seller_id")
            .map_err(decode())?
            .map(UserId::from_uuid),
        ticket_id: TicketId::from_uuid(row.try_get("ticket_id").map_err(decode())?),
        listing_id: row
            .try_get::<Option<Uuid>, _>("listing_id")
            .map_err(decode())?
            .map(ListingId::from_uuid),
        payment_method: parsed(&method, PaymentMethod::parse, "payment method")?,
        payment_intent_ref: row.try_get("payment_intent_ref").map_err(decode())?,
        failure_reason: row.try_get("failure_reason").map_err(decode())?,
        refund_reason: row.try_get("refund_reason").map_err(decode())?,
        transaction_date: row.try_get("transaction_date").map_err(decode())?,
        completed_at: row.try_get("completed_at").map_err(decode())?,
        refunded_at: row.try_get("refunded_at").map_err(decode())?,
    })
}

const TICKET_COLUMNS: &str = "id, ticket_number, event_id, pricing_tier_id, owner_id, \
     original_price_cents, current_price_cents, section, seat_row, seat, status, \
     purchase_date, used, qr_payload";

const LISTING_COLUMNS: &str =
    "id, ticket_id, seller_id, asking_price_cents, description, listing_date, status";

const TRANSACTION_COLUMNS: &str = "id, transaction_number, amount_cents, kind, status, \
     buyer_id, seller_id, ticket_id, listing_id, payment_method, payment_intent_ref, \
     failure_reason, refund_reason, transaction_date, completed_at, refunded_at";

impl PostgresUnitOfWork {
    async fn fetch_tickets(&mut self, filter: &str, id: Uuid) -> Result<Vec<Ticket>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE {filter} = $1 ORDER BY ticket_number");
        sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list tickets"))?
            .iter()
            .map(ticket_from_row)
            .collect()
    }

    async fn fetch_transactions(&mut self, filter: &str, id: Uuid) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE {filter} = $1 \
             ORDER BY transaction_date DESC"
        );
        sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list transactions"))?
            .iter()
            .map(transaction_from_row)
            .collect()
    }

    async fn fetch_transaction(&mut self, filter: &str, value: &str) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE {filter} = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query transaction"))?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }
}

impl UnitOfWork for PostgresUnitOfWork {
    async fn find_user(&mut self, id: UserId) -> Result<Option<User>> {
        sqlx::query("SELECT id, username, email, created_at FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query user"))?
            .as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(storage("decode user"))
    }

    async fn insert_user(&mut self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (id, username, email, created_at) VALUES ($1, $2, $3, $4)")
            .bind(user.id.as_uuid())
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("insert user"))?;
        Ok(())
    }

    async fn lock_wallet(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<WalletBalance> {
        sqlx::query(
            "INSERT INTO wallet_balances (user_id, balance_cents, last_updated)
             VALUES ($1, 0, $2)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("create wallet"))?;

        let row = sqlx::query(
            "SELECT user_id, balance_cents, last_updated
             FROM wallet_balances
             WHERE user_id = $1
             FOR UPDATE",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage("lock wallet"))?;

        wallet_from_row(&row).map_err(storage("decode wallet"))
    }

    async fn save_wallet(&mut self, wallet: &WalletBalance) -> Result<()> {
        sqlx::query(
            "UPDATE wallet_balances SET balance_cents = $2, last_updated = $3 WHERE user_id = $1",
        )
        .bind(wallet.user_id.as_uuid())
        .bind(wallet.balance.cents())
        .bind(wallet.last_updated)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("update wallet"))?;
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &BalanceLedgerEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO balance_ledger_entries
                (id, user_id, amount_cents, kind, description, reference_type, reference_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id.as_uuid())
        .bind(entry.user_id.as_uuid())
        .bind(entry.amount.cents())
        .bind(entry.kind.as_str())
        .bind(&entry.description)
        .bind(entry.reference.kind.as_str())
        .bind(entry.reference.id)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("append ledger entry"))?;
        Ok(())
    }

    async fn ledger_entries(&mut self, user_id: UserId) -> Result<Vec<BalanceLedgerEntry>> {
        sqlx::query(
            "SELECT id, user_id, amount_cents, kind, description, reference_type, reference_id, created_at
             FROM balance_ledger_entries
             WHERE user_id = $1
             ORDER BY created_at DESC, seq DESC",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage("list ledger entries"))?
        .iter()
        .map(ledger_from_row)
        .collect()
    }

    async fn find_event(&mut self, id: EventId) -> Result<Option<Event>> {
        sqlx::query(
            "SELECT id, name, creator_id, venue, starts_at, total_tickets, available_tickets, created_at
             FROM events WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage("query event"))?
        .as_ref()
        .map(event_from_row)
        .transpose()
    }

    async fn save_event(&mut self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events
                (id, name, creator_id, venue, starts_at, total_tickets, available_tickets, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                venue = EXCLUDED.venue,
                starts_at = EXCLUDED.starts_at,
                total_tickets = EXCLUDED.total_tickets,
                available_tickets = EXCLUDED.available_tickets",
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(event.creator_id.map(|id| *id.as_uuid()))
        .bind(&event.venue)
        .bind(event.starts_at)
        .bind(i64::from(event.total_tickets))
        .bind(i64::from(event.available_tickets))
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("save event"))?;
        Ok(())
    }

    async fn find_tier(&mut self, id: PricingTierId) -> Result<Option<PricingTier>> {
        sqlx::query(
            "SELECT id, event_id, name, section, price_cents, quantity, available
             FROM pricing_tiers WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage("query pricing tier"))?
        .as_ref()
        .map(tier_from_row)
        .transpose()
    }

    async fn save_tier(&mut self, tier: &PricingTier) -> Result<()> {
        sqlx::query(
            "INSERT INTO pricing_tiers (id, event_id, name, section, price_cents, quantity, available)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                available = EXCLUDED.available",
        )
        .bind(tier.id.as_uuid())
        .bind(tier.event_id.as_uuid())
        .bind(&tier.name)
        .bind(&tier.section)
        .bind(tier.price.cents())
        .bind(i64::from(tier.quantity))
        .bind(i64::from(tier.available))
        .execute(&mut *self.tx)
        .await
        .map_err(storage("save pricing tier"))?;
        Ok(())
    }

    async fn tiers_for_event(&mut self, event_id: EventId) -> Result<Vec<PricingTier>> {
        sqlx::query(
            "SELECT id, event_id, name, section, price_cents, quantity, available
             FROM pricing_tiers WHERE event_id = $1 ORDER BY name",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage("list pricing tiers"))?
        .iter()
        .map(tier_from_row)
        .collect()
    }

    async fn find_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query ticket"))?
            .as_ref()
            .map(ticket_from_row)
            .transpose()
    }

    async fn save_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        sqlx::query(
            "INSERT INTO tickets
                (id, ticket_number, event_id, pricing_tier_id, owner_id, original_price_cents,
                 current_price_cents, section, seat_row, seat, status, purchase_date, used, qr_payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                current_price_cents = EXCLUDED.current_price_cents,
                status = EXCLUDED.status,
                purchase_date = EXCLUDED.purchase_date,
                used = EXCLUDED.used",
        )
        .bind(ticket.id.as_uuid())
        .bind(&ticket.ticket_number)
        .bind(ticket.event_id.as_uuid())
        .bind(ticket.pricing_tier_id.as_uuid())
        .bind(ticket.owner_id.map(|id| *id.as_uuid()))
        .bind(ticket.original_price.cents())
        .bind(ticket.current_price.cents())
        .bind(&ticket.section)
        .bind(&ticket.row)
        .bind(&ticket.seat)
        .bind(ticket.status.as_str())
        .bind(ticket.purchase_date)
        .bind(ticket.used)
        .bind(&ticket.qr_payload)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("save ticket"))?;
        Ok(())
    }

    async fn tickets_for_event(&mut self, event_id: EventId) -> Result<Vec<Ticket>> {
        self.fetch_tickets("event_id", *event_id.as_uuid()).await
    }

    async fn unsold_tickets_for_tier(&mut self, tier_id: PricingTierId) -> Result<Vec<Ticket>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets t
             WHERE t.pricing_tier_id = $1 AND t.status = 'AVAILABLE'
               AND NOT EXISTS (SELECT 1 FROM transactions x WHERE x.ticket_id = t.id)
             ORDER BY t.ticket_number
             FOR UPDATE"
        );
        sqlx::query(&sql)
            .bind(tier_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list unsold tickets"))?
            .iter()
            .map(ticket_from_row)
            .collect()
    }

    async fn delete_ticket(&mut self, id: TicketId) -> Result<()> {
        sqlx::query("DELETE FROM tickets WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(storage("delete ticket"))?;
        Ok(())
    }

    async fn tickets_owned_by(&mut self, owner_id: UserId) -> Result<Vec<Ticket>> {
        self.fetch_tickets("owner_id", *owner_id.as_uuid()).await
    }

    async fn find_listing(&mut self, id: ListingId) -> Result<Option<TicketListing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM ticket_listings WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query listing"))?
            .as_ref()
            .map(listing_from_row)
            .transpose()
    }

    async fn find_listing_by_ticket(&mut self, ticket_id: TicketId) -> Result<Option<TicketListing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM ticket_listings WHERE ticket_id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(ticket_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query listing by ticket"))?
            .as_ref()
            .map(listing_from_row)
            .transpose()
    }

    async fn save_listing(&mut self, listing: &TicketListing) -> Result<()> {
        sqlx::query(
            "INSERT INTO ticket_listings
                (id, ticket_id, seller_id, asking_price_cents, description, listing_date, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                seller_id = EXCLUDED.seller_id,
                asking_price_cents = EXCLUDED.asking_price_cents,
                description = EXCLUDED.description,
                listing_date = EXCLUDED.listing_date,
                status = EXCLUDED.status",
        )
        .bind(listing.id.as_uuid())
        .bind(listing.ticket_id.as_uuid())
        .bind(listing.seller_id.as_uuid())
        .bind(listing.asking_price.cents())
        .bind(&listing.description)
        .bind(listing.listing_date)
        .bind(listing.status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => MarketplaceError::DuplicateListing {
                ticket_id: listing.ticket_id,
            },
            _ => MarketplaceError::Storage(format!("Failed to save listing: {e}")),
        })?;
        Ok(())
    }

    async fn listings_by_seller(&mut self, seller_id: UserId) -> Result<Vec<TicketListing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM ticket_listings WHERE seller_id = $1 ORDER BY listing_date DESC"
        );
        sqlx::query(&sql)
            .bind(seller_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list seller listings"))?
            .iter()
            .map(listing_from_row)
            .collect()
    }

    async fn active_listings_for_event(&mut self, event_id: EventId) -> Result<Vec<TicketListing>> {
        sqlx::query(
            "SELECT l.id, l.ticket_id, l.seller_id, l.asking_price_cents, l.description,
                    l.listing_date, l.status
             FROM ticket_listings l
             JOIN tickets t ON t.id = l.ticket_id
             WHERE t.event_id = $1 AND l.status = 'ACTIVE'
             ORDER BY l.asking_price_cents, l.listing_date",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage("list active listings"))?
        .iter()
        .map(listing_from_row)
        .collect()
    }

    async fn find_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("query transaction"))?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }

    async fn find_transaction_by_number(&mut self, number: &str) -> Result<Option<Transaction>> {
        self.fetch_transaction("transaction_number", number).await
    }

    async fn find_transaction_by_intent(&mut self, intent_ref: &str) -> Result<Option<Transaction>> {
        self.fetch_transaction("payment_intent_ref", intent_ref).await
    }

    async fn save_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO transactions
                (id, transaction_number, amount_cents, kind, status, buyer_id, seller_id, ticket_id,
                 listing_id, payment_method, payment_intent_ref, failure_reason, refund_reason,
                 transaction_date, completed_at, refunded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                payment_intent_ref = EXCLUDED.payment_intent_ref,
                failure_reason = EXCLUDED.failure_reason,
                refund_reason = EXCLUDED.refund_reason,
                completed_at = EXCLUDED.completed_at,
                refunded_at = EXCLUDED.refunded_at",
        )
        .bind(transaction.id.as_uuid())
        .bind(&transaction.transaction_number)
        .bind(transaction.amount.cents())
        .bind(transaction.kind.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.buyer_id.as_uuid())
        .bind(transaction.seller_id.map(|id| *id.as_uuid()))
        .bind(transaction.ticket_id.as_uuid())
        .bind(transaction.listing_id.map(|id| *id.as_uuid()))
        .bind(transaction.payment_method.as_str())
        .bind(&transaction.payment_intent_ref)
        .bind(&transaction.failure_reason)
        .bind(&transaction.refund_reason)
        .bind(transaction.transaction_date)
        .bind(transaction.completed_at)
        .bind(transaction.refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("save transaction"))?;
        Ok(())
    }

    async fn transactions_by_buyer(&mut self, buyer_id: UserId) -> Result<Vec<Transaction>> {
        self.fetch_transactions("buyer_id", *buyer_id.as_uuid()).await
    }

    async fn transactions_by_seller(&mut self, seller_id: UserId) -> Result<Vec<Transaction>> {
        self.fetch_transactions("seller_id", *seller_id.as_uuid()).await
    }

    async fn pending_transactions_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE status = 'PENDING' AND transaction_date < $1
             ORDER BY transaction_date"
        );
        sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list pending transactions"))?
            .iter()
            .map(transaction_from_row)
            .collect()
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(storage("commit transaction"))
    }
}
