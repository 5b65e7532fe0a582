//! Domain types for the ticket marketplace.
//!
//! Identifiers, the cents-based [`Money`] value object, lifecycle enums and
//! the persisted entities. Entity fields are crate-private: outside this
//! crate they are read through accessors and changed only through the
//! services, so the invariants enforced by the reducers cannot be bypassed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Creates a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a user account
    UserId
);
uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a pricing tier
    PricingTierId
);
uuid_id!(
    /// Unique identifier for a ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for a resale listing
    ListingId
);
uuid_id!(
    /// Unique identifier for a purchase transaction
    TransactionId
);
uuid_id!(
    /// Unique identifier for a wallet ledger entry
    LedgerEntryId
);

/// Generates a human-facing number such as `TKT-3F9A0C1B22D4`.
pub(crate) fn generate_number(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", simple[..12].to_uppercase())
}

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Monetary amount in cents.
///
/// Signed so that a caller-supplied zero or negative amount can be
/// represented and rejected with `InvalidAmount` instead of silently wrapping.
/// Stored balances never go below zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole dollars, saturating at the `i64` bounds
    #[must_use]
    pub const fn from_dollars(dollars: i64) -> Self {
        Self(dollars.saturating_mul(100))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Checks if the amount is strictly greater than zero
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts, `None` on overflow
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts two amounts, `None` on overflow
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Negated amount
    #[must_use]
    pub const fn negate(self) -> Self {
        Self(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|m| m.0).fold(0, i64::saturating_add))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

// ============================================================================
// Lifecycle enums
// ============================================================================

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical storage representation
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Parses the storage representation
            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Ticket lifecycle.
///
/// `Available → Purchased → Listed → Resold`, with `Listed → Purchased` on
/// listing cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// In primary inventory, no owner
    Available,
    /// Owned after a primary purchase (or a cancelled listing)
    Purchased,
    /// Owned and offered on the resale market
    Listed,
    /// Owned by a buyer from the resale market
    Resold,
}

string_enum!(TicketStatus {
    Available => "AVAILABLE",
    Purchased => "PURCHASED",
    Listed => "LISTED",
    Resold => "RESOLD",
});

/// Resale listing lifecycle. `Sold` is terminal; `Cancelled` can be reactivated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingStatus {
    /// Open for purchase
    Active,
    /// Bought through the orchestrator
    Sold,
    /// Withdrawn by the seller
    Cancelled,
}

string_enum!(ListingStatus {
    Active => "ACTIVE",
    Sold => "SOLD",
    Cancelled => "CANCELLED",
});

/// Transaction state machine.
///
/// `Pending → Completed | Failed`, `Completed → Refunded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Created, awaiting payment confirmation
    Pending,
    /// Payment confirmed and ownership transferred
    Completed,
    /// Payment or completion failed (terminal)
    Failed,
    /// Money returned to the buyer (terminal)
    Refunded,
}

string_enum!(TransactionStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Refunded => "REFUNDED",
});

impl TransactionStatus {
    /// `Failed` and `Refunded` accept no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded)
    }
}

/// Primary (from event inventory) or secondary (resale) purchase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// First sale from event inventory
    PrimaryPurchase,
    /// Purchase of an active listing
    SecondaryPurchase,
}

string_enum!(TransactionType {
    PrimaryPurchase => "PRIMARY_PURCHASE",
    SecondaryPurchase => "SECONDARY_PURCHASE",
});

/// How the buyer pays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// External card payment through the gateway
    Card,
    /// Internal wallet balance
    Balance,
}

string_enum!(PaymentMethod {
    Card => "card",
    Balance => "balance",
});

impl PaymentMethod {
    /// Parses a client-supplied method name; `credit_card` is accepted as a card alias
    #[must_use]
    pub fn from_client(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "card" | "credit_card" => Some(Self::Card),
            "balance" => Some(Self::Balance),
            _ => None,
        }
    }
}

/// Kind of wallet ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEntryKind {
    /// Money added (sale proceeds, top-up)
    Credit,
    /// Money spent on a purchase
    Debit,
    /// Money returned for a refunded transaction
    Refund,
    /// Money taken out of the system
    Withdrawal,
}

string_enum!(LedgerEntryKind {
    Credit => "CREDIT",
    Debit => "DEBIT",
    Refund => "REFUND",
    Withdrawal => "WITHDRAWAL",
});

impl LedgerEntryKind {
    /// Credits and refunds increase the balance
    #[must_use]
    pub const fn is_inflow(&self) -> bool {
        matches!(self, Self::Credit | Self::Refund)
    }
}

/// What caused a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// A purchase transaction
    Transaction,
    /// A refund of a purchase transaction
    Refund,
    /// An administrative action (top-up, withdrawal)
    Admin,
}

string_enum!(ReferenceKind {
    Transaction => "Transaction",
    Refund => "Refund",
    Admin => "Admin",
});

/// Link from a ledger entry back to its cause
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerReference {
    /// Reference type
    pub kind: ReferenceKind,
    /// Referenced id (absent for administrative actions)
    pub id: Option<Uuid>,
}

impl LedgerReference {
    /// Reference to a purchase transaction
    #[must_use]
    pub const fn transaction(id: TransactionId) -> Self {
        Self {
            kind: ReferenceKind::Transaction,
            id: Some(id.0),
        }
    }

    /// Reference to the refund of a transaction
    #[must_use]
    pub const fn refund(id: TransactionId) -> Self {
        Self {
            kind: ReferenceKind::Refund,
            id: Some(id.0),
        }
    }

    /// Administrative reference
    #[must_use]
    pub const fn admin() -> Self {
        Self {
            kind: ReferenceKind::Admin,
            id: None,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// User identity. Balances live in [`WalletBalance`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: UserId,
    /// Display name
    pub username: String,
    /// Contact email
    pub email: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new `User`
    #[must_use]
    pub fn new(username: String, email: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: UserId::new(),
            username,
            email,
            created_at,
        }
    }
}

/// A user's stored-value wallet. Never negative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub(crate) user_id: UserId,
    pub(crate) balance: Money,
    pub(crate) last_updated: DateTime<Utc>,
}

impl WalletBalance {
    /// A zero balance for `user_id`
    #[must_use]
    pub const fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: Money::ZERO,
            last_updated: now,
        }
    }

    /// Owner
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Current balance
    #[must_use]
    pub const fn balance(&self) -> Money {
        self.balance
    }

    /// Last mutation time
    #[must_use]
    pub const fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

/// Immutable record of a single balance change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLedgerEntry {
    pub(crate) id: LedgerEntryId,
    pub(crate) user_id: UserId,
    pub(crate) amount: Money,
    pub(crate) kind: LedgerEntryKind,
    pub(crate) description: String,
    pub(crate) reference: LedgerReference,
    pub(crate) created_at: DateTime<Utc>,
}

impl BalanceLedgerEntry {
    /// Entry id
    #[must_use]
    pub const fn id(&self) -> LedgerEntryId {
        self.id
    }

    /// Wallet owner
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Unsigned amount (always positive)
    #[must_use]
    pub const fn amount(&self) -> Money {
        self.amount
    }

    /// Amount with the sign of its effect on the balance
    #[must_use]
    pub const fn signed_amount(&self) -> Money {
        if self.kind.is_inflow() {
            self.amount
        } else {
            self.amount.negate()
        }
    }

    /// Entry kind
    #[must_use]
    pub const fn kind(&self) -> LedgerEntryKind {
        self.kind
    }

    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Cause of the entry
    #[must_use]
    pub const fn reference(&self) -> LedgerReference {
        self.reference
    }

    /// Creation time
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// An event (concert, match, conference). Counters mirror its pricing tiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub(crate) id: EventId,
    pub(crate) name: String,
    pub(crate) creator_id: Option<UserId>,
    pub(crate) venue: String,
    pub(crate) starts_at: DateTime<Utc>,
    pub(crate) total_tickets: u32,
    pub(crate) available_tickets: u32,
    pub(crate) created_at: DateTime<Utc>,
}

impl Event {
    /// Event id
    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// Event name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Organiser, who receives primary sales
    #[must_use]
    pub const fn creator_id(&self) -> Option<UserId> {
        self.creator_id
    }

    /// Venue name
    #[must_use]
    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Start time
    #[must_use]
    pub const fn starts_at(&self) -> DateTime<Utc> {
        self.starts_at
    }

    /// Sum of tier quantities
    #[must_use]
    pub const fn total_tickets(&self) -> u32 {
        self.total_tickets
    }

    /// Sum of tier availability
    #[must_use]
    pub const fn available_tickets(&self) -> u32 {
        self.available_tickets
    }
}

/// A priced inventory pool within an event. `0 <= available <= quantity`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub(crate) id: PricingTierId,
    pub(crate) event_id: EventId,
    pub(crate) name: String,
    pub(crate) section: String,
    pub(crate) price: Money,
    pub(crate) quantity: u32,
    pub(crate) available: u32,
}

impl PricingTier {
    /// Tier id
    #[must_use]
    pub const fn id(&self) -> PricingTierId {
        self.id
    }

    /// Owning event
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Tier name ("VIP", "Floor")
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Venue section
    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Face value of tickets in this tier
    #[must_use]
    pub const fn price(&self) -> Money {
        self.price
    }

    /// Tickets issued
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Tickets still in primary inventory
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.available
    }
}

/// A single seat. `current_price <= original_price`; owner is `None` only while available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub(crate) id: TicketId,
    pub(crate) ticket_number: String,
    pub(crate) event_id: EventId,
    pub(crate) pricing_tier_id: PricingTierId,
    pub(crate) owner_id: Option<UserId>,
    pub(crate) original_price: Money,
    pub(crate) current_price: Money,
    pub(crate) section: String,
    pub(crate) row: Option<String>,
    pub(crate) seat: Option<String>,
    pub(crate) status: TicketStatus,
    pub(crate) purchase_date: Option<DateTime<Utc>>,
    pub(crate) used: bool,
    pub(crate) qr_payload: String,
}

impl Ticket {
    /// Issues a new AVAILABLE ticket for `tier`
    #[must_use]
    pub(crate) fn issue(tier: &PricingTier, seat: Option<String>) -> Self {
        let id = TicketId::new();
        let ticket_number = generate_number("TKT");
        let qr_payload = format!("{ticket_number}|{}|{id}", tier.event_id);
        Self {
            id,
            ticket_number,
            event_id: tier.event_id,
            pricing_tier_id: tier.id,
            owner_id: None,
            original_price: tier.price,
            current_price: tier.price,
            section: tier.section.clone(),
            row: None,
            seat,
            status: TicketStatus::Available,
            purchase_date: None,
            used: false,
            qr_payload,
        }
    }

    /// Ticket id
    #[must_use]
    pub const fn id(&self) -> TicketId {
        self.id
    }

    /// Unique printed number
    #[must_use]
    pub fn ticket_number(&self) -> &str {
        &self.ticket_number
    }

    /// Event
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Pricing tier the ticket was issued under
    #[must_use]
    pub const fn pricing_tier_id(&self) -> PricingTierId {
        self.pricing_tier_id
    }

    /// Current owner
    #[must_use]
    pub const fn owner_id(&self) -> Option<UserId> {
        self.owner_id
    }

    /// Face value at issue
    #[must_use]
    pub const fn original_price(&self) -> Money {
        self.original_price
    }

    /// Price currently asked (equals the listing price while listed)
    #[must_use]
    pub const fn current_price(&self) -> Money {
        self.current_price
    }

    /// Section
    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Row, if numbered
    #[must_use]
    pub fn row(&self) -> Option<&str> {
        self.row.as_deref()
    }

    /// Seat, if numbered
    #[must_use]
    pub fn seat(&self) -> Option<&str> {
        self.seat.as_deref()
    }

    /// Lifecycle status
    #[must_use]
    pub const fn status(&self) -> TicketStatus {
        self.status
    }

    /// When the current owner acquired it
    #[must_use]
    pub const fn purchase_date(&self) -> Option<DateTime<Utc>> {
        self.purchase_date
    }

    /// Whether the ticket was scanned at the door
    #[must_use]
    pub const fn used(&self) -> bool {
        self.used
    }

    /// Payload encoded into the QR code
    #[must_use]
    pub fn qr_payload(&self) -> &str {
        &self.qr_payload
    }
}

/// Secondary-market offer for a ticket. `asking_price <= ticket.original_price`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketListing {
    pub(crate) id: ListingId,
    pub(crate) ticket_id: TicketId,
    pub(crate) seller_id: UserId,
    pub(crate) asking_price: Money,
    pub(crate) description: Option<String>,
    pub(crate) listing_date: DateTime<Utc>,
    pub(crate) status: ListingStatus,
}

impl TicketListing {
    /// Listing id
    #[must_use]
    pub const fn id(&self) -> ListingId {
        self.id
    }

    /// Listed ticket
    #[must_use]
    pub const fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    /// Seller (ticket owner at listing time)
    #[must_use]
    pub const fn seller_id(&self) -> UserId {
        self.seller_id
    }

    /// Asking price
    #[must_use]
    pub const fn asking_price(&self) -> Money {
        self.asking_price
    }

    /// Seller's description
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Last (re)activation time
    #[must_use]
    pub const fn listing_date(&self) -> DateTime<Utc> {
        self.listing_date
    }

    /// Lifecycle status
    #[must_use]
    pub const fn status(&self) -> ListingStatus {
        self.status
    }
}

/// A purchase, primary or secondary. `amount` is frozen at creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) transaction_number: String,
    pub(crate) amount: Money,
    pub(crate) kind: TransactionType,
    pub(crate) status: TransactionStatus,
    pub(crate) buyer_id: UserId,
    pub(crate) seller_id: Option<UserId>,
    pub(crate) ticket_id: TicketId,
    pub(crate) listing_id: Option<ListingId>,
    pub(crate) payment_method: PaymentMethod,
    pub(crate) payment_intent_ref: Option<String>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) refund_reason: Option<String>,
    pub(crate) transaction_date: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) refunded_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Transaction id
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Unique printed number
    #[must_use]
    pub fn transaction_number(&self) -> &str {
        &self.transaction_number
    }

    /// Amount frozen at creation
    #[must_use]
    pub const fn amount(&self) -> Money {
        self.amount
    }

    /// Primary or secondary
    #[must_use]
    pub const fn kind(&self) -> TransactionType {
        self.kind
    }

    /// State machine position
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Buyer
    #[must_use]
    pub const fn buyer_id(&self) -> UserId {
        self.buyer_id
    }

    /// Seller (event creator for primary sales, may be absent)
    #[must_use]
    pub const fn seller_id(&self) -> Option<UserId> {
        self.seller_id
    }

    /// Ticket bought
    #[must_use]
    pub const fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    /// Listing bought (secondary only)
    #[must_use]
    pub const fn listing_id(&self) -> Option<ListingId> {
        self.listing_id
    }

    /// Card or balance
    #[must_use]
    pub const fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    /// Gateway intent reference (card payments)
    #[must_use]
    pub fn payment_intent_ref(&self) -> Option<&str> {
        self.payment_intent_ref.as_deref()
    }

    /// Why the transaction failed
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Why the transaction was refunded
    #[must_use]
    pub fn refund_reason(&self) -> Option<&str> {
        self.refund_reason.as_deref()
    }

    /// Creation time
    #[must_use]
    pub const fn transaction_date(&self) -> DateTime<Utc> {
        self.transaction_date
    }

    /// Completion time
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Refund time
    #[must_use]
    pub const fn refunded_at(&self) -> Option<DateTime<Utc>> {
        self.refunded_at
    }
}

// ============================================================================
// Read models
// ============================================================================

/// Availability of one pricing tier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAvailability {
    /// Tier id
    pub tier_id: PricingTierId,
    /// Tier name
    pub name: String,
    /// Face value
    pub price: Money,
    /// Tickets issued
    pub quantity: u32,
    /// Tickets remaining
    pub available: u32,
}

/// Availability of an event, as served to browsing clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAvailability {
    /// Event id
    pub event_id: EventId,
    /// Total tickets across tiers
    pub total_tickets: u32,
    /// Remaining tickets across tiers
    pub available_tickets: u32,
    /// Per-tier breakdown
    pub tiers: Vec<TierAvailability>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(12_345).to_string(), "$123.45");
        assert_eq!(Money::from_cents(-5).to_string(), "-$0.05");
        assert_eq!(Money::ZERO.to_string(), "$0.00");
    }

    #[test]
    fn test_money_sum_and_sign() {
        let total: Money = [Money::from_dollars(10), Money::from_cents(-250)].into_iter().sum();
        assert_eq!(total, Money::from_cents(750));
        assert!(total.is_positive());
        assert!(!Money::ZERO.is_positive());
        assert!(!Money::from_cents(-1).is_positive());
    }

    #[test]
    fn test_status_round_trip_through_storage_text() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Refunded,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TicketStatus::parse("SOLD"), None);
    }

    #[test]
    fn test_payment_method_client_aliases() {
        assert_eq!(PaymentMethod::from_client("credit_card"), Some(PaymentMethod::Card));
        assert_eq!(PaymentMethod::from_client(" Balance "), Some(PaymentMethod::Balance));
        assert_eq!(PaymentMethod::from_client("cash"), None);
    }

    #[test]
    fn test_generated_numbers() {
        let number = generate_number("TKT");
        assert!(number.starts_with("TKT-"));
        assert_eq!(number.len(), 16);
        assert!(number[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_ledger_entry_signed_amount() {
        let entry = BalanceLedgerEntry {
            id: LedgerEntryId::new(),
            user_id: UserId::new(),
            amount: Money::from_dollars(5),
            kind: LedgerEntryKind::Withdrawal,
            description: "cash out".to_string(),
            reference: LedgerReference::admin(),
            created_at: Utc::now(),
        };
        assert_eq!(entry.signed_amount(), Money::from_dollars(-5));
    }
}
