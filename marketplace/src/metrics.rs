//! Business metrics for the marketplace.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `marketplace_transactions_total{status}` - Transactions by status (pending, completed, failed, refunded)
//! - `marketplace_revenue_cents_total` - Completed purchase volume in cents
//! - `marketplace_refunds_cents_total` - Refunded volume in cents
//! - `marketplace_wallet_mutations_total{kind}` - Wallet ledger entries by kind
//! - `marketplace_listings_total{status}` - Listing transitions (active, sold, cancelled)
//! - `marketplace_tickets_sold_total{market}` - Tickets sold (primary, secondary)

use crate::types::{LedgerEntryKind, ListingStatus, Money, TransactionStatus, TransactionType};
use metrics::describe_counter;

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "marketplace_transactions_total",
        "Total number of transactions by status (pending, completed, failed, refunded)"
    );
    describe_counter!(
        "marketplace_revenue_cents_total",
        "Total value of completed purchases in cents"
    );
    describe_counter!(
        "marketplace_refunds_cents_total",
        "Total value of refunds in cents"
    );
    describe_counter!(
        "marketplace_wallet_mutations_total",
        "Total number of wallet ledger entries by kind"
    );
    describe_counter!(
        "marketplace_listings_total",
        "Total number of listing transitions by resulting status"
    );
    describe_counter!(
        "marketplace_tickets_sold_total",
        "Total number of tickets sold by market (primary, secondary)"
    );

    tracing::info!("Business metrics registered");
}

/// Record a transaction reaching `status`.
pub fn record_transaction(status: TransactionStatus) {
    metrics::counter!("marketplace_transactions_total", "status" => status.as_str().to_ascii_lowercase())
        .increment(1);
}

/// Record a completed purchase.
pub fn record_purchase_completed(kind: TransactionType, amount: Money) {
    record_transaction(TransactionStatus::Completed);
    let market = match kind {
        TransactionType::PrimaryPurchase => "primary",
        TransactionType::SecondaryPurchase => "secondary",
    };
    metrics::counter!("marketplace_tickets_sold_total", "market" => market).increment(1);
    metrics::counter!("marketplace_revenue_cents_total").increment(amount.cents().unsigned_abs());
    tracing::debug!(market, amount_cents = amount.cents(), "Recorded purchase_completed metric");
}

/// Record a refund.
pub fn record_refund(amount: Money) {
    record_transaction(TransactionStatus::Refunded);
    metrics::counter!("marketplace_refunds_cents_total").increment(amount.cents().unsigned_abs());
    tracing::debug!(amount_cents = amount.cents(), "Recorded refund metric");
}

/// Record a wallet ledger entry.
pub fn record_wallet_mutation(kind: LedgerEntryKind) {
    metrics::counter!("marketplace_wallet_mutations_total", "kind" => kind.as_str().to_ascii_lowercase())
        .increment(1);
}

/// Record a listing reaching `status`.
pub fn record_listing(status: ListingStatus) {
    metrics::counter!("marketplace_listings_total", "status" => status.as_str().to_ascii_lowercase())
        .increment(1);
}
