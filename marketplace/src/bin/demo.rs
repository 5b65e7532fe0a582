//! Ticket Marketplace Demo
//!
//! Walks through the four reference flows against a mock payment gateway:
//! - A: primary purchase paid from the wallet
//! - B: resale listing capped at face value
//! - C: resale purchase paid from the wallet
//! - D: refund of a completed purchase
//!
//! and finishes with a card purchase settled by a gateway callback and a
//! sweep that expires an abandoned purchase.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store
//! cargo run --bin demo
//!
//! # PostgreSQL (DATABASE_URL), migrations applied on start
//! cargo run --bin demo -- --postgres
//! ```

use chrono::{Duration, Utc};
use marketplace::audit::TracingAuditSink;
use marketplace::metrics::register_business_metrics;
use marketplace::notification::LoggingNotifier;
use marketplace::payment_gateway::MockPaymentGateway;
use marketplace::types::{LedgerReference, Money, PaymentMethod};
use marketplace::{
    Config, GatewayEvent, GatewayOutcome, InMemoryStore, Marketplace, MarketplaceEnvironment,
    MarketplaceError, MarketplaceStore, PostgresStore, Reconciler,
};
use marketplace_core::environment::SystemClock;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();
    register_business_metrics();

    println!("\n🎫 ============================================");
    println!("   Ticket Marketplace - Live Demo");
    println!("============================================\n");

    let env = MarketplaceEnvironment::new(
        Arc::new(SystemClock),
        Arc::new(TracingAuditSink),
        Arc::new(LoggingNotifier),
    );
    let gateway = MockPaymentGateway::new();

    if std::env::args().any(|arg| arg == "--postgres") {
        println!("⚙️  Connecting to PostgreSQL...");
        let store = PostgresStore::connect(&config.postgres).await?;
        store.migrate().await?;
        let market = Marketplace::new(store, env, gateway.clone().shared(), config.payments.clone());
        run(market, &gateway, &config).await?;
    } else {
        println!("⚙️  Using the in-memory store");
        let market = Marketplace::new(InMemoryStore::new(), env, gateway.clone().shared(), config.payments.clone());
        run(market, &gateway, &config).await?;
    }

    println!("\n✅ Demo complete\n");
    Ok(())
}

async fn run<S: MarketplaceStore>(
    market: Marketplace<S>,
    gateway: &MockPaymentGateway,
    config: &Config,
) -> Result<(), MarketplaceError> {
    let organiser = market.inventory.register_user("organiser", "org@example.com").await?;
    let alice = market.inventory.register_user("alice", "alice@example.com").await?;
    let bob = market.inventory.register_user("bob", "bob@example.com").await?;

    let event = market
        .inventory
        .create_event("Summer Music Festival", Some(organiser.id), "Riverside Park", Utc::now() + Duration::days(30))
        .await?;
    let (tier, tickets) = market
        .inventory
        .add_pricing_tier(event.id(), "General Admission", "GA", Money::from_dollars(100), 5)
        .await?;
    println!("\n📋 Event {} with {} tickets at {}", event.name(), tickets.len(), tier.price());

    // ========== Scenario A ==========
    println!("\n1️⃣  Alice buys a ticket from her wallet");
    market
        .wallets
        .credit(alice.id, Money::from_dollars(150), "Top-up", LedgerReference::admin())
        .await?;
    let ticket = &tickets[0];
    let intent = market
        .transactions
        .initiate_primary_purchase(ticket.id(), alice.id, PaymentMethod::Balance)
        .await?;
    let purchase = market
        .transactions
        .confirm_with_balance(intent.transaction.id(), alice.id)
        .await?;
    let availability = market.inventory.event_availability(event.id()).await?;
    println!("   ✓ {} {}", purchase.transaction_number(), purchase.status());
    println!("   ✓ Alice balance: {}", market.wallets.current_balance(alice.id).await?);
    println!(
        "   ✓ Available: {}/{}",
        availability.available_tickets, availability.total_tickets
    );

    // ========== Scenario B ==========
    println!("\n2️⃣  Alice lists her ticket");
    match market
        .listings
        .create_listing(ticket.id(), alice.id, Money::from_dollars(120), None)
        .await
    {
        Err(error) => println!("   ✗ $120 rejected: {error}"),
        Ok(_) => println!("   ? $120 unexpectedly accepted"),
    }
    let listing = market
        .listings
        .create_listing(ticket.id(), alice.id, Money::from_dollars(80), Some("Can't make it".into()))
        .await?;
    println!("   ✓ Listed at {}", listing.asking_price());

    // ========== Scenario C ==========
    println!("\n3️⃣  Bob buys the listing from his wallet");
    market
        .wallets
        .credit(bob.id, Money::from_dollars(100), "Top-up", LedgerReference::admin())
        .await?;
    let resale = market
        .transactions
        .purchase_listing_with_balance(listing.id(), bob.id)
        .await?;
    let resold = market.inventory.ticket(ticket.id()).await?;
    println!("   ✓ {} {}", resale.transaction_number(), resale.status());
    println!("   ✓ Ticket now {} (owner bob: {})", resold.status(), resold.owner_id() == Some(bob.id));
    println!("   ✓ Bob balance: {}", market.wallets.current_balance(bob.id).await?);
    println!("   ✓ Alice balance: {}", market.wallets.current_balance(alice.id).await?);

    // ========== Scenario D ==========
    println!("\n4️⃣  Bob's purchase is refunded");
    let refunded = market.transactions.refund(resale.id(), "event cancelled").await?;
    println!("   ✓ {} {}", refunded.transaction_number(), refunded.status());
    println!("   ✓ Bob balance: {}", market.wallets.current_balance(bob.id).await?);

    // ========== Card payment + reconciliation ==========
    println!("\n5️⃣  Bob pays by card, the gateway calls back");
    let card = market
        .transactions
        .initiate_primary_purchase(tickets[1].id(), bob.id, PaymentMethod::Card)
        .await?;
    let intent_ref = card.transaction.payment_intent_ref().unwrap_or_default().to_string();
    gateway.set_status(&intent_ref, marketplace::payment_gateway::IntentStatus::Succeeded);

    let reconciler = Reconciler::new(market.transactions.clone(), config.reconciliation.clone());
    let settled = reconciler
        .handle_gateway_event(GatewayEvent {
            intent_ref,
            outcome: GatewayOutcome::Succeeded,
        })
        .await?;
    if let Some(settled) = settled {
        println!("   ✓ {} {}", settled.transaction_number(), settled.status());
    }

    println!("\n6️⃣  An abandoned purchase is expired");
    market
        .transactions
        .initiate_primary_purchase(tickets[2].id(), alice.id, PaymentMethod::Balance)
        .await?;
    let sweep = reconciler.expire_stale_pending(Duration::zero()).await?;
    println!(
        "   ✓ Examined {}, completed {}, failed {}, still pending {}",
        sweep.examined, sweep.completed, sweep.failed, sweep.still_pending
    );

    let check = market.wallets.verify_ledger(alice.id).await?;
    println!("\n📒 Alice ledger consistent: {}", check.is_consistent());
    Ok(())
}
