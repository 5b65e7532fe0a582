//! Shared fixtures for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use chrono::Duration;
use marketplace::audit::InMemoryAuditSink;
use marketplace::config::{PaymentConfig, ReconciliationConfig};
use marketplace::notification::RecordingNotifier;
use marketplace::payment_gateway::MockPaymentGateway;
use marketplace::types::{Event, LedgerReference, Money, Ticket, User, UserId};
use marketplace::{InMemoryStore, Marketplace, MarketplaceEnvironment, Reconciler};
use marketplace_core::environment::Clock;
use marketplace_testing::{test_clock, FixedClock};
use std::sync::Arc;

/// A marketplace over the in-memory store with observable collaborators
pub struct Harness {
    pub market: Marketplace<InMemoryStore>,
    pub gateway: MockPaymentGateway,
    pub clock: FixedClock,
    pub audit: Arc<InMemoryAuditSink>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(MockPaymentGateway::new(), PaymentConfig::default())
    }

    pub fn with_gateway(gateway: MockPaymentGateway, payments: PaymentConfig) -> Self {
        let clock = test_clock();
        let audit = Arc::new(InMemoryAuditSink::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let env = MarketplaceEnvironment::new(Arc::new(clock.clone()), audit.clone(), notifier.clone());
        let market = Marketplace::new(InMemoryStore::new(), env, gateway.clone().shared(), payments);
        Self {
            market,
            gateway,
            clock,
            audit,
            notifier,
        }
    }

    pub async fn user(&self, name: &str) -> User {
        self.market
            .inventory
            .register_user(name, &format!("{name}@example.com"))
            .await
            .unwrap()
    }

    pub async fn funded_user(&self, name: &str, dollars: i64) -> User {
        let user = self.user(name).await;
        self.market
            .wallets
            .credit(user.id, Money::from_dollars(dollars), "Top-up", LedgerReference::admin())
            .await
            .unwrap();
        user
    }

    /// An event with one tier of `quantity` tickets at `dollars` each
    pub async fn event_with_tickets(
        &self,
        organiser: Option<UserId>,
        dollars: i64,
        quantity: u32,
    ) -> (Event, Vec<Ticket>) {
        let event = self
            .market
            .inventory
            .create_event("Arcade Night", organiser, "Main Hall", self.clock.now() + Duration::days(7))
            .await
            .unwrap();
        let (_, tickets) = self
            .market
            .inventory
            .add_pricing_tier(event.id(), "General", "GA", Money::from_dollars(dollars), quantity)
            .await
            .unwrap();
        let event = self.market.inventory.event(event.id()).await.unwrap();
        (event, tickets)
    }

    pub async fn balance(&self, user: &User) -> Money {
        self.market.wallets.current_balance(user.id).await.unwrap()
    }

    pub fn reconciler(&self) -> Reconciler<InMemoryStore> {
        Reconciler::new(self.market.transactions.clone(), ReconciliationConfig::default())
    }
}
