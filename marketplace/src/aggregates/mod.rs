//! Reducers for the marketplace aggregates.
//!
//! Each aggregate follows the same shape: a `State` holding the rows loaded
//! for one command, an `Action` enum mixing commands and events, and a pure
//! reducer that validates the command, applies the resulting event and
//! returns post-commit effects (audit records, notifications). A rejected
//! command leaves the rows untouched and records the error in
//! `state.last_error`.

pub mod listing;
pub mod inventory;
pub mod transaction;
pub mod wallet;

use crate::audit::AuditSink;
use crate::notification::Notifier;
use marketplace_core::environment::Clock;
use std::sync::Arc;

/// Environment dependencies shared by the marketplace reducers
#[derive(Clone)]
pub struct MarketplaceEnvironment {
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Audit trail collaborator
    pub audit: Arc<dyn AuditSink>,
    /// Buyer/seller notification collaborator
    pub notifier: Arc<dyn Notifier>,
}

impl MarketplaceEnvironment {
    /// Creates a new `MarketplaceEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            clock,
            audit,
            notifier,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::MarketplaceEnvironment;
    use crate::audit::InMemoryAuditSink;
    use crate::notification::RecordingNotifier;
    use crate::types::{Event, EventId, Money, PricingTier, PricingTierId, Ticket, UserId};
    use marketplace_core::environment::Clock;
    use marketplace_testing::test_clock;
    use std::sync::Arc;

    pub fn test_env() -> MarketplaceEnvironment {
        MarketplaceEnvironment::new(
            Arc::new(test_clock()),
            Arc::new(InMemoryAuditSink::new()),
            Arc::new(RecordingNotifier::new()),
        )
    }

    pub fn event(creator: Option<UserId>, total: u32) -> Event {
        let now = test_clock().now();
        Event {
            id: EventId::new(),
            name: "Arcade Fire".to_string(),
            creator_id: creator,
            venue: "Olympia".to_string(),
            starts_at: now + chrono::Duration::days(30),
            total_tickets: total,
            available_tickets: total,
            created_at: now,
        }
    }

    pub fn tier(event: &Event, price: Money, quantity: u32) -> PricingTier {
        PricingTier {
            id: PricingTierId::new(),
            event_id: event.id,
            name: "Floor".to_string(),
            section: "A".to_string(),
            price,
            quantity,
            available: quantity,
        }
    }

    pub fn available_ticket(tier: &PricingTier) -> Ticket {
        Ticket::issue(tier, Some("1".to_string()))
    }

    pub fn owned_ticket(tier: &PricingTier, owner: UserId) -> Ticket {
        let mut ticket = Ticket::issue(tier, Some("1".to_string()));
        ticket.owner_id = Some(owner);
        ticket.status = crate::types::TicketStatus::Purchased;
        ticket.purchase_date = Some(test_clock().now());
        ticket
    }
}
