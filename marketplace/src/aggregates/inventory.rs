//! Inventory aggregate: events, pricing tiers and tickets.
//!
//! Owns every write that moves the `available` counters. A tier's
//! `available` only goes down when one of its tickets leaves AVAILABLE or is
//! withdrawn unsold, and only goes up when the tier quantity is increased;
//! the event counters move in the same step, so `event.available_tickets`
//! always equals the sum of its tiers.
//!
//! The reducer is the "last seat" guard: completing a primary purchase of a
//! ticket that is no longer AVAILABLE is rejected with `InvalidState`. The
//! store serialises the row access, the reducer decides.

use super::MarketplaceEnvironment;
use crate::audit::{audit_effect, AuditRecord};
use crate::error::MarketplaceError;
use crate::types::{
    Event, EventId, Money, PricingTier, PricingTierId, Ticket, TicketId, TicketStatus, UserId,
};
use chrono::{DateTime, Utc};
use marketplace_core::{effect::Effect, reducer::Reducer, smallvec, SmallVec};
use serde_json::json;

// ============================================================================
// State
// ============================================================================

/// Rows loaded for one inventory command
#[derive(Clone, Debug, Default)]
pub struct InventoryState {
    /// Event being created or whose counters move
    pub event: Option<Event>,
    /// Pricing tier whose counters move
    pub tier: Option<PricingTier>,
    /// Ticket being transitioned
    pub ticket: Option<Ticket>,
    /// Tickets issued by this command, to be inserted
    pub issued: Vec<Ticket>,
    /// Unsold tickets withdrawn by this command, to be deleted
    pub retired: Vec<TicketId>,
    /// Rejection of the last command
    pub last_error: Option<MarketplaceError>,
}

impl InventoryState {
    /// State for a command against an event (adding a tier)
    #[must_use]
    pub fn for_event(event: Event) -> Self {
        Self {
            event: Some(event),
            ..Self::default()
        }
    }

    /// State for a command against a tier and its event
    #[must_use]
    pub fn for_tier(event: Event, tier: PricingTier) -> Self {
        Self {
            event: Some(event),
            tier: Some(tier),
            ..Self::default()
        }
    }

    /// State for a ticket transition that does not touch counters
    #[must_use]
    pub fn for_ticket(ticket: Ticket) -> Self {
        Self {
            ticket: Some(ticket),
            ..Self::default()
        }
    }

    /// State for a primary purchase: the ticket with its tier and event
    #[must_use]
    pub fn for_primary(event: Event, tier: PricingTier, ticket: Ticket) -> Self {
        Self {
            event: Some(event),
            tier: Some(tier),
            ticket: Some(ticket),
            ..Self::default()
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Inventory commands and events
#[derive(Clone, Debug)]
pub enum InventoryAction {
    // Commands
    /// Create an event with zero counters
    CreateEvent {
        /// Event id
        event_id: EventId,
        /// Name
        name: String,
        /// Organiser, who receives primary sales
        creator_id: Option<UserId>,
        /// Venue
        venue: String,
        /// Start time
        starts_at: DateTime<Utc>,
    },
    /// Add a priced pool of tickets to the loaded event
    AddPricingTier {
        /// Tier name
        name: String,
        /// Venue section
        section: String,
        /// Face value, must be positive
        price: Money,
        /// Tickets to issue, must be positive
        quantity: u32,
    },
    /// Issue more tickets under the loaded tier
    IncreaseTierQuantity {
        /// Tickets to add, must be positive
        additional: u32,
    },
    /// Withdraw unsold tickets from the loaded tier
    DecreaseTierQuantity {
        /// Tickets to withdraw, must be positive
        count: u32,
        /// Unsold tickets that may be withdrawn, in withdrawal order
        candidates: Vec<Ticket>,
    },
    /// Hand the loaded AVAILABLE ticket to its first buyer
    CompletePrimaryPurchase {
        /// Buyer
        buyer_id: UserId,
    },
    /// Hand the loaded LISTED ticket to a resale buyer
    CompleteSecondaryPurchase {
        /// Buyer
        buyer_id: UserId,
    },
    /// Scan the loaded ticket at the door
    MarkUsed,

    // Events
    /// Event created
    EventCreated {
        /// The new event
        event: Event,
    },
    /// Tier added and its tickets issued
    PricingTierAdded {
        /// The new tier
        tier: PricingTier,
        /// Issued tickets
        tickets: Vec<Ticket>,
    },
    /// Tier quantity increased
    TierQuantityIncreased {
        /// Tickets added
        additional: u32,
        /// Issued tickets
        tickets: Vec<Ticket>,
    },
    /// Tier quantity decreased
    TierQuantityDecreased {
        /// Withdrawn tickets
        tickets: Vec<TicketId>,
    },
    /// First sale completed
    PrimaryPurchaseCompleted {
        /// New owner
        buyer_id: UserId,
        /// When
        purchased_at: DateTime<Utc>,
    },
    /// Resale completed
    SecondaryPurchaseCompleted {
        /// New owner
        buyer_id: UserId,
        /// When
        purchased_at: DateTime<Utc>,
    },
    /// Ticket scanned
    TicketUsed,
    /// Command rejected
    Rejected {
        /// Why
        error: MarketplaceError,
    },
}

// ============================================================================
// Reducer
// ============================================================================

/// Largest number of tickets a single pricing tier may hold. Issuing builds
/// every ticket inside one unit of work.
pub const MAX_TIER_QUANTITY: u32 = 10_000;

/// Reducer for events, tiers and tickets
#[derive(Clone, Debug, Default)]
pub struct InventoryReducer;

fn missing(entity: &'static str) -> MarketplaceError {
    MarketplaceError::InvalidState(format!("{entity} not loaded"))
}

fn issue_tickets(tier: &PricingTier, first_seat: u32, count: u32) -> Vec<Ticket> {
    (first_seat..first_seat.saturating_add(count))
        .map(|seat| Ticket::issue(tier, Some(seat.to_string())))
        .collect()
}

impl InventoryReducer {
    /// Creates a new `InventoryReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate_add_pricing_tier(
        state: &InventoryState,
        price: Money,
        quantity: u32,
    ) -> Result<(), MarketplaceError> {
        let event = state.event.as_ref().ok_or_else(|| missing("event"))?;
        if !price.is_positive() {
            return Err(MarketplaceError::InvalidAmount { amount: price });
        }
        if quantity == 0 {
            return Err(MarketplaceError::InvalidState(
                "tier quantity must be greater than zero".to_string(),
            ));
        }
        if quantity > MAX_TIER_QUANTITY {
            return Err(MarketplaceError::InvalidState(format!(
                "tier quantity {quantity} exceeds the limit of {MAX_TIER_QUANTITY}"
            )));
        }
        if event.total_tickets.checked_add(quantity).is_none() {
            return Err(MarketplaceError::InvalidState(format!(
                "event {} cannot hold {quantity} more tickets",
                event.id
            )));
        }
        Ok(())
    }

    fn validate_increase_tier_quantity(
        state: &InventoryState,
        additional: u32,
    ) -> Result<(), MarketplaceError> {
        let event = state.event.as_ref().ok_or_else(|| missing("event"))?;
        let tier = state.tier.as_ref().ok_or_else(|| missing("pricing tier"))?;
        if additional == 0 {
            return Err(MarketplaceError::InvalidState(
                "additional quantity must be greater than zero".to_string(),
            ));
        }
        if tier.event_id != event.id {
            return Err(MarketplaceError::InvalidState(format!(
                "pricing tier {} does not belong to event {}",
                tier.id, event.id
            )));
        }
        let fits = tier
            .quantity
            .checked_add(additional)
            .is_some_and(|quantity| quantity <= MAX_TIER_QUANTITY);
        if !fits || event.total_tickets.checked_add(additional).is_none() {
            return Err(MarketplaceError::InvalidState(format!(
                "pricing tier {} cannot hold {additional} more tickets (limit {MAX_TIER_QUANTITY})",
                tier.id
            )));
        }
        Ok(())
    }

    /// Picks the tickets to withdraw: the first `count` candidates that are
    /// still AVAILABLE under the loaded tier.
    fn select_withdrawals(
        state: &InventoryState,
        count: u32,
        candidates: &[Ticket],
    ) -> Result<Vec<TicketId>, MarketplaceError> {
        let event = state.event.as_ref().ok_or_else(|| missing("event"))?;
        let tier = state.tier.as_ref().ok_or_else(|| missing("pricing tier"))?;
        if count == 0 {
            return Err(MarketplaceError::InvalidState(
                "quantity to withdraw must be greater than zero".to_string(),
            ));
        }
        if tier.event_id != event.id {
            return Err(MarketplaceError::InvalidState(format!(
                "pricing tier {} does not belong to event {}",
                tier.id, event.id
            )));
        }
        if count > tier.available {
            return Err(MarketplaceError::InvalidState(format!(
                "pricing tier {} has only {} unsold tickets, cannot withdraw {count}",
                tier.id, tier.available
            )));
        }

        let wanted = usize::try_from(count).unwrap_or(usize::MAX);
        let withdrawn: Vec<TicketId> = candidates
            .iter()
            .filter(|ticket| ticket.status == TicketStatus::Available && ticket.pricing_tier_id == tier.id)
            .map(|ticket| ticket.id)
            .take(wanted)
            .collect();
        if withdrawn.len() < wanted {
            // Tickets with a purchase on record stay, even if it failed
            return Err(MarketplaceError::InvalidState(format!(
                "only {} tickets of pricing tier {} can be withdrawn",
                withdrawn.len(),
                tier.id
            )));
        }
        Ok(withdrawn)
    }

    fn validate_primary_purchase(state: &InventoryState) -> Result<(), MarketplaceError> {
        let ticket = state.ticket.as_ref().ok_or_else(|| missing("ticket"))?;
        let tier = state.tier.as_ref().ok_or_else(|| missing("pricing tier"))?;
        let event = state.event.as_ref().ok_or_else(|| missing("event"))?;

        if ticket.status != TicketStatus::Available {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} is no longer available (status {})",
                ticket.id, ticket.status
            )));
        }
        if ticket.pricing_tier_id != tier.id || tier.event_id != event.id {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} does not belong to the loaded tier",
                ticket.id
            )));
        }
        if tier.available == 0 || event.available_tickets == 0 {
            return Err(MarketplaceError::InvalidState(format!(
                "no tickets left in pricing tier {}",
                tier.id
            )));
        }
        Ok(())
    }

    fn validate_secondary_purchase(state: &InventoryState) -> Result<(), MarketplaceError> {
        let ticket = state.ticket.as_ref().ok_or_else(|| missing("ticket"))?;
        if ticket.status != TicketStatus::Listed {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} is not listed for resale (status {})",
                ticket.id, ticket.status
            )));
        }
        Ok(())
    }

    fn validate_mark_used(state: &InventoryState) -> Result<(), MarketplaceError> {
        let ticket = state.ticket.as_ref().ok_or_else(|| missing("ticket"))?;
        if ticket.used {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} has already been used",
                ticket.id
            )));
        }
        if ticket.status == TicketStatus::Available {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} has not been sold",
                ticket.id
            )));
        }
        Ok(())
    }

    /// Applies an event to state. Validation already ran, so counter
    /// arithmetic cannot overflow here.
    fn apply_event(state: &mut InventoryState, action: &InventoryAction) {
        match action {
            InventoryAction::EventCreated { event } => {
                state.event = Some(event.clone());
                state.last_error = None;
            },
            InventoryAction::PricingTierAdded { tier, tickets } => {
                if let Some(event) = state.event.as_mut() {
                    event.total_tickets = event.total_tickets.saturating_add(tier.quantity);
                    event.available_tickets = event.available_tickets.saturating_add(tier.available);
                }
                state.tier = Some(tier.clone());
                state.issued.extend(tickets.iter().cloned());
                state.last_error = None;
            },
            InventoryAction::TierQuantityIncreased {
                additional,
                tickets,
            } => {
                if let Some(tier) = state.tier.as_mut() {
                    tier.quantity = tier.quantity.saturating_add(*additional);
                    tier.available = tier.available.saturating_add(*additional);
                }
                if let Some(event) = state.event.as_mut() {
                    event.total_tickets = event.total_tickets.saturating_add(*additional);
                    event.available_tickets = event.available_tickets.saturating_add(*additional);
                }
                state.issued.extend(tickets.iter().cloned());
                state.last_error = None;
            },
            InventoryAction::TierQuantityDecreased { tickets } => {
                let removed = u32::try_from(tickets.len()).unwrap_or(u32::MAX);
                if let Some(tier) = state.tier.as_mut() {
                    tier.quantity = tier.quantity.saturating_sub(removed);
                    tier.available = tier.available.saturating_sub(removed);
                }
                if let Some(event) = state.event.as_mut() {
                    event.total_tickets = event.total_tickets.saturating_sub(removed);
                    event.available_tickets = event.available_tickets.saturating_sub(removed);
                }
                state.retired.extend(tickets.iter().copied());
                state.last_error = None;
            },
            InventoryAction::PrimaryPurchaseCompleted {
                buyer_id,
                purchased_at,
            } => {
                if let Some(ticket) = state.ticket.as_mut() {
                    ticket.owner_id = Some(*buyer_id);
                    ticket.status = TicketStatus::Purchased;
                    ticket.purchase_date = Some(*purchased_at);
                }
                if let Some(tier) = state.tier.as_mut() {
                    tier.available = tier.available.saturating_sub(1);
                }
                if let Some(event) = state.event.as_mut() {
                    event.available_tickets = event.available_tickets.saturating_sub(1);
                }
                state.last_error = None;
            },
            InventoryAction::SecondaryPurchaseCompleted {
                buyer_id,
                purchased_at,
            } => {
                if let Some(ticket) = state.ticket.as_mut() {
                    ticket.owner_id = Some(*buyer_id);
                    ticket.status = TicketStatus::Resold;
                    ticket.purchase_date = Some(*purchased_at);
                }
                state.last_error = None;
            },
            InventoryAction::TicketUsed => {
                if let Some(ticket) = state.ticket.as_mut() {
                    ticket.used = true;
                }
                state.last_error = None;
            },
            InventoryAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            // Commands don't modify state
            InventoryAction::CreateEvent { .. }
            | InventoryAction::AddPricingTier { .. }
            | InventoryAction::IncreaseTierQuantity { .. }
            | InventoryAction::DecreaseTierQuantity { .. }
            | InventoryAction::CompletePrimaryPurchase { .. }
            | InventoryAction::CompleteSecondaryPurchase { .. }
            | InventoryAction::MarkUsed => {},
        }
    }

    fn reject(state: &mut InventoryState, error: MarketplaceError) -> SmallVec<[Effect<InventoryAction>; 4]> {
        tracing::debug!(%error, "Inventory command rejected");
        Self::apply_event(state, &InventoryAction::Rejected { error });
        SmallVec::new()
    }
}

impl Reducer for InventoryReducer {
    type State = InventoryState;
    type Action = InventoryAction;
    type Environment = MarketplaceEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per command
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            InventoryAction::CreateEvent {
                event_id,
                name,
                creator_id,
                venue,
                starts_at,
            } => {
                if name.trim().is_empty() {
                    return Self::reject(
                        state,
                        MarketplaceError::InvalidState("event name must not be empty".to_string()),
                    );
                }

                let now = env.clock.now();
                let event = Event {
                    id: event_id,
                    name,
                    creator_id,
                    venue,
                    starts_at,
                    total_tickets: 0,
                    available_tickets: 0,
                    created_at: now,
                };
                Self::apply_event(state, &InventoryAction::EventCreated { event: event.clone() });

                let record = AuditRecord::new("EVENT_CREATED", "Event", event.id, creator_id, now)
                    .with_details(json!({ "name": event.name, "venue": event.venue }));
                smallvec![audit_effect(&env.audit, record)]
            },

            InventoryAction::AddPricingTier {
                name,
                section,
                price,
                quantity,
            } => {
                if let Err(error) = Self::validate_add_pricing_tier(state, price, quantity) {
                    return Self::reject(state, error);
                }
                let Some(event) = state.event.as_ref() else {
                    return Self::reject(state, missing("event"));
                };

                let tier = PricingTier {
                    id: PricingTierId::new(),
                    event_id: event.id,
                    name,
                    section,
                    price,
                    quantity,
                    available: quantity,
                };
                let tickets = issue_tickets(&tier, 1, quantity);
                let actor = event.creator_id;
                let record = AuditRecord::new("PRICING_TIER_ADDED", "PricingTier", tier.id, actor, env.clock.now())
                    .with_details(json!({
                        "event_id": event.id.to_string(),
                        "name": tier.name,
                        "price_cents": price.cents(),
                        "quantity": quantity,
                    }));

                Self::apply_event(state, &InventoryAction::PricingTierAdded { tier, tickets });
                smallvec![audit_effect(&env.audit, record)]
            },

            InventoryAction::IncreaseTierQuantity { additional } => {
                if let Err(error) = Self::validate_increase_tier_quantity(state, additional) {
                    return Self::reject(state, error);
                }
                let (Some(event), Some(tier)) = (state.event.as_ref(), state.tier.as_ref()) else {
                    return Self::reject(state, missing("pricing tier"));
                };

                // Seats continue after the ones already issued.
                let tickets = issue_tickets(tier, tier.quantity.saturating_add(1), additional);
                let record = AuditRecord::new(
                    "TIER_QUANTITY_INCREASED",
                    "PricingTier",
                    tier.id,
                    event.creator_id,
                    env.clock.now(),
                )
                .with_details(json!({
                    "additional": additional,
                    "quantity_after": tier.quantity.saturating_add(additional),
                }));

                Self::apply_event(
                    state,
                    &InventoryAction::TierQuantityIncreased {
                        additional,
                        tickets,
                    },
                );
                smallvec![audit_effect(&env.audit, record)]
            },

            InventoryAction::DecreaseTierQuantity { count, candidates } => {
                let tickets = match Self::select_withdrawals(state, count, &candidates) {
                    Ok(tickets) => tickets,
                    Err(error) => return Self::reject(state, error),
                };
                let (Some(event), Some(tier)) = (state.event.as_ref(), state.tier.as_ref()) else {
                    return Self::reject(state, missing("pricing tier"));
                };

                let record = AuditRecord::new(
                    "TIER_QUANTITY_DECREASED",
                    "PricingTier",
                    tier.id,
                    event.creator_id,
                    env.clock.now(),
                )
                .with_details(json!({
                    "withdrawn": count,
                    "quantity_after": tier.quantity.saturating_sub(count),
                }));

                Self::apply_event(state, &InventoryAction::TierQuantityDecreased { tickets });
                smallvec![audit_effect(&env.audit, record)]
            },

            InventoryAction::CompletePrimaryPurchase { buyer_id } => {
                if let Err(error) = Self::validate_primary_purchase(state) {
                    return Self::reject(state, error);
                }
                Self::apply_event(
                    state,
                    &InventoryAction::PrimaryPurchaseCompleted {
                        buyer_id,
                        purchased_at: env.clock.now(),
                    },
                );
                // Audited with the owning transaction
                SmallVec::new()
            },

            InventoryAction::CompleteSecondaryPurchase { buyer_id } => {
                if let Err(error) = Self::validate_secondary_purchase(state) {
                    return Self::reject(state, error);
                }
                Self::apply_event(
                    state,
                    &InventoryAction::SecondaryPurchaseCompleted {
                        buyer_id,
                        purchased_at: env.clock.now(),
                    },
                );
                SmallVec::new()
            },

            InventoryAction::MarkUsed => {
                if let Err(error) = Self::validate_mark_used(state) {
                    return Self::reject(state, error);
                }
                Self::apply_event(state, &InventoryAction::TicketUsed);

                let Some(ticket) = state.ticket.as_ref() else {
                    return SmallVec::new();
                };
                let record = AuditRecord::new("TICKET_USED", "Ticket", ticket.id, ticket.owner_id, env.clock.now())
                    .with_details(json!({ "ticket_number": ticket.ticket_number }));
                smallvec![audit_effect(&env.audit, record)]
            },

            // ========== Events ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
