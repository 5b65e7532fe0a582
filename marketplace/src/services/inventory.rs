//! Ticket inventory service: users, events, pricing tiers and tickets.

use super::{finish, require_user, AvailabilityCache, PostCommit};
use crate::aggregates::inventory::{InventoryAction, InventoryReducer, InventoryState};
use crate::aggregates::MarketplaceEnvironment;
use crate::audit::{audit_effect, AuditRecord};
use crate::error::{MarketplaceError, Result};
use crate::store::{MarketplaceStore, UnitOfWork};
use crate::types::{
    Event, EventAvailability, EventId, Money, PricingTier, PricingTierId, Ticket, TicketId,
    TicketStatus, TierAvailability, User, UserId,
};
use chrono::{DateTime, Utc};
use marketplace_core::reducer::Reducer;
use std::sync::Arc;

/// Events, pricing tiers and the tickets issued under them.
pub struct TicketInventory<S> {
    store: Arc<S>,
    env: MarketplaceEnvironment,
    reducer: InventoryReducer,
    cache: AvailabilityCache,
}

impl<S> Clone for TicketInventory<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            env: self.env.clone(),
            reducer: InventoryReducer::new(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<S> std::fmt::Debug for TicketInventory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketInventory").finish_non_exhaustive()
    }
}

impl<S: MarketplaceStore> TicketInventory<S> {
    /// Creates a new `TicketInventory`
    #[must_use]
    pub const fn new(store: Arc<S>, env: MarketplaceEnvironment, cache: AvailabilityCache) -> Self {
        Self {
            store,
            env,
            reducer: InventoryReducer::new(),
            cache,
        }
    }

    // ========================================================================
    // Catalogue writes
    // ========================================================================

    /// Registers a user account
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::InvalidState`] if username or email is blank
    pub async fn register_user(&self, username: &str, email: &str) -> Result<User> {
        let outcome = self.try_register_user(username, email).await;
        let user = finish("inventory.register_user", outcome).await?;
        tracing::info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(user)
    }

    async fn try_register_user(&self, username: &str, email: &str) -> Result<(User, PostCommit)> {
        if username.trim().is_empty() || email.trim().is_empty() {
            return Err(MarketplaceError::InvalidState(
                "username and email are required".to_string(),
            ));
        }
        let user = User::new(username.trim().to_string(), email.trim().to_string(), self.env.clock.now());

        let mut uow = self.store.begin().await?;
        uow.insert_user(&user).await?;
        uow.commit().await?;

        let mut post = PostCommit::new();
        let record = AuditRecord::new("USER_REGISTERED", "User", user.id, Some(user.id), user.created_at)
            .with_details(serde_json::json!({ "username": user.username }));
        post.effects([audit_effect::<()>(&self.env.audit, record)]);
        Ok((user, post))
    }

    /// Creates an event with zero ticket counters
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] if the creator is unknown
    /// - [`MarketplaceError::InvalidState`] if the name is blank
    pub async fn create_event(
        &self,
        name: &str,
        creator_id: Option<UserId>,
        venue: &str,
        starts_at: DateTime<Utc>,
    ) -> Result<Event> {
        let action = InventoryAction::CreateEvent {
            event_id: EventId::new(),
            name: name.to_string(),
            creator_id,
            venue: venue.to_string(),
            starts_at,
        };
        let event = finish("inventory.create_event", self.try_create_event(creator_id, action).await).await?;
        tracing::info!(event_id = %event.id, name = %event.name, "Event created");
        Ok(event)
    }

    async fn try_create_event(
        &self,
        creator_id: Option<UserId>,
        action: InventoryAction,
    ) -> Result<(Event, PostCommit)> {
        let mut uow = self.store.begin().await?;
        if let Some(creator_id) = creator_id {
            require_user(&mut uow, creator_id).await?;
        }

        let mut state = InventoryState::default();
        let mut post = PostCommit::new();
        self.run(&mut state, action, &mut post)?;
        let event = state
            .event
            .ok_or_else(|| MarketplaceError::InvalidState("event not created".to_string()))?;

        uow.save_event(&event).await?;
        uow.commit().await?;
        Ok((event, post))
    }

    /// Adds a pricing tier and issues its tickets (seats `1..=quantity`)
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown event
    /// - [`MarketplaceError::InvalidAmount`] if `price <= 0`
    /// - [`MarketplaceError::InvalidState`] if `quantity == 0` or above
    ///   [`MAX_TIER_QUANTITY`](crate::aggregates::inventory::MAX_TIER_QUANTITY)
    pub async fn add_pricing_tier(
        &self,
        event_id: EventId,
        name: &str,
        section: &str,
        price: Money,
        quantity: u32,
    ) -> Result<(PricingTier, Vec<Ticket>)> {
        let action = InventoryAction::AddPricingTier {
            name: name.to_string(),
            section: section.to_string(),
            price,
            quantity,
        };
        let outcome = self.try_add_pricing_tier(event_id, action).await;
        let (tier, tickets) = finish("inventory.add_pricing_tier", outcome).await?;
        tracing::info!(
            event_id = %event_id,
            tier_id = %tier.id,
            price = %tier.price,
            quantity = tier.quantity,
            "Pricing tier added"
        );
        Ok((tier, tickets))
    }

    async fn try_add_pricing_tier(
        &self,
        event_id: EventId,
        action: InventoryAction,
    ) -> Result<((PricingTier, Vec<Ticket>), PostCommit)> {
        let mut uow = self.store.begin().await?;
        let event = Self::load_event(&mut uow, event_id).await?;

        let mut state = InventoryState::for_event(event);
        let mut post = PostCommit::new();
        self.run(&mut state, action, &mut post)?;
        let (Some(event), Some(tier)) = (state.event, state.tier) else {
            return Err(MarketplaceError::InvalidState("pricing tier not created".to_string()));
        };

        uow.save_event(&event).await?;
        uow.save_tier(&tier).await?;
        for ticket in &state.issued {
            uow.save_ticket(ticket).await?;
        }
        uow.commit().await?;

        self.invalidate_after_commit(&mut post, event_id);
        Ok(((tier, state.issued), post))
    }

    /// Issues `additional` tickets under an existing tier
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown tier
    /// - [`MarketplaceError::InvalidState`] if `additional == 0` or the tier
    ///   would exceed [`MAX_TIER_QUANTITY`](crate::aggregates::inventory::MAX_TIER_QUANTITY)
    pub async fn increase_tier_quantity(&self, tier_id: PricingTierId, additional: u32) -> Result<PricingTier> {
        let outcome = self.try_increase_tier_quantity(tier_id, additional).await;
        let tier = finish("inventory.increase_tier_quantity", outcome).await?;
        tracing::info!(
            tier_id = %tier.id,
            additional,
            quantity = tier.quantity,
            available = tier.available,
            "Pricing tier quantity increased"
        );
        Ok(tier)
    }

    async fn try_increase_tier_quantity(
        &self,
        tier_id: PricingTierId,
        additional: u32,
    ) -> Result<(PricingTier, PostCommit)> {
        let mut uow = self.store.begin().await?;
        let tier = uow
            .find_tier(tier_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("pricing tier", tier_id))?;
        let event = Self::load_event(&mut uow, tier.event_id).await?;
        let event_id = event.id;

        let mut state = InventoryState::for_tier(event, tier);
        let mut post = PostCommit::new();
        self.run(&mut state, InventoryAction::IncreaseTierQuantity { additional }, &mut post)?;
        let (Some(event), Some(tier)) = (state.event, state.tier) else {
            return Err(MarketplaceError::InvalidState("pricing tier not loaded".to_string()));
        };

        uow.save_event(&event).await?;
        uow.save_tier(&tier).await?;
        for ticket in &state.issued {
            uow.save_ticket(ticket).await?;
        }
        uow.commit().await?;

        self.invalidate_after_commit(&mut post, event_id);
        Ok((tier, post))
    }

    /// Withdraws `count` unsold tickets from a tier, lowering its quantity
    /// and the event counters with it. Only AVAILABLE tickets with no
    /// purchase on record are withdrawn; the rows are deleted.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown tier
    /// - [`MarketplaceError::InvalidState`] if `count == 0` or fewer than
    ///   `count` tickets can be withdrawn
    pub async fn decrease_tier_quantity(&self, tier_id: PricingTierId, count: u32) -> Result<PricingTier> {
        let outcome = self.try_decrease_tier_quantity(tier_id, count).await;
        let tier = finish("inventory.decrease_tier_quantity", outcome).await?;
        tracing::info!(
            tier_id = %tier.id,
            withdrawn = count,
            quantity = tier.quantity,
            available = tier.available,
            "Pricing tier quantity decreased"
        );
        Ok(tier)
    }

    async fn try_decrease_tier_quantity(
        &self,
        tier_id: PricingTierId,
        count: u32,
    ) -> Result<(PricingTier, PostCommit)> {
        let mut uow = self.store.begin().await?;
        let tier = uow
            .find_tier(tier_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("pricing tier", tier_id))?;
        let event = Self::load_event(&mut uow, tier.event_id).await?;
        let event_id = event.id;
        let candidates = uow.unsold_tickets_for_tier(tier_id).await?;

        let mut state = InventoryState::for_tier(event, tier);
        let mut post = PostCommit::new();
        self.run(&mut state, InventoryAction::DecreaseTierQuantity { count, candidates }, &mut post)?;
        let (Some(event), Some(tier)) = (state.event, state.tier) else {
            return Err(MarketplaceError::InvalidState("pricing tier not loaded".to_string()));
        };

        for ticket_id in &state.retired {
            uow.delete_ticket(*ticket_id).await?;
        }
        uow.save_tier(&tier).await?;
        uow.save_event(&event).await?;
        uow.commit().await?;

        self.invalidate_after_commit(&mut post, event_id);
        Ok((tier, post))
    }

    // ========================================================================
    // Ticket transitions
    // ========================================================================

    /// Checks that a ticket can be bought on the primary market.
    ///
    /// Nothing is held: ownership and counters change only when the purchase
    /// completes, and that step re-checks availability under the row lock,
    /// so of two concurrent buyers exactly one completes.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket
    /// - [`MarketplaceError::InvalidState`] unless the ticket is AVAILABLE
    pub async fn reserve_for_primary_purchase(&self, ticket_id: TicketId) -> Result<Ticket> {
        let mut uow = self.store.begin().await?;
        let ticket = Self::load_ticket(&mut uow, ticket_id).await?;
        if ticket.status != TicketStatus::Available {
            let error = MarketplaceError::InvalidState(format!(
                "ticket {} is not available (status {})",
                ticket.id, ticket.status
            ));
            super::log_failure("inventory.reserve_for_primary_purchase", &error);
            return Err(error);
        }
        Ok(ticket)
    }

    /// Hands an AVAILABLE ticket to its first buyer and decrements the tier
    /// and event counters
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket or buyer
    /// - [`MarketplaceError::InvalidState`] unless the ticket is AVAILABLE
    pub async fn complete_primary_purchase(&self, ticket_id: TicketId, buyer_id: UserId) -> Result<Ticket> {
        let outcome = async {
            let mut uow = self.store.begin().await?;
            require_user(&mut uow, buyer_id).await?;
            let mut post = PostCommit::new();
            let ticket = self.complete_primary_in(&mut uow, ticket_id, buyer_id, &mut post).await?;
            uow.commit().await?;
            Ok::<_, MarketplaceError>((ticket, post))
        }
        .await;
        let ticket = finish("inventory.complete_primary_purchase", outcome).await?;
        tracing::info!(ticket_id = %ticket.id, buyer_id = %buyer_id, "Primary purchase completed");
        Ok(ticket)
    }

    /// Hands a LISTED ticket to a resale buyer. Counters are not touched.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket or buyer
    /// - [`MarketplaceError::InvalidState`] unless the ticket is LISTED
    pub async fn complete_secondary_purchase(&self, ticket_id: TicketId, buyer_id: UserId) -> Result<Ticket> {
        let outcome = async {
            let mut uow = self.store.begin().await?;
            require_user(&mut uow, buyer_id).await?;
            let mut post = PostCommit::new();
            let ticket = self.complete_secondary_in(&mut uow, ticket_id, buyer_id, &mut post).await?;
            uow.commit().await?;
            Ok::<_, MarketplaceError>((ticket, post))
        }
        .await;
        let ticket = finish("inventory.complete_secondary_purchase", outcome).await?;
        tracing::info!(ticket_id = %ticket.id, buyer_id = %buyer_id, "Secondary purchase completed");
        Ok(ticket)
    }

    /// Marks a sold ticket as scanned at the door
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket
    /// - [`MarketplaceError::InvalidState`] if already used or never sold
    pub async fn mark_used(&self, ticket_id: TicketId) -> Result<Ticket> {
        let outcome = async {
            let mut uow = self.store.begin().await?;
            let ticket = Self::load_ticket(&mut uow, ticket_id).await?;
            let mut state = InventoryState::for_ticket(ticket);
            let mut post = PostCommit::new();
            self.run(&mut state, InventoryAction::MarkUsed, &mut post)?;
            let ticket = state
                .ticket
                .ok_or_else(|| MarketplaceError::not_found("ticket", ticket_id))?;
            uow.save_ticket(&ticket).await?;
            uow.commit().await?;
            Ok::<_, MarketplaceError>((ticket, post))
        }
        .await;
        let ticket = finish("inventory.mark_used", outcome).await?;
        tracing::info!(ticket_id = %ticket.id, "Ticket used");
        Ok(ticket)
    }

    /// Primary purchase completion inside an open unit of work
    pub(crate) async fn complete_primary_in(
        &self,
        uow: &mut S::Tx,
        ticket_id: TicketId,
        buyer_id: UserId,
        post: &mut PostCommit,
    ) -> Result<Ticket> {
        let ticket = Self::load_ticket(uow, ticket_id).await?;
        let tier = uow
            .find_tier(ticket.pricing_tier_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("pricing tier", ticket.pricing_tier_id))?;
        let event = Self::load_event(uow, ticket.event_id).await?;
        let event_id = event.id;

        let mut state = InventoryState::for_primary(event, tier, ticket);
        self.run(&mut state, InventoryAction::CompletePrimaryPurchase { buyer_id }, post)?;
        let (Some(event), Some(tier), Some(ticket)) = (state.event, state.tier, state.ticket) else {
            return Err(MarketplaceError::not_found("ticket", ticket_id));
        };

        uow.save_ticket(&ticket).await?;
        uow.save_tier(&tier).await?;
        uow.save_event(&event).await?;
        self.invalidate_after_commit(post, event_id);
        Ok(ticket)
    }

    /// Secondary purchase completion inside an open unit of work
    pub(crate) async fn complete_secondary_in(
        &self,
        uow: &mut S::Tx,
        ticket_id: TicketId,
        buyer_id: UserId,
        post: &mut PostCommit,
    ) -> Result<Ticket> {
        let ticket = Self::load_ticket(uow, ticket_id).await?;
        let mut state = InventoryState::for_ticket(ticket);
        self.run(&mut state, InventoryAction::CompleteSecondaryPurchase { buyer_id }, post)?;
        let ticket = state
            .ticket
            .ok_or_else(|| MarketplaceError::not_found("ticket", ticket_id))?;
        uow.save_ticket(&ticket).await?;
        Ok(ticket)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Loads a ticket
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown ticket
    pub async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket> {
        let mut uow = self.store.begin().await?;
        Self::load_ticket(&mut uow, ticket_id).await
    }

    /// Loads an event
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown event
    pub async fn event(&self, event_id: EventId) -> Result<Event> {
        let mut uow = self.store.begin().await?;
        Self::load_event(&mut uow, event_id).await
    }

    /// Tickets of an event, ordered by ticket number
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown event
    pub async fn tickets_for_event(&self, event_id: EventId) -> Result<Vec<Ticket>> {
        let mut uow = self.store.begin().await?;
        Self::load_event(&mut uow, event_id).await?;
        uow.tickets_for_event(event_id).await
    }

    /// Tickets currently owned by a user
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown user
    pub async fn tickets_owned_by(&self, user_id: UserId) -> Result<Vec<Ticket>> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, user_id).await?;
        uow.tickets_owned_by(user_id).await
    }

    /// Availability of an event and its tiers, served from the cache
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown event
    pub async fn event_availability(&self, event_id: EventId) -> Result<EventAvailability> {
        if let Some(cached) = self.cache.get(&event_id) {
            tracing::trace!(event_id = %event_id, "Availability cache hit");
            return Ok(cached);
        }

        let mut uow = self.store.begin().await?;
        let event = Self::load_event(&mut uow, event_id).await?;
        let tiers = uow.tiers_for_event(event_id).await?;

        let availability = EventAvailability {
            event_id,
            total_tickets: event.total_tickets,
            available_tickets: event.available_tickets,
            tiers: tiers
                .into_iter()
                .map(|tier| TierAvailability {
                    tier_id: tier.id,
                    name: tier.name,
                    price: tier.price,
                    quantity: tier.quantity,
                    available: tier.available,
                })
                .collect(),
        };
        // Filled while the rows are still held, so a writer's invalidation
        // always lands after this put.
        self.cache.put(event_id, availability.clone());
        drop(uow);
        Ok(availability)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn run(
        &self,
        state: &mut InventoryState,
        action: InventoryAction,
        post: &mut PostCommit,
    ) -> Result<()> {
        let effects = self.reducer.reduce(state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error);
        }
        post.effects(effects);
        Ok(())
    }

    fn invalidate_after_commit(&self, post: &mut PostCommit, event_id: EventId) {
        let cache = Arc::clone(&self.cache);
        post.then(move || cache.invalidate(&event_id));
    }

    pub(crate) async fn load_ticket(uow: &mut S::Tx, ticket_id: TicketId) -> Result<Ticket> {
        uow.find_ticket(ticket_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("ticket", ticket_id))
    }

    pub(crate) async fn load_event(uow: &mut S::Tx, event_id: EventId) -> Result<Event> {
        uow.find_event(event_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("event", event_id))
    }
}
