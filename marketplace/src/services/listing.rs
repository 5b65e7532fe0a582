//! Resale listing service.

use super::{finish, require_user, PostCommit, TicketInventory};
use crate::aggregates::listing::{ListingAction, ListingReducer, ListingState};
use crate::aggregates::MarketplaceEnvironment;
use crate::error::{MarketplaceError, Result};
use crate::metrics;
use crate::store::{MarketplaceStore, UnitOfWork};
use crate::types::{EventId, ListingId, Money, Ticket, TicketId, TicketListing, UserId};
use marketplace_core::reducer::Reducer;
use std::sync::Arc;

/// Creates, edits and closes resale listings.
///
/// Listing a ticket and cancelling the listing move the ticket between
/// PURCHASED and LISTED in the same unit of work, so a listing and its
/// ticket never disagree.
pub struct ResaleListingEngine<S> {
    store: Arc<S>,
    env: MarketplaceEnvironment,
    reducer: ListingReducer,
}

impl<S> Clone for ResaleListingEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            env: self.env.clone(),
            reducer: ListingReducer::new(),
        }
    }
}

impl<S> std::fmt::Debug for ResaleListingEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResaleListingEngine").finish_non_exhaustive()
    }
}

impl<S: MarketplaceStore> ResaleListingEngine<S> {
    /// Creates a new `ResaleListingEngine`
    #[must_use]
    pub const fn new(store: Arc<S>, env: MarketplaceEnvironment) -> Self {
        Self {
            store,
            env,
            reducer: ListingReducer::new(),
        }
    }

    /// Lists a PURCHASED ticket for resale, or reactivates its cancelled
    /// listing with the new price and description.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown ticket or seller
    /// - [`MarketplaceError::NotOwner`] if the seller does not own the ticket
    /// - [`MarketplaceError::DuplicateListing`] if an active listing exists
    /// - [`MarketplaceError::AlreadySold`] if the ticket was sold on resale
    /// - [`MarketplaceError::InvalidState`] unless the ticket is PURCHASED
    /// - [`MarketplaceError::InvalidAmount`] if `asking_price <= 0`
    /// - [`MarketplaceError::PriceExceedsOriginal`] above face value
    pub async fn create_listing(
        &self,
        ticket_id: TicketId,
        seller_id: UserId,
        asking_price: Money,
        description: Option<String>,
    ) -> Result<TicketListing> {
        let action = ListingAction::CreateListing {
            listing_id: ListingId::new(),
            seller_id,
            asking_price,
            description,
        };
        let outcome = self.try_create(ticket_id, seller_id, action).await;
        let listing = finish("listing.create_listing", outcome).await?;
        tracing::info!(
            listing_id = %listing.id,
            ticket_id = %ticket_id,
            seller_id = %seller_id,
            asking_price = %listing.asking_price,
            "Ticket listed"
        );
        Ok(listing)
    }

    async fn try_create(
        &self,
        ticket_id: TicketId,
        seller_id: UserId,
        action: ListingAction,
    ) -> Result<(TicketListing, PostCommit)> {
        let mut uow = self.store.begin().await?;
        require_user(&mut uow, seller_id).await?;
        let ticket = TicketInventory::<S>::load_ticket(&mut uow, ticket_id).await?;
        let existing = uow.find_listing_by_ticket(ticket_id).await?;

        let mut post = PostCommit::new();
        let listing = self.apply(&mut uow, ListingState::new(ticket, existing), action, &mut post).await?;
        uow.commit().await?;
        Ok((listing, post))
    }

    /// Changes the price and description of an active listing; the ticket's
    /// current price follows
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown listing
    /// - [`MarketplaceError::NotOwner`] unless called by the seller
    /// - [`MarketplaceError::InvalidState`] unless the listing is ACTIVE
    /// - [`MarketplaceError::InvalidAmount`] or
    ///   [`MarketplaceError::PriceExceedsOriginal`] for a bad price
    pub async fn update_listing(
        &self,
        listing_id: ListingId,
        seller_id: UserId,
        asking_price: Money,
        description: Option<String>,
    ) -> Result<TicketListing> {
        let action = ListingAction::UpdateListing {
            seller_id,
            asking_price,
            description,
        };
        let outcome = self.try_on_listing(listing_id, action).await;
        let listing = finish("listing.update_listing", outcome).await?;
        tracing::info!(listing_id = %listing_id, asking_price = %asking_price, "Listing updated");
        Ok(listing)
    }

    /// Withdraws an active listing and returns the ticket to PURCHASED at face value
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::NotFound`] for an unknown listing
    /// - [`MarketplaceError::NotOwner`] unless called by the seller
    /// - [`MarketplaceError::InvalidState`] unless the listing is ACTIVE
    pub async fn cancel_listing(&self, listing_id: ListingId, seller_id: UserId) -> Result<TicketListing> {
        let outcome = self
            .try_on_listing(listing_id, ListingAction::CancelListing { seller_id })
            .await;
        let listing = finish("listing.cancel_listing", outcome).await?;
        tracing::info!(listing_id = %listing_id, "Listing cancelled");
        Ok(listing)
    }

    async fn try_on_listing(
        &self,
        listing_id: ListingId,
        action: ListingAction,
    ) -> Result<(TicketListing, PostCommit)> {
        let mut uow = self.store.begin().await?;
        let listing = Self::load_listing(&mut uow, listing_id).await?;
        let ticket = TicketInventory::<S>::load_ticket(&mut uow, listing.ticket_id).await?;

        let mut post = PostCommit::new();
        let listing = self
            .apply(&mut uow, ListingState::new(ticket, Some(listing)), action, &mut post)
            .await?;
        uow.commit().await?;
        Ok((listing, post))
    }

    /// Marks an active listing SOLD inside an open unit of work. The caller
    /// transfers the ticket.
    pub(crate) async fn mark_sold_in(
        &self,
        uow: &mut S::Tx,
        listing_id: ListingId,
        buyer_id: UserId,
        post: &mut PostCommit,
    ) -> Result<TicketListing> {
        let listing = Self::load_listing(uow, listing_id).await?;
        let ticket = TicketInventory::<S>::load_ticket(uow, listing.ticket_id).await?;
        self.apply(
            uow,
            ListingState::new(ticket, Some(listing)),
            ListingAction::MarkSold { buyer_id },
            post,
        )
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Loads a listing
    ///
    /// # Errors
    ///
    /// [`MarketplaceError::NotFound`] for an unknown listing
    pub async fn listing(&self, listing_id: ListingId) -> Result<TicketListing> {
        let mut uow = self.store.begin().await?;
        Self::load_listing(&mut uow, listing_id).await
    }

    /// All listings of a seller, newest first
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn listings_by_seller(&self, seller_id: UserId) -> Result<Vec<TicketListing>> {
        let mut uow = self.store.begin().await?;
        uow.listings_by_seller(seller_id).await
    }

    /// ACTIVE listings for an event, cheapest first
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn active_listings_for_event(&self, event_id: EventId) -> Result<Vec<TicketListing>> {
        let mut uow = self.store.begin().await?;
        uow.active_listings_for_event(event_id).await
    }

    /// Number of ACTIVE listings for an event
    ///
    /// # Errors
    ///
    /// Storage failures only
    pub async fn count_active_listings_for_event(&self, event_id: EventId) -> Result<usize> {
        Ok(self.active_listings_for_event(event_id).await?.len())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn apply(
        &self,
        uow: &mut S::Tx,
        mut state: ListingState,
        action: ListingAction,
        post: &mut PostCommit,
    ) -> Result<TicketListing> {
        let effects = self.reducer.reduce(&mut state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error);
        }
        let ListingState { ticket, listing, .. } = state;
        let listing = listing.ok_or_else(|| MarketplaceError::InvalidState("listing not loaded".to_string()))?;

        post.effects(effects);
        save_pair(uow, &ticket, &listing).await?;

        let status = listing.status;
        post.then(move || metrics::record_listing(status));
        tracing::debug!(listing_id = %listing.id, status = %status, ticket_status = %ticket.status, "Listing applied");
        Ok(listing)
    }

    async fn load_listing(uow: &mut S::Tx, listing_id: ListingId) -> Result<TicketListing> {
        uow.find_listing(listing_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found("listing", listing_id))
    }
}

async fn save_pair<T: UnitOfWork>(uow: &mut T, ticket: &Ticket, listing: &TicketListing) -> Result<()> {
    uow.save_ticket(ticket).await?;
    uow.save_listing(listing).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::cache::InMemoryCache;
    use crate::notification::RecordingNotifier;
    use crate::store::InMemoryStore;
    use crate::services::AvailabilityCache;
    use crate::types::{EventAvailability, ListingStatus, TicketStatus, User};
    use chrono::Utc;
    use marketplace_testing::test_clock;

    struct Fixture {
        inventory: TicketInventory<InMemoryStore>,
        listings: ResaleListingEngine<InMemoryStore>,
        audit: Arc<InMemoryAuditSink>,
        owner: User,
        other: User,
        ticket: Ticket,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let env = MarketplaceEnvironment::new(
            Arc::new(test_clock()),
            audit.clone(),
            Arc::new(RecordingNotifier::new()),
        );
        let cache: AvailabilityCache = Arc::new(InMemoryCache::<EventId, EventAvailability>::default());
        let inventory = TicketInventory::new(Arc::clone(&store), env.clone(), cache);
        let listings = ResaleListingEngine::new(store, env);

        let owner = inventory.register_user("olive", "olive@example.com").await.unwrap();
        let other = inventory.register_user("oscar", "oscar@example.com").await.unwrap();
        let event = inventory.create_event("Gig", None, "Club", Utc::now()).await.unwrap();
        let (_, tickets) = inventory
            .add_pricing_tier(event.id, "GA", "Floor", Money::from_dollars(50), 1)
            .await
            .unwrap();
        let ticket = inventory
            .complete_primary_purchase(tickets[0].id, owner.id)
            .await
            .unwrap();

        Fixture {
            inventory,
            listings,
            audit,
            owner,
            other,
            ticket,
        }
    }

    #[tokio::test]
    async fn test_list_update_cancel_relist() {
        let f = fixture().await;
        let listing = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(45), None)
            .await
            .unwrap();
        let ticket = f.inventory.ticket(f.ticket.id).await.unwrap();
        assert_eq!(ticket.status(), TicketStatus::Listed);
        assert_eq!(ticket.current_price(), Money::from_dollars(45));

        f.listings
            .update_listing(listing.id, f.owner.id, Money::from_dollars(40), Some("aisle".into()))
            .await
            .unwrap();
        assert_eq!(
            f.inventory.ticket(f.ticket.id).await.unwrap().current_price(),
            Money::from_dollars(40)
        );

        f.listings.cancel_listing(listing.id, f.owner.id).await.unwrap();
        let ticket = f.inventory.ticket(f.ticket.id).await.unwrap();
        assert_eq!(ticket.status(), TicketStatus::Purchased);
        assert_eq!(ticket.current_price(), Money::from_dollars(50));

        let relisted = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(30), None)
            .await
            .unwrap();
        assert_eq!(relisted.id, listing.id);
        assert_eq!(relisted.status(), ListingStatus::Active);
        assert_eq!(f.listings.listings_by_seller(f.owner.id).await.unwrap().len(), 1);
        assert_eq!(
            f.listings
                .count_active_listings_for_event(f.ticket.event_id)
                .await
                .unwrap(),
            1
        );
        assert!(f.audit.actions().contains(&"LISTING_REACTIVATED"));
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_listing_and_ticket_unchanged() {
        let f = fixture().await;
        let listing = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(45), Some("row 3".into()))
            .await
            .unwrap();
        let ticket = f.inventory.ticket(f.ticket.id).await.unwrap();

        let err = f
            .listings
            .update_listing(listing.id, f.owner.id, Money::from_dollars(51), Some("front row".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MarketplaceError::PriceExceedsOriginal { asking, original }
                if asking == Money::from_dollars(51) && original == Money::from_dollars(50)
        ));
        let err = f
            .listings
            .update_listing(listing.id, f.other.id, Money::from_dollars(20), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::NotOwner(_)));

        let stored = f.listings.listing(listing.id).await.unwrap();
        assert_eq!(stored, listing);
        assert_eq!(stored.asking_price(), Money::from_dollars(45));
        assert_eq!(stored.description(), Some("row 3"));
        assert_eq!(stored.status(), ListingStatus::Active);
        let reloaded = f.inventory.ticket(f.ticket.id).await.unwrap();
        assert_eq!(reloaded, ticket);
        assert_eq!(reloaded.status(), TicketStatus::Listed);
        assert_eq!(reloaded.current_price(), Money::from_dollars(45));
    }

    #[tokio::test]
    async fn test_duplicate_listing_leaves_first_untouched() {
        let f = fixture().await;
        let first = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(45), None)
            .await
            .unwrap();
        let err = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(20), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::DuplicateListing { .. }));
        assert_eq!(f.listings.listing(first.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_listing_rules() {
        let f = fixture().await;
        let err = f
            .listings
            .create_listing(f.ticket.id, f.other.id, Money::from_dollars(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::NotOwner(_)));

        let err = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(51), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::PriceExceedsOriginal { .. }));

        let err = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidAmount { .. }));

        let listing = f
            .listings
            .create_listing(f.ticket.id, f.owner.id, Money::from_dollars(50), None)
            .await
            .unwrap();
        let err = f.listings.cancel_listing(listing.id, f.other.id).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::NotOwner(_)));
        let err = f
            .listings
            .cancel_listing(ListingId::new(), f.owner.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::NotFound { .. }));
    }
}
