//! Resale listing aggregate.
//!
//! A ticket has at most one listing record. Cancelling keeps the record so
//! that listing the ticket again reactivates it in place; selling it is
//! final. While a listing is ACTIVE the ticket is LISTED and its current
//! price mirrors the asking price, which may never exceed face value.

use super::MarketplaceEnvironment;
use crate::audit::{audit_effect, AuditRecord};
use crate::error::MarketplaceError;
use crate::types::{ListingId, ListingStatus, Money, Ticket, TicketListing, TicketStatus, UserId};
use chrono::{DateTime, Utc};
use marketplace_core::{effect::Effect, reducer::Reducer, smallvec, SmallVec};
use serde_json::json;

/// Rows loaded for one listing command
#[derive(Clone, Debug)]
pub struct ListingState {
    /// Listed ticket
    pub ticket: Ticket,
    /// The ticket's listing record, if it ever had one
    pub listing: Option<TicketListing>,
    /// Rejection of the last command
    pub last_error: Option<MarketplaceError>,
}

impl ListingState {
    /// Wraps the loaded rows
    #[must_use]
    pub const fn new(ticket: Ticket, listing: Option<TicketListing>) -> Self {
        Self {
            ticket,
            listing,
            last_error: None,
        }
    }
}

/// Listing commands and events
#[derive(Clone, Debug)]
pub enum ListingAction {
    // Commands
    /// List the ticket, or reactivate its cancelled listing
    CreateListing {
        /// Id used when a new record is created
        listing_id: ListingId,
        /// Acting user, must own the ticket
        seller_id: UserId,
        /// Asking price, at most face value
        asking_price: Money,
        /// Seller's description
        description: Option<String>,
    },
    /// Change price and description of the active listing
    UpdateListing {
        /// Acting user, must be the seller
        seller_id: UserId,
        /// New asking price, at most face value
        asking_price: Money,
        /// New description
        description: Option<String>,
    },
    /// Withdraw the active listing
    CancelListing {
        /// Acting user, must be the seller
        seller_id: UserId,
    },
    /// Close the active listing for a buyer
    MarkSold {
        /// Buyer, must not be the seller
        buyer_id: UserId,
    },

    // Events
    /// New listing record created
    ListingCreated {
        /// The listing
        listing: TicketListing,
    },
    /// Cancelled listing made active again
    ListingReactivated {
        /// New asking price
        asking_price: Money,
        /// New description
        description: Option<String>,
        /// Reactivation time
        listed_at: DateTime<Utc>,
    },
    /// Price or description changed
    ListingUpdated {
        /// New asking price
        asking_price: Money,
        /// New description
        description: Option<String>,
    },
    /// Listing withdrawn
    ListingCancelled,
    /// Listing bought
    ListingSold,
    /// Command rejected
    Rejected {
        /// Why
        error: MarketplaceError,
    },
}

/// Reducer for resale listings
#[derive(Clone, Debug, Default)]
pub struct ListingReducer;

impl ListingReducer {
    /// Creates a new `ListingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate_price(ticket: &Ticket, asking_price: Money) -> Result<(), MarketplaceError> {
        if !asking_price.is_positive() {
            return Err(MarketplaceError::InvalidAmount {
                amount: asking_price,
            });
        }
        if asking_price > ticket.original_price {
            return Err(MarketplaceError::PriceExceedsOriginal {
                asking: asking_price,
                original: ticket.original_price,
            });
        }
        Ok(())
    }

    fn validate_create(
        state: &ListingState,
        seller_id: UserId,
        asking_price: Money,
    ) -> Result<(), MarketplaceError> {
        let ticket = &state.ticket;
        if ticket.owner_id != Some(seller_id) {
            return Err(MarketplaceError::NotOwner(format!(
                "user {seller_id} does not own ticket {}",
                ticket.id
            )));
        }
        if let Some(listing) = &state.listing {
            match listing.status {
                ListingStatus::Active => {
                    return Err(MarketplaceError::DuplicateListing {
                        ticket_id: ticket.id,
                    });
                },
                ListingStatus::Sold => {
                    return Err(MarketplaceError::AlreadySold {
                        ticket_id: ticket.id,
                        listing_id: listing.id,
                    });
                },
                ListingStatus::Cancelled => {},
            }
        }
        if ticket.status != TicketStatus::Purchased {
            return Err(MarketplaceError::InvalidState(format!(
                "ticket {} cannot be listed (status {})",
                ticket.id, ticket.status
            )));
        }
        Self::validate_price(ticket, asking_price)
    }

    fn active_listing_of(
        state: &ListingState,
        seller_id: UserId,
    ) -> Result<&TicketListing, MarketplaceError> {
        let listing = state
            .listing
            .as_ref()
            .ok_or_else(|| MarketplaceError::InvalidState(format!("ticket {} is not listed", state.ticket.id)))?;
        if listing.seller_id != seller_id {
            return Err(MarketplaceError::NotOwner(format!(
                "user {seller_id} is not the seller of listing {}",
                listing.id
            )));
        }
        if listing.status != ListingStatus::Active {
            return Err(MarketplaceError::InvalidState(format!(
                "listing {} is {}",
                listing.id, listing.status
            )));
        }
        Ok(listing)
    }

    fn validate_mark_sold(state: &ListingState, buyer_id: UserId) -> Result<(), MarketplaceError> {
        let listing = state
            .listing
            .as_ref()
            .ok_or_else(|| MarketplaceError::InvalidState(format!("ticket {} is not listed", state.ticket.id)))?;
        if listing.status != ListingStatus::Active {
            return Err(MarketplaceError::InvalidState(format!(
                "listing {} is {}",
                listing.id, listing.status
            )));
        }
        if listing.seller_id == buyer_id {
            return Err(MarketplaceError::SelfPurchase {
                listing_id: listing.id,
            });
        }
        Ok(())
    }

    fn apply_event(state: &mut ListingState, action: &ListingAction) {
        match action {
            ListingAction::ListingCreated { listing } => {
                state.ticket.status = TicketStatus::Listed;
                state.ticket.current_price = listing.asking_price;
                state.listing = Some(listing.clone());
                state.last_error = None;
            },
            ListingAction::ListingReactivated {
                asking_price,
                description,
                listed_at,
            } => {
                if let Some(listing) = state.listing.as_mut() {
                    listing.status = ListingStatus::Active;
                    listing.asking_price = *asking_price;
                    listing.description.clone_from(description);
                    listing.listing_date = *listed_at;
                    listing.seller_id = state.ticket.owner_id.unwrap_or(listing.seller_id);
                }
                state.ticket.status = TicketStatus::Listed;
                state.ticket.current_price = *asking_price;
                state.last_error = None;
            },
            ListingAction::ListingUpdated {
                asking_price,
                description,
            } => {
                if let Some(listing) = state.listing.as_mut() {
                    listing.asking_price = *asking_price;
                    listing.description.clone_from(description);
                }
                state.ticket.current_price = *asking_price;
                state.last_error = None;
            },
            ListingAction::ListingCancelled => {
                if let Some(listing) = state.listing.as_mut() {
                    listing.status = ListingStatus::Cancelled;
                }
                state.ticket.status = TicketStatus::Purchased;
                state.ticket.current_price = state.ticket.original_price;
                state.last_error = None;
            },
            ListingAction::ListingSold => {
                if let Some(listing) = state.listing.as_mut() {
                    listing.status = ListingStatus::Sold;
                }
                state.last_error = None;
            },
            ListingAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            ListingAction::CreateListing { .. }
            | ListingAction::UpdateListing { .. }
            | ListingAction::CancelListing { .. }
            | ListingAction::MarkSold { .. } => {},
        }
    }

    fn audit(
        env: &MarketplaceEnvironment,
        action: &'static str,
        listing: &TicketListing,
    ) -> Effect<ListingAction> {
        let record = AuditRecord::new(action, "TicketListing", listing.id, Some(listing.seller_id), env.clock.now())
            .with_details(json!({
                "ticket_id": listing.ticket_id.to_string(),
                "asking_price_cents": listing.asking_price.cents(),
                "status": listing.status.as_str(),
            }));
        audit_effect(&env.audit, record)
    }
}

impl Reducer for ListingReducer {
    type State = ListingState;
    type Action = ListingAction;
    type Environment = MarketplaceEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let (event, audit_action) = match action {
            ListingAction::CreateListing {
                listing_id,
                seller_id,
                asking_price,
                description,
            } => {
                if let Err(error) = Self::validate_create(state, seller_id, asking_price) {
                    Self::apply_event(state, &ListingAction::Rejected { error });
                    return SmallVec::new();
                }
                let listed_at = env.clock.now();
                if state.listing.is_some() {
                    (
                        ListingAction::ListingReactivated {
                            asking_price,
                            description,
                            listed_at,
                        },
                        "LISTING_REACTIVATED",
                    )
                } else {
                    let listing = TicketListing {
                        id: listing_id,
                        ticket_id: state.ticket.id,
                        seller_id,
                        asking_price,
                        description,
                        listing_date: listed_at,
                        status: ListingStatus::Active,
                    };
                    (ListingAction::ListingCreated { listing }, "LISTING_CREATED")
                }
            },

            ListingAction::UpdateListing {
                seller_id,
                asking_price,
                description,
            } => {
                let validated = Self::active_listing_of(state, seller_id)
                    .and_then(|_| Self::validate_price(&state.ticket, asking_price));
                if let Err(error) = validated {
                    Self::apply_event(state, &ListingAction::Rejected { error });
                    return SmallVec::new();
                }
                (
                    ListingAction::ListingUpdated {
                        asking_price,
                        description,
                    },
                    "LISTING_UPDATED",
                )
            },

            ListingAction::CancelListing { seller_id } => {
                if let Err(error) = Self::active_listing_of(state, seller_id).map(|_| ()) {
                    Self::apply_event(state, &ListingAction::Rejected { error });
                    return SmallVec::new();
                }
                (ListingAction::ListingCancelled, "LISTING_CANCELLED")
            },

            ListingAction::MarkSold { buyer_id } => {
                if let Err(error) = Self::validate_mark_sold(state, buyer_id) {
                    Self::apply_event(state, &ListingAction::Rejected { error });
                    return SmallVec::new();
                }
                // Audited with the secondary purchase transaction
                Self::apply_event(state, &ListingAction::ListingSold);
                return SmallVec::new();
            },

            event => {
                Self::apply_event(state, &event);
                return SmallVec::new();
            },
        };

        Self::apply_event(state, &event);
        match &state.listing {
            Some(listing) => smallvec![Self::audit(env, audit_action, listing)],
            None => SmallVec::new(),
        }
    }
}
