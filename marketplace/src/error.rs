//! Error taxonomy for marketplace operations.

use crate::payment_gateway::{IntentStatus, PaymentGatewayError};
use crate::types::{ListingId, Money, TicketId};
use thiserror::Error;

/// Result type for marketplace operations
pub type Result<T> = std::result::Result<T, MarketplaceError>;

/// Errors returned by marketplace operations.
///
/// Business-rule variants are detected before anything is written. Only
/// [`MarketplaceError::Gateway`] and [`MarketplaceError::Storage`] describe
/// failures a client may retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketplaceError {
    /// Unknown id
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("ticket", "listing", ...)
        entity: &'static str,
        /// The id that was looked up
        id: String,
    },

    /// Operation not valid for the current entity state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Non-positive monetary value
    #[error("Invalid amount: {amount} (must be greater than zero)")]
    InvalidAmount {
        /// Rejected amount
        amount: Money,
    },

    /// Wallet cannot cover the requested debit
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        /// Current balance
        available: Money,
        /// Requested amount
        required: Money,
    },

    /// Acting user does not own the entity
    #[error("Not owner: {0}")]
    NotOwner(String),

    /// Resale price above face value
    #[error("Asking price {asking} exceeds original price {original}")]
    PriceExceedsOriginal {
        /// Requested asking price
        asking: Money,
        /// Ticket face value
        original: Money,
    },

    /// The ticket already has an ACTIVE listing
    #[error("Ticket {ticket_id} already has an active listing")]
    DuplicateListing {
        /// Ticket id
        ticket_id: TicketId,
    },

    /// The ticket's listing was already sold
    #[error("Ticket {ticket_id} was already sold through listing {listing_id}")]
    AlreadySold {
        /// Ticket id
        ticket_id: TicketId,
        /// The sold listing
        listing_id: ListingId,
    },

    /// Buyer is the seller of the listing
    #[error("Cannot purchase your own listing {listing_id}")]
    SelfPurchase {
        /// Listing id
        listing_id: ListingId,
    },

    /// Gateway reported a status other than succeeded
    #[error("Payment not succeeded: intent {intent_ref} is {status}")]
    PaymentNotSucceeded {
        /// Intent reference
        intent_ref: String,
        /// Reported status
        status: IntentStatus,
    },

    /// Payment gateway failure (network, decline, timeout)
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] PaymentGatewayError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MarketplaceError {
    /// Shorthand for [`MarketplaceError::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same request
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::Storage(_))
    }

    /// Stable machine-readable code for clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidAmount { .. } => "invalid_amount",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::NotOwner(_) => "not_owner",
            Self::PriceExceedsOriginal { .. } => "price_exceeds_original",
            Self::DuplicateListing { .. } => "duplicate_listing",
            Self::AlreadySold { .. } => "already_sold",
            Self::SelfPurchase { .. } => "self_purchase",
            Self::PaymentNotSucceeded { .. } => "payment_not_succeeded",
            Self::Gateway(_) => "gateway_error",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(MarketplaceError::Gateway(PaymentGatewayError::Timeout).is_retryable());
        assert!(MarketplaceError::Storage("connection reset".into()).is_retryable());
        assert!(!MarketplaceError::InvalidState("sold".into()).is_retryable());
        assert!(
            !MarketplaceError::InsufficientBalance {
                available: Money::ZERO,
                required: Money::from_dollars(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_messages() {
        let err = MarketplaceError::PriceExceedsOriginal {
            asking: Money::from_dollars(120),
            original: Money::from_dollars(100),
        };
        assert_eq!(err.to_string(), "Asking price $120.00 exceeds original price $100.00");
        assert_eq!(err.code(), "price_exceeds_original");
        assert_eq!(
            MarketplaceError::not_found("ticket", "abc").to_string(),
            "ticket not found: abc"
        );
    }
}
