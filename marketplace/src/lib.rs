//! Ticket Marketplace - ledger and inventory-consistency engine
//!
//! Primary ticket sales from event inventory, peer-to-peer resale through
//! listings, and payment either from an internal wallet balance or through
//! an external card gateway.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────────┐
//!                        │ TransactionOrchestrator  │
//!                        │ initiate / confirm /     │
//!                        │ refund                   │
//!                        └────────────┬─────────────┘
//!              ┌──────────────────────┼──────────────────────┐
//!              ▼                      ▼                      ▼
//!      ┌──────────────┐      ┌─────────────────┐     ┌───────────────────┐
//!      │ WalletLedger │      │ TicketInventory │     │ResaleListingEngine│
//!      └──────┬───────┘      └────────┬────────┘     └─────────┬─────────┘
//!             │ reducers decide, services persist in one unit of work
//!             └───────────────────────┼────────────────────────┘
//!                                     ▼
//!                          ┌─────────────────────┐
//!                          │  MarketplaceStore   │
//!                          │ (Postgres / memory) │
//!                          └─────────────────────┘
//! ```
//!
//! Each aggregate is a pure [`Reducer`](marketplace_core::reducer::Reducer):
//! it validates a command against the loaded rows, applies the resulting
//! event and describes its audit and notification side effects. Services in
//! [`services`] load and lock the rows, run the reducers, save and commit,
//! and only then run the side effects.
//!
//! # Key Invariants
//!
//! - A ticket is sold on the primary market at most once; the last seat is
//!   decided under the ticket's row lock.
//! - A wallet balance always equals the signed sum of its ledger and is
//!   never negative.
//! - A resale asking price never exceeds the ticket's face value.
//! - A purchase either completes entirely (debit, credit, ticket, listing,
//!   transaction) or leaves no trace besides a FAILED transaction.

#![forbid(unsafe_code)]

pub mod aggregates;
pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod payment_gateway;
pub mod reconciliation;
pub mod services;
pub mod store;
pub mod types;

pub use aggregates::MarketplaceEnvironment;
pub use config::Config;
pub use error::{MarketplaceError, Result};
pub use reconciliation::{ExpirySweep, GatewayEvent, GatewayOutcome, Reconciler};
pub use services::{
    Marketplace, PurchaseIntent, ResaleListingEngine, TicketInventory, TransactionOrchestrator,
    WalletLedger,
};
pub use store::{InMemoryStore, MarketplaceStore, PostgresStore};
