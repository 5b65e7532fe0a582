//! Buyer and seller notifications.

use crate::audit::DeliveryError;
use crate::types::Transaction;
use futures::future::BoxFuture;
use marketplace_core::effect::Effect;
use std::sync::{Arc, Mutex, PoisonError};

/// Message sent after a money-moving transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Purchase completed; buyer (and seller, if any) are informed
    PurchaseCompleted {
        /// The completed transaction
        transaction: Transaction,
    },
    /// Money returned to the buyer
    Refunded {
        /// The refunded transaction
        transaction: Transaction,
    },
}

impl Notification {
    /// The transaction the message is about
    #[must_use]
    pub const fn transaction(&self) -> &Transaction {
        match self {
            Self::PurchaseCompleted { transaction } | Self::Refunded { transaction } => transaction,
        }
    }
}

/// Delivery channel for notifications (email, push)
pub trait Notifier: Send + Sync {
    /// Sends one notification
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the message could not be sent
    fn notify(&self, notification: Notification) -> BoxFuture<'static, Result<(), DeliveryError>>;
}

/// Builds the post-commit effect that sends `notification`; failures are logged and swallowed
pub fn notify_effect<A>(notifier: &Arc<dyn Notifier>, notification: Notification) -> Effect<A>
where
    A: Send + 'static,
{
    let notifier = Arc::clone(notifier);
    Effect::future(async move {
        let transaction_id = notification.transaction().id();
        if let Err(error) = notifier.notify(notification).await {
            tracing::warn!(%error, transaction_id = %transaction_id, "Notification failed");
        }
        None
    })
}

/// Logs notifications instead of sending them
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'static, Result<(), DeliveryError>> {
        Box::pin(async move {
            let transaction = notification.transaction();
            let kind = match &notification {
                Notification::PurchaseCompleted { .. } => "purchase_completed",
                Notification::Refunded { .. } => "refunded",
            };
            tracing::info!(
                kind,
                transaction_number = %transaction.transaction_number(),
                buyer_id = %transaction.buyer_id(),
                seller_id = ?transaction.seller_id().map(|id| id.to_string()),
                amount = %transaction.amount(),
                "Notification sent"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct Sent {
    notifications: Vec<Notification>,
    failing: bool,
}

/// Records notifications for assertions
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    inner: Arc<Mutex<Sent>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).notifications.clone()
    }

    /// Makes every send fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failing = failing;
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.failing {
                return Err(DeliveryError("mail relay unavailable".to_string()));
            }
            inner.notifications.push(notification);
            Ok(())
        })
    }
}
