//! Payment gateway contract and a scriptable mock.
//!
//! The marketplace only depends on the three calls below. Real providers
//! (Stripe and friends) implement [`PaymentGateway`] outside this crate; the
//! [`MockPaymentGateway`] is used by tests and the demo binary.

use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentGatewayError {
    /// Card declined
    #[error("Card declined: {reason}")]
    CardDeclined {
        /// Decline reason
        reason: String,
    },
    /// The gateway does not know this intent
    #[error("Unknown payment intent: {intent_ref}")]
    UnknownIntent {
        /// Intent reference
        intent_ref: String,
    },
    /// Gateway did not answer in time
    #[error("Gateway timeout")]
    Timeout,
    /// Other error
    #[error("Payment error: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

/// Status of a payment intent as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentStatus {
    /// Funds captured
    Succeeded,
    /// Waiting for the customer or the card network
    Pending,
    /// Payment attempt failed
    Failed,
    /// Intent was canceled
    Canceled,
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

/// Handle returned when a card payment is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIntent {
    /// Gateway reference, stored on the transaction
    pub intent_ref: String,
    /// Secret handed to the client to complete the payment
    pub client_secret: String,
}

/// Intent state as retrieved from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    /// Gateway reference
    pub intent_ref: String,
    /// Amount the intent was opened for
    pub amount: Money,
    /// ISO currency code
    pub currency: String,
    /// Current status
    pub status: IntentStatus,
}

/// Payment gateway trait
///
/// Abstraction over card payment processors. The marketplace treats any status
/// other than [`IntentStatus::Succeeded`] as not confirmed, and never retries a
/// failed call on its own.
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment intent for `amount`
    ///
    /// # Errors
    ///
    /// Returns error if the gateway rejects or cannot be reached
    fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        description: &str,
    ) -> GatewayFuture<CreatedIntent>;

    /// Retrieves the current state of an intent
    ///
    /// # Errors
    ///
    /// Returns error if the intent is unknown or the gateway cannot be reached
    fn retrieve_intent(&self, intent_ref: &str) -> GatewayFuture<PaymentIntent>;

    /// Refunds `amount` of a captured intent, returning the refund reference
    ///
    /// Calls sharing an `idempotency_key` refund at most once; repeats return
    /// the reference of the first refund.
    ///
    /// # Errors
    ///
    /// Returns error if the refund is rejected
    fn create_refund(&self, intent_ref: &str, amount: Money, idempotency_key: &str) -> GatewayFuture<String>;
}

#[derive(Debug, Default)]
struct MockState {
    intents: HashMap<String, PaymentIntent>,
    refunds: Vec<(String, Money)>,
    refunds_by_key: HashMap<String, String>,
    create_failure: Option<PaymentGatewayError>,
    retrieve_failure: Option<PaymentGatewayError>,
    refund_failure: Option<PaymentGatewayError>,
}

/// Mock payment gateway
///
/// New intents start in the configured initial status (`Pending` unless
/// changed with [`MockPaymentGateway::with_initial_status`]). Tests drive
/// outcomes with [`MockPaymentGateway::set_status`] and inject one-shot
/// failures with the `fail_next_*` methods. Clones share state.
#[derive(Clone, Debug)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<MockState>>,
    initial_status: IntentStatus,
    latency: Duration,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            initial_status: IntentStatus::Pending,
            latency: Duration::ZERO,
        }
    }

    /// Status newly created intents start in
    #[must_use]
    pub const fn with_initial_status(mut self, status: IntentStatus) -> Self {
        self.initial_status = status;
        self
    }

    /// Simulated network delay applied to every call
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared(self) -> Arc<dyn PaymentGateway> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves an intent to `status` (e.g. the customer completed 3-D Secure)
    pub fn set_status(&self, intent_ref: &str, status: IntentStatus) {
        if let Some(intent) = self.lock().intents.get_mut(intent_ref) {
            intent.status = status;
        }
    }

    /// Current view of an intent
    #[must_use]
    pub fn intent(&self, intent_ref: &str) -> Option<PaymentIntent> {
        self.lock().intents.get(intent_ref).cloned()
    }

    /// Refunds issued so far as `(intent_ref, amount)`
    #[must_use]
    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.lock().refunds.clone()
    }

    /// Makes the next `create_intent` call fail
    pub fn fail_next_create(&self, error: PaymentGatewayError) {
        self.lock().create_failure = Some(error);
    }

    /// Makes the next `retrieve_intent` call fail
    pub fn fail_next_retrieve(&self, error: PaymentGatewayError) {
        self.lock().retrieve_failure = Some(error);
    }

    /// Makes the next `create_refund` call fail
    pub fn fail_next_refund(&self, error: PaymentGatewayError) {
        self.lock().refund_failure = Some(error);
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        description: &str,
    ) -> GatewayFuture<CreatedIntent> {
        let this = self.clone();
        let currency = currency.to_string();
        let description = description.to_string();
        Box::pin(async move {
            tokio::time::sleep(this.latency).await;

            let mut state = this.lock();
            if let Some(error) = state.create_failure.take() {
                tracing::warn!(%error, "Mock gateway rejected intent creation");
                return Err(error);
            }

            let intent_ref = format!("pi_mock_{}", uuid::Uuid::new_v4().simple());
            let client_secret = format!("{intent_ref}_secret_{}", uuid::Uuid::new_v4().simple());
            state.intents.insert(
                intent_ref.clone(),
                PaymentIntent {
                    intent_ref: intent_ref.clone(),
                    amount,
                    currency,
                    status: this.initial_status,
                },
            );

            tracing::info!(
                intent_ref = %intent_ref,
                amount = amount.cents(),
                description = %description,
                "Mock payment intent created"
            );

            Ok(CreatedIntent {
                intent_ref,
                client_secret,
            })
        })
    }

    fn retrieve_intent(&self, intent_ref: &str) -> GatewayFuture<PaymentIntent> {
        let this = self.clone();
        let intent_ref = intent_ref.to_string();
        Box::pin(async move {
            tokio::time::sleep(this.latency).await;

            let mut state = this.lock();
            if let Some(error) = state.retrieve_failure.take() {
                return Err(error);
            }
            state
                .intents
                .get(&intent_ref)
                .cloned()
                .ok_or(PaymentGatewayError::UnknownIntent { intent_ref })
        })
    }

    fn create_refund(&self, intent_ref: &str, amount: Money, idempotency_key: &str) -> GatewayFuture<String> {
        let this = self.clone();
        let intent_ref = intent_ref.to_string();
        let idempotency_key = idempotency_key.to_string();
        Box::pin(async move {
            tokio::time::sleep(this.latency).await;

            let mut state = this.lock();
            if let Some(error) = state.refund_failure.take() {
                tracing::warn!(%error, intent_ref = %intent_ref, "Mock gateway rejected refund");
                return Err(error);
            }
            match state.intents.get(&intent_ref) {
                Some(intent) if intent.status == IntentStatus::Succeeded => {},
                Some(intent) => {
                    return Err(PaymentGatewayError::Other {
                        message: format!("cannot refund intent in status {}", intent.status),
                    });
                },
                None => return Err(PaymentGatewayError::UnknownIntent { intent_ref }),
            }
            if let Some(refund_ref) = state.refunds_by_key.get(&idempotency_key) {
                tracing::debug!(intent_ref = %intent_ref, refund_ref = %refund_ref, "Mock refund replayed");
                return Ok(refund_ref.clone());
            }

            let refund_ref = format!("re_mock_{}", uuid::Uuid::new_v4().simple());
            state.refunds.push((intent_ref.clone(), amount));
            state.refunds_by_key.insert(idempotency_key, refund_ref.clone());

            tracing::info!(
                intent_ref = %intent_ref,
                amount = amount.cents(),
                refund_ref = %refund_ref,
                "Mock refund processed"
            );

            Ok(refund_ref)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_intent_lifecycle() {
        let gateway = MockPaymentGateway::new();
        let created = gateway
            .create_intent(Money::from_dollars(100), "usd", "ticket")
            .await
            .unwrap();
        assert!(created.intent_ref.starts_with("pi_mock_"));
        assert!(created.client_secret.starts_with(&created.intent_ref));

        let intent = gateway.retrieve_intent(&created.intent_ref).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.amount, Money::from_dollars(100));

        gateway.set_status(&created.intent_ref, IntentStatus::Succeeded);
        let intent = gateway.retrieve_intent(&created.intent_ref).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_refund_requires_captured_intent() {
        let gateway = MockPaymentGateway::new();
        let created = gateway
            .create_intent(Money::from_dollars(20), "usd", "ticket")
            .await
            .unwrap();

        let result = gateway
            .create_refund(&created.intent_ref, Money::from_dollars(20), "refund-1")
            .await;
        assert!(matches!(result, Err(PaymentGatewayError::Other { .. })));

        gateway.set_status(&created.intent_ref, IntentStatus::Succeeded);
        let refund = gateway
            .create_refund(&created.intent_ref, Money::from_dollars(20), "refund-1")
            .await
            .unwrap();
        assert!(refund.starts_with("re_mock_"));
        assert_eq!(gateway.refunds(), vec![(created.intent_ref, Money::from_dollars(20))]);
    }

    #[tokio::test]
    async fn test_refund_key_replays_first_refund() {
        let gateway = MockPaymentGateway::new().with_latency(Duration::from_millis(20));
        let created = gateway
            .create_intent(Money::from_dollars(30), "usd", "ticket")
            .await
            .unwrap();
        gateway.set_status(&created.intent_ref, IntentStatus::Succeeded);

        let (first, second) = tokio::join!(
            gateway.create_refund(&created.intent_ref, Money::from_dollars(30), "refund-a"),
            gateway.create_refund(&created.intent_ref, Money::from_dollars(30), "refund-a"),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(gateway.refunds().len(), 1);

        // A different key is a different refund
        gateway
            .create_refund(&created.intent_ref, Money::from_dollars(5), "refund-b")
            .await
            .unwrap();
        assert_eq!(gateway.refunds().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_next_create(PaymentGatewayError::CardDeclined {
            reason: "stolen".to_string(),
        });

        let first = gateway.create_intent(Money::from_dollars(1), "usd", "x").await;
        assert!(matches!(first, Err(PaymentGatewayError::CardDeclined { .. })));

        let second = gateway.create_intent(Money::from_dollars(1), "usd", "x").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_intent() {
        let gateway = MockPaymentGateway::new();
        let result = gateway.retrieve_intent("pi_missing").await;
        assert_eq!(
            result,
            Err(PaymentGatewayError::UnknownIntent {
                intent_ref: "pi_missing".to_string()
            })
        );
    }
}
