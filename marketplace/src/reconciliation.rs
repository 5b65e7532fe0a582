//! Resolution of PENDING transactions that were never confirmed.
//!
//! Two paths close them: gateway callbacks ([`Reconciler::handle_gateway_event`])
//! and a periodic sweep ([`Reconciler::expire_stale_pending`]) that re-checks
//! card payments at the gateway and expires balance payments nobody
//! confirmed. Inventory is only touched at completion, so expiring a
//! transaction never has to release a ticket.

use crate::config::ReconciliationConfig;
use crate::error::{MarketplaceError, Result};
use crate::payment_gateway::IntentStatus;
use crate::services::TransactionOrchestrator;
use crate::store::MarketplaceStore;
use crate::types::{PaymentMethod, Transaction, TransactionStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Payment status callback from the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Intent the callback is about
    pub intent_ref: String,
    /// What happened
    pub outcome: GatewayOutcome,
}

/// Outcome reported by a gateway callback
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// Payment captured
    Succeeded,
    /// Payment failed for good
    Failed {
        /// Gateway's reason
        reason: String,
    },
}

/// Counts from one expiry sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    /// PENDING transactions older than the cutoff
    pub examined: usize,
    /// Completed because the gateway reported success
    pub completed: usize,
    /// Marked FAILED
    pub failed: usize,
    /// Left PENDING because the gateway still reports pending
    pub still_pending: usize,
}

/// Closes stale and externally-settled PENDING transactions
pub struct Reconciler<S> {
    transactions: TransactionOrchestrator<S>,
    config: ReconciliationConfig,
}

impl<S> std::fmt::Debug for Reconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: MarketplaceStore> Reconciler<S> {
    /// Creates a new `Reconciler`
    #[must_use]
    pub const fn new(transactions: TransactionOrchestrator<S>, config: ReconciliationConfig) -> Self {
        Self { transactions, config }
    }

    /// Applies a gateway callback.
    ///
    /// Success is re-verified with the gateway before the purchase is
    /// completed. Callbacks for unknown intents or transactions that are no
    /// longer PENDING change nothing and return `None`, so redelivery is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Those of [`TransactionOrchestrator::confirm_with_gateway`]
    pub async fn handle_gateway_event(&self, event: GatewayEvent) -> Result<Option<Transaction>> {
        let Some(transaction) = self.transactions.transaction_by_intent(&event.intent_ref).await? else {
            tracing::warn!(intent_ref = %event.intent_ref, "Gateway event for unknown intent");
            return Ok(None);
        };
        if transaction.status != TransactionStatus::Pending {
            tracing::debug!(
                intent_ref = %event.intent_ref,
                transaction_id = %transaction.id,
                status = %transaction.status,
                "Gateway event for settled transaction ignored"
            );
            return Ok(None);
        }

        match event.outcome {
            GatewayOutcome::Succeeded => self
                .transactions
                .confirm_with_gateway(transaction.id)
                .await
                .map(Some),
            GatewayOutcome::Failed { reason } => self.transactions.mark_failed(transaction.id, &reason).await,
        }
    }

    /// Resolves every PENDING transaction opened more than `older_than` ago.
    ///
    /// Card payments are re-checked at the gateway: success completes the
    /// purchase, pending leaves it alone, anything else fails it. Balance
    /// payments, and card payments that never got an intent, fail with
    /// reason `expired`. A failure on one transaction is logged and the
    /// sweep moves on.
    ///
    /// # Errors
    ///
    /// Storage failure while listing the PENDING transactions
    pub async fn expire_stale_pending(&self, older_than: chrono::Duration) -> Result<ExpirySweep> {
        let cutoff = self.transactions.now() - older_than;
        let stale = self.transactions.pending_before(cutoff).await?;
        let mut sweep = ExpirySweep {
            examined: stale.len(),
            ..ExpirySweep::default()
        };

        for transaction in stale {
            let id = transaction.id;
            let has_intent = transaction.payment_intent_ref.is_some();
            if transaction.payment_method == PaymentMethod::Card && has_intent {
                match self.transactions.confirm_with_gateway(id).await {
                    Ok(_) => sweep.completed += 1,
                    Err(MarketplaceError::PaymentNotSucceeded {
                        status: IntentStatus::Pending,
                        ..
                    }) => sweep.still_pending += 1,
                    Err(error) => match self.transactions.transaction(id).await {
                        Ok(current) if current.status == TransactionStatus::Failed => sweep.failed += 1,
                        Ok(current) if current.status == TransactionStatus::Pending => {
                            tracing::warn!(transaction_id = %id, %error, "Stale transaction left pending");
                            sweep.still_pending += 1;
                        },
                        Ok(_) => {},
                        Err(lookup) => {
                            tracing::error!(transaction_id = %id, error = %lookup, "Sweep lookup failed");
                        },
                    },
                }
            } else {
                match self.transactions.mark_failed(id, "expired").await {
                    Ok(Some(_)) => sweep.failed += 1,
                    Ok(None) => {},
                    Err(error) => {
                        tracing::error!(transaction_id = %id, %error, "Could not expire transaction");
                    },
                }
            }
        }

        tracing::info!(
            examined = sweep.examined,
            completed = sweep.completed,
            failed = sweep.failed,
            still_pending = sweep.still_pending,
            "Pending transaction sweep finished"
        );
        Ok(sweep)
    }

    /// Runs the sweep every configured interval until `shutdown` turns `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            pending_ttl_secs = self.config.pending_ttl_secs,
            "Reconciler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.expire_stale_pending(self.config.pending_ttl()).await {
                        tracing::error!(%error, "Pending transaction sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Spawns [`Reconciler::run`] on the current runtime.
    ///
    /// Send `true` on the returned sender to stop it.
    #[must_use]
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        (handle, shutdown_tx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_event_wire_format() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"intent_ref":"pi_1","outcome":{"type":"failed","reason":"card_declined"}}"#,
        )
        .unwrap();
        assert_eq!(
            event.outcome,
            GatewayOutcome::Failed {
                reason: "card_declined".to_string()
            }
        );

        let json = serde_json::to_string(&GatewayEvent {
            intent_ref: "pi_2".to_string(),
            outcome: GatewayOutcome::Succeeded,
        })
        .unwrap();
        assert_eq!(json, r#"{"intent_ref":"pi_2","outcome":{"type":"succeeded"}}"#);
    }
}
