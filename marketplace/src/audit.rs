//! Audit trail collaborator.
//!
//! Every successful mutating operation emits one [`AuditRecord`]. Records are
//! delivered after the unit of work commits; a failing sink is logged and never
//! affects the outcome of the operation.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use marketplace_core::effect::Effect;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Failure reported by an audit or notification collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// A structured fact about a mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Action name (`PRIMARY_PURCHASE`, `LISTING_CREATED`, ...)
    pub action: &'static str,
    /// Entity kind
    pub entity_type: &'static str,
    /// Entity id
    pub entity_id: String,
    /// Acting user, if any
    pub actor_id: Option<UserId>,
    /// Free-form details
    pub details: serde_json::Value,
    /// When the mutation happened
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a record with empty details
    #[must_use]
    pub fn new(
        action: &'static str,
        entity_type: &'static str,
        entity_id: impl ToString,
        actor_id: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            actor_id,
            details: serde_json::Value::Null,
            occurred_at,
        }
    }

    /// Attaches details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    /// Delivers one record
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the record could not be stored
    fn record(&self, record: AuditRecord) -> BoxFuture<'static, Result<(), DeliveryError>>;
}

/// Builds the post-commit effect that delivers `record`
pub fn audit_effect<A>(sink: &Arc<dyn AuditSink>, record: AuditRecord) -> Effect<A>
where
    A: Send + 'static,
{
    let sink = Arc::clone(sink);
    Effect::future(async move {
        let action = record.action;
        let entity_id = record.entity_id.clone();
        if let Err(error) = sink.record(record).await {
            tracing::warn!(%error, action, entity_id = %entity_id, "Audit delivery failed");
        }
        None
    })
}

/// Writes audit records to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) -> BoxFuture<'static, Result<(), DeliveryError>> {
        Box::pin(async move {
            tracing::info!(
                target: "audit",
                action = record.action,
                entity_type = record.entity_type,
                entity_id = %record.entity_id,
                actor_id = ?record.actor_id.map(|id| id.to_string()),
                details = %record.details,
                "audit"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct Recorded {
    records: Vec<AuditRecord>,
    failing: bool,
}

/// Collects audit records in memory (tests, demo)
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    inner: Arc<Mutex<Recorded>>,
}

impl InMemoryAuditSink {
    /// Creates an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records delivered so far
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).records.clone()
    }

    /// Actions delivered so far, in order
    #[must_use]
    pub fn actions(&self) -> Vec<&'static str> {
        self.records().iter().map(|r| r.action).collect()
    }

    /// Makes every delivery fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failing = failing;
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.failing {
                return Err(DeliveryError("audit store unavailable".to_string()));
            }
            inner.records.push(record);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_effect_delivers_record() {
        let sink = InMemoryAuditSink::new();
        let shared: Arc<dyn AuditSink> = Arc::new(sink.clone());

        let effect: Effect<()> = audit_effect(
            &shared,
            AuditRecord::new("TICKET_USED", "Ticket", "t-1", None, Utc::now()),
        );
        effect.run().await;

        assert_eq!(sink.actions(), vec!["TICKET_USED"]);
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let sink = InMemoryAuditSink::new();
        sink.set_failing(true);
        let shared: Arc<dyn AuditSink> = Arc::new(sink.clone());

        let effect: Effect<()> = audit_effect(
            &shared,
            AuditRecord::new("TICKET_USED", "Ticket", "t-1", None, Utc::now()),
        );
        assert!(effect.run().await.is_empty());
        assert!(sink.records().is_empty());
    }
}
