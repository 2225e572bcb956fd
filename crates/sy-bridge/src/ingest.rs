use std::sync::Arc;

use serde_json::Value;
use sy_broker::QueueRegistry;
use sy_core::config::BrokerConfig;
use sy_core::types::{HitlRequest, TaskEnvelope, TaskType, Urgency};
use sy_escalation::EscalationEngine;
use sy_hitl::HitlService;
use sy_telemetry::metrics::{global_metrics, ENVELOPES_ENQUEUED, ESCALATIONS_RAISED};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no queue routes task type '{0}'")]
    UnroutedTaskType(TaskType),
    #[error(transparent)]
    Broker(#[from] sy_broker::BrokerError),
    #[error(transparent)]
    Hitl(#[from] sy_hitl::HitlError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

// ---------------------------------------------------------------------------
// IngestService
// ---------------------------------------------------------------------------

/// What happened to an inbound business event.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The event passed classification and was enqueued for automated
    /// processing.
    Enqueued { envelope_id: Uuid, queue: String },
    /// Classification flagged the event at ingestion time; it went straight
    /// to the review store, bypassing the auto queue entirely.
    Escalated { request_id: Uuid, urgency: Urgency },
}

/// The inbound boundary: build an envelope from a business event, classify
/// it, and route it to either its auto queue or the review store.
pub struct IngestService {
    registry: Arc<QueueRegistry>,
    escalation: EscalationEngine,
    hitl: Arc<HitlService>,
    broker_config: BrokerConfig,
}

impl IngestService {
    pub fn new(
        registry: Arc<QueueRegistry>,
        escalation: EscalationEngine,
        hitl: Arc<HitlService>,
        broker_config: BrokerConfig,
    ) -> Self {
        Self {
            registry,
            escalation,
            hitl,
            broker_config,
        }
    }

    pub async fn ingest(
        &self,
        tenant_id: &str,
        task_type: TaskType,
        payload: Value,
        priority: u8,
    ) -> Result<IngestOutcome> {
        let queue = self
            .broker_config
            .queue_for(task_type)
            .ok_or(IngestError::UnroutedTaskType(task_type))?;

        let decision = self.escalation.evaluate(task_type, &payload);
        if decision.should_escalate {
            let request = HitlRequest::new(
                tenant_id,
                task_type,
                decision.urgency,
                decision.triggers,
                payload,
                None,
                &queue.name,
                priority,
            );
            let request_id = self.hitl.create_request(request).await?;
            global_metrics()
                .increment_counter(ESCALATIONS_RAISED, &[("urgency", decision.urgency.as_str())]);
            info!(
                request_id = %request_id,
                tenant = tenant_id,
                task_type = %task_type,
                urgency = decision.urgency.as_str(),
                "inbound event escalated at ingestion"
            );
            return Ok(IngestOutcome::Escalated {
                request_id,
                urgency: decision.urgency,
            });
        }

        let envelope = TaskEnvelope::new(tenant_id, task_type, payload, priority);
        let envelope_id = envelope.id;
        self.registry.enqueue(&queue.name, envelope)?;
        global_metrics().increment_counter(ENVELOPES_ENQUEUED, &[("queue", &queue.name)]);
        info!(
            envelope_id = %envelope_id,
            tenant = tenant_id,
            queue = %queue.name,
            "inbound event enqueued"
        );
        Ok(IngestOutcome::Enqueued {
            envelope_id,
            queue: queue.name.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sy_core::config::HitlConfig;
    use sy_events::EventLog;
    use sy_hitl::HitlDb;

    async fn service() -> IngestService {
        let broker_config = BrokerConfig::default();
        let registry = Arc::new(QueueRegistry::from_config(&broker_config).unwrap());
        let hitl = Arc::new(HitlService::new(
            HitlDb::new_in_memory().await.unwrap(),
            EventLog::new(),
            Arc::clone(&registry),
            HitlConfig::default(),
        ));
        IngestService::new(
            Arc::clone(&registry),
            EscalationEngine::default(),
            hitl,
            broker_config,
        )
    }

    #[tokio::test]
    async fn clean_event_lands_on_its_auto_queue() {
        let svc = service().await;
        let outcome = svc
            .ingest("acme", TaskType::Order, json!({"amount": 40.0}), 2)
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Enqueued { queue, .. } => assert_eq!(queue, "order.auto"),
            other => panic!("expected Enqueued, got {other:?}"),
        }
        assert_eq!(svc.registry.get("order.auto").unwrap().depth(), 1);
        assert!(svc
            .hitl
            .list_pending("acme", None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn flagged_event_bypasses_the_queue() {
        let svc = service().await;
        let outcome = svc
            .ingest(
                "acme",
                TaskType::Order,
                json!({"amount": 9000.0, "fraud_score": 0.95}),
                2,
            )
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Escalated { urgency, .. } => assert_eq!(urgency, Urgency::High),
            other => panic!("expected Escalated, got {other:?}"),
        }
        assert_eq!(svc.registry.get("order.auto").unwrap().depth(), 0);

        let pending = svc.hitl.list_pending("acme", None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].origin_queue, "order.auto");
        assert!(pending[0].ai_recommendation.is_none());
    }

    #[tokio::test]
    async fn out_of_range_priority_is_rejected() {
        let svc = service().await;
        let err = svc
            .ingest("acme", TaskType::Order, json!({"amount": 10.0}), 99)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Broker(sy_broker::BrokerError::PriorityOutOfRange { .. })
        ));
    }
}
