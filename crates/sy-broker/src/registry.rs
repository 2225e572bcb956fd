use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sy_core::config::BrokerConfig;
use sy_core::types::TaskEnvelope;
use tracing::{debug, info};

use crate::queue::Queue;
use crate::{BrokerError, Result};

// ---------------------------------------------------------------------------
// QueueRegistry
// ---------------------------------------------------------------------------

/// Owns the queue topology for the engine's lifetime.
///
/// Declaring a queue also creates its paired `<name>.dlq` sibling; the
/// `.dlq` suffix is reserved so dead-letter queues can never chain.
/// Re-declaring an existing name is idempotent when the parameters match
/// and an error when they differ.
pub struct QueueRegistry {
    queues: DashMap<String, Arc<Queue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Build a registry with every queue from the broker config declared.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let registry = Self::new();
        for q in &config.queues {
            registry.declare(&q.name, q.max_priority, Duration::seconds(q.message_ttl_secs as i64))?;
        }
        Ok(registry)
    }

    /// Declare a queue (and its dead-letter pair), returning a handle.
    pub fn declare(
        &self,
        name: &str,
        max_priority: u8,
        message_ttl: Duration,
    ) -> Result<Arc<Queue>> {
        if name.ends_with(".dlq") {
            return Err(BrokerError::ReservedDlqName(name.to_string()));
        }

        if let Some(existing) = self.queues.get(name) {
            if existing.max_priority() == max_priority && existing.message_ttl() == message_ttl {
                debug!(queue = name, "queue re-declared with identical parameters");
                return Ok(Arc::clone(existing.value()));
            }
            return Err(BrokerError::ConflictingDeclaration(name.to_string()));
        }

        let dlq_name = format!("{name}.dlq");
        let dlq = Arc::new(Queue::new(&dlq_name, max_priority, message_ttl, None));
        let queue = Arc::new(Queue::new(name, max_priority, message_ttl, Some(Arc::clone(&dlq))));
        self.queues.insert(dlq_name.clone(), dlq);
        self.queues.insert(name.to_string(), Arc::clone(&queue));
        info!(queue = name, dlq = %dlq_name, max_priority, "queue declared");
        Ok(queue)
    }

    /// Enqueue an envelope onto a declared queue.
    pub fn enqueue(&self, queue_name: &str, envelope: TaskEnvelope) -> Result<()> {
        let queue = self
            .queues
            .get(queue_name)
            .ok_or_else(|| BrokerError::UnknownQueue(queue_name.to_string()))?;
        debug!(queue = queue_name, envelope_id = %envelope.id, priority = envelope.priority, "enqueue");
        queue.push(envelope)
    }

    /// Look up a declared queue (dead-letter names included).
    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// Names of all declared queues, dead-letter pairs included.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Current ready depth per queue, for the status surface.
    pub fn depths(&self) -> Vec<(String, usize)> {
        self.queues
            .iter()
            .map(|e| (e.key().clone(), e.value().depth()))
            .collect()
    }

    /// Run a TTL sweep over every queue. Dead-letter queues are skipped by
    /// construction (they have no sweep target).
    pub fn sweep_all(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for entry in self.queues.iter() {
            let moved = entry.value().sweep_expired(now);
            if !moved.is_empty() {
                report
                    .dead_lettered
                    .push((entry.key().clone(), moved.len()));
            }
        }
        report
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one registry-wide TTL sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// (queue name, envelopes moved to its DLQ) for queues that had expiry.
    pub dead_lettered: Vec<(String, usize)>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.dead_lettered.iter().map(|(_, n)| n).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sy_core::types::TaskType;

    fn env(priority: u8) -> TaskEnvelope {
        TaskEnvelope::new("acme", TaskType::Order, json!({}), priority)
    }

    #[test]
    fn declare_creates_dlq_pair() {
        let registry = QueueRegistry::new();
        registry.declare("orders", 9, Duration::seconds(60)).unwrap();
        assert!(registry.get("orders").is_some());
        assert!(registry.get("orders.dlq").is_some());
    }

    #[test]
    fn declare_is_idempotent_for_identical_parameters() {
        let registry = QueueRegistry::new();
        let first = registry.declare("orders", 9, Duration::seconds(60)).unwrap();
        let second = registry.declare("orders", 9, Duration::seconds(60)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn declare_conflict_is_rejected() {
        let registry = QueueRegistry::new();
        registry.declare("orders", 9, Duration::seconds(60)).unwrap();
        let err = registry.declare("orders", 5, Duration::seconds(60)).unwrap_err();
        assert!(matches!(err, BrokerError::ConflictingDeclaration(_)));
    }

    #[test]
    fn dlq_names_cannot_be_declared_directly() {
        let registry = QueueRegistry::new();
        let err = registry.declare("orders.dlq", 9, Duration::seconds(60)).unwrap_err();
        assert!(matches!(err, BrokerError::ReservedDlqName(_)));
    }

    #[test]
    fn enqueue_to_unknown_queue_is_rejected() {
        let registry = QueueRegistry::new();
        let err = registry.enqueue("nope", env(1)).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }

    #[test]
    fn enqueue_validates_priority_bound() {
        let registry = QueueRegistry::new();
        registry.declare("orders", 3, Duration::seconds(60)).unwrap();
        assert!(registry.enqueue("orders", env(3)).is_ok());
        let err = registry.enqueue("orders", env(4)).unwrap_err();
        assert!(matches!(err, BrokerError::PriorityOutOfRange { .. }));
    }

    #[test]
    fn from_config_declares_default_topology() {
        let config = BrokerConfig::default();
        let registry = QueueRegistry::from_config(&config).unwrap();
        assert!(registry.get("order.auto").is_some());
        assert!(registry.get("order.auto.dlq").is_some());
        assert!(registry.get("inventory.auto").is_some());
        // Four queues plus four DLQ pairs.
        assert_eq!(registry.queue_names().len(), 8);
    }

    #[test]
    fn sweep_all_reports_moved_envelopes() {
        let registry = QueueRegistry::new();
        registry.declare("orders", 9, Duration::seconds(1)).unwrap();
        registry.enqueue("orders", env(1)).unwrap();
        registry.enqueue("orders", env(2)).unwrap();

        let report = registry.sweep_all(Utc::now() + Duration::seconds(5));
        assert_eq!(report.total(), 2);
        assert_eq!(registry.get("orders.dlq").unwrap().depth(), 2);

        let quiet = registry.sweep_all(Utc::now() + Duration::seconds(10));
        assert_eq!(quiet.total(), 0);
    }
}
