use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use sy_core::types::TaskEnvelope;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{BrokerError, Result};

// ---------------------------------------------------------------------------
// Ready / in-flight bookkeeping
// ---------------------------------------------------------------------------

/// Heap entry. Higher `priority` is served first; within a priority tier
/// the lower sequence number (earlier enqueue) wins.
#[derive(Debug)]
struct ReadyEntry {
    envelope: TaskEnvelope,
    seq: u64,
    queued_at: DateTime<Utc>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.envelope.priority == other.envelope.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct InFlight {
    envelope: TaskEnvelope,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    in_flight: HashMap<Uuid, InFlight>,
    next_seq: u64,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A priority-aware delivery channel with an in-flight claim table.
///
/// Claimed envelopes leave the ready heap, so the broker never delivers the
/// same envelope to two consumers concurrently. `ack` finishes a delivery,
/// `nack` bumps `attempt_count` and requeues. `sweep_expired` moves stale
/// entries to the paired dead-letter queue.
#[derive(Debug)]
pub struct Queue {
    name: String,
    max_priority: u8,
    message_ttl: Duration,
    /// `None` for dead-letter queues themselves; they are never swept.
    dlq: Option<Arc<Queue>>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    pub(crate) fn new(
        name: impl Into<String>,
        max_priority: u8,
        message_ttl: Duration,
        dlq: Option<Arc<Queue>>,
    ) -> Self {
        Self {
            name: name.into(),
            max_priority,
            message_ttl,
            dlq,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_priority(&self) -> u8 {
        self.max_priority
    }

    pub fn message_ttl(&self) -> Duration {
        self.message_ttl
    }

    /// The paired dead-letter queue, if this queue has one.
    pub fn dlq(&self) -> Option<&Arc<Queue>> {
        self.dlq.as_ref()
    }

    /// Number of envelopes waiting to be claimed.
    pub fn depth(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").ready.len()
    }

    /// Number of envelopes currently claimed and unacknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").in_flight.len()
    }

    /// Add an envelope to the ready set. Rejects priorities above the
    /// queue's declared bound.
    pub fn push(&self, envelope: TaskEnvelope) -> Result<()> {
        if envelope.priority > self.max_priority {
            return Err(BrokerError::PriorityOutOfRange {
                queue: self.name.clone(),
                priority: envelope.priority,
                max: self.max_priority,
            });
        }
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(ReadyEntry {
                envelope,
                seq,
                queued_at: Utc::now(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Claim the highest-priority envelope without blocking.
    pub fn try_claim(&self) -> Option<TaskEnvelope> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let entry = state.ready.pop()?;
        let envelope = entry.envelope.clone();
        state.in_flight.insert(
            envelope.id,
            InFlight {
                envelope: entry.envelope,
                claimed_at: Utc::now(),
            },
        );
        debug!(queue = %self.name, envelope_id = %envelope.id, "envelope claimed");
        Some(envelope)
    }

    /// Block until an envelope is available, then claim it.
    pub async fn claim(&self) -> TaskEnvelope {
        loop {
            if let Some(envelope) = self.try_claim() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    /// Acknowledge a claimed envelope, removing it from the queue for good.
    pub fn ack(&self, envelope_id: Uuid) -> Result<TaskEnvelope> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state
            .in_flight
            .remove(&envelope_id)
            .map(|f| f.envelope)
            .ok_or(BrokerError::UnknownDelivery(envelope_id))
    }

    /// Return a claimed envelope for redelivery, bumping `attempt_count`.
    pub fn nack(&self, envelope_id: Uuid) -> Result<()> {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let mut flight = state
                .in_flight
                .remove(&envelope_id)
                .ok_or(BrokerError::UnknownDelivery(envelope_id))?;
            flight.envelope.attempt_count += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(ReadyEntry {
                envelope: flight.envelope,
                seq,
                queued_at: Utc::now(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Move a claimed envelope straight to the dead-letter queue, keeping
    /// it verbatim. Used when a worker exhausts an envelope's retry budget
    /// and the stock needs operator attention rather than another requeue.
    pub fn dead_letter(&self, envelope_id: Uuid) -> Result<TaskEnvelope> {
        let dlq = self
            .dlq
            .as_ref()
            .ok_or_else(|| BrokerError::UnknownQueue(format!("{}.dlq", self.name)))?;
        let envelope = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state
                .in_flight
                .remove(&envelope_id)
                .map(|f| f.envelope)
                .ok_or(BrokerError::UnknownDelivery(envelope_id))?
        };
        warn!(
            queue = %self.name,
            dlq = %dlq.name,
            envelope_id = %envelope.id,
            "envelope dead-lettered"
        );
        dlq.push(envelope.clone())?;
        Ok(envelope)
    }

    /// Move every envelope that has sat unclaimed, or claimed without an
    /// ack, for longer than `message_ttl` to the dead-letter queue,
    /// verbatim, same id, nothing incremented. Returns the moved envelopes.
    ///
    /// Dead-letter queues have no sweep target and are left untouched.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<TaskEnvelope> {
        let Some(dlq) = self.dlq.as_ref() else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        {
            let mut state = self.state.lock().expect("queue lock poisoned");

            let drained = std::mem::take(&mut state.ready);
            for entry in drained.into_iter() {
                if now.signed_duration_since(entry.queued_at) > self.message_ttl {
                    expired.push(entry.envelope);
                } else {
                    state.ready.push(entry);
                }
            }

            let stale_claims: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, f)| now.signed_duration_since(f.claimed_at) > self.message_ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in stale_claims {
                if let Some(flight) = state.in_flight.remove(&id) {
                    expired.push(flight.envelope);
                }
            }
        }

        for envelope in &expired {
            warn!(
                queue = %self.name,
                dlq = %dlq.name,
                envelope_id = %envelope.id,
                "envelope expired, moving to dead-letter queue"
            );
            // DLQ shares the parent's priority bound, so this cannot fail;
            // surface it loudly if the topology invariant is ever broken.
            if let Err(e) = dlq.push(envelope.clone()) {
                warn!(error = %e, envelope_id = %envelope.id, "dead-letter push rejected");
            }
        }
        expired
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use sy_core::types::TaskType;

    fn envelope(priority: u8) -> TaskEnvelope {
        TaskEnvelope::new("acme", TaskType::Order, json!({}), priority)
    }

    fn plain_queue(ttl_secs: i64) -> Queue {
        let dlq = Arc::new(Queue::new("test.dlq", 9, Duration::seconds(ttl_secs), None));
        Queue::new("test", 9, Duration::seconds(ttl_secs), Some(dlq))
    }

    #[test]
    fn higher_priority_claimed_first_regardless_of_enqueue_order() {
        let queue = plain_queue(60);
        let low = envelope(1);
        let high = envelope(8);
        queue.push(low.clone()).unwrap();
        queue.push(high.clone()).unwrap();

        assert_eq!(queue.try_claim().unwrap().id, high.id);
        assert_eq!(queue.try_claim().unwrap().id, low.id);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let queue = plain_queue(60);
        let a = envelope(5);
        let b = envelope(5);
        queue.push(a.clone()).unwrap();
        queue.push(b.clone()).unwrap();

        assert_eq!(queue.try_claim().unwrap().id, a.id);
        assert_eq!(queue.try_claim().unwrap().id, b.id);
    }

    #[test]
    fn priority_above_bound_rejected() {
        let queue = plain_queue(60);
        let err = queue.push(envelope(10)).unwrap_err();
        assert!(matches!(err, BrokerError::PriorityOutOfRange { .. }));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn claimed_envelope_leaves_ready_set() {
        let queue = plain_queue(60);
        queue.push(envelope(3)).unwrap();
        let claimed = queue.try_claim().unwrap();
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 1);
        assert!(queue.try_claim().is_none());

        queue.ack(claimed.id).unwrap();
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn nack_increments_attempt_and_redelivers() {
        let queue = plain_queue(60);
        queue.push(envelope(3)).unwrap();
        let first = queue.try_claim().unwrap();
        assert_eq!(first.attempt_count, 0);

        queue.nack(first.id).unwrap();
        let second = queue.try_claim().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 1);
    }

    #[test]
    fn ack_of_unclaimed_envelope_is_an_error() {
        let queue = plain_queue(60);
        let err = queue.ack(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDelivery(_)));
    }

    #[test]
    fn sweep_moves_unclaimed_expired_to_dlq_once() {
        let queue = plain_queue(1);
        let env = envelope(2);
        queue.push(env.clone()).unwrap();

        // Not yet expired.
        assert!(queue.sweep_expired(Utc::now()).is_empty());

        let later = Utc::now() + Duration::seconds(5);
        let moved = queue.sweep_expired(later);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, env.id);
        assert_eq!(moved[0].attempt_count, 0);
        assert_eq!(queue.depth(), 0);

        let dlq = queue.dlq().unwrap();
        assert_eq!(dlq.depth(), 1);
        assert_eq!(dlq.try_claim().unwrap().id, env.id);

        // A second sweep finds nothing.
        assert!(queue.sweep_expired(later + Duration::seconds(5)).is_empty());
    }

    #[test]
    fn sweep_moves_stale_claims_to_dlq() {
        let queue = plain_queue(1);
        let env = envelope(2);
        queue.push(env.clone()).unwrap();
        let claimed = queue.try_claim().unwrap();
        assert_eq!(claimed.id, env.id);

        let later = Utc::now() + Duration::seconds(5);
        let moved = queue.sweep_expired(later);
        assert_eq!(moved.len(), 1);
        assert_eq!(queue.in_flight_count(), 0);
        assert_eq!(queue.dlq().unwrap().depth(), 1);
    }

    #[test]
    fn dead_letter_moves_a_claimed_envelope_verbatim() {
        let queue = plain_queue(60);
        let env = envelope(3);
        queue.push(env.clone()).unwrap();
        let claimed = queue.try_claim().unwrap();

        let moved = queue.dead_letter(claimed.id).unwrap();
        assert_eq!(moved.id, env.id);
        assert_eq!(queue.in_flight_count(), 0);
        assert_eq!(queue.dlq().unwrap().depth(), 1);

        // A second attempt has nothing to move.
        assert!(matches!(
            queue.dead_letter(claimed.id),
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[test]
    fn dlq_itself_is_never_swept() {
        let queue = plain_queue(1);
        queue.push(envelope(2)).unwrap();
        let later = Utc::now() + Duration::seconds(5);
        queue.sweep_expired(later);

        let dlq = queue.dlq().unwrap();
        assert_eq!(dlq.depth(), 1);
        // Even far past the TTL, dead-lettered stock stays put.
        assert!(dlq.sweep_expired(later + Duration::days(1)).is_empty());
        assert_eq!(dlq.depth(), 1);
    }

    #[tokio::test]
    async fn claim_blocks_until_push() {
        let queue = Arc::new(plain_queue(60));
        let claimer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.claim().await })
        };

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let env = envelope(4);
        queue.push(env.clone()).unwrap();

        let claimed = tokio::time::timeout(StdDuration::from_secs(1), claimer)
            .await
            .expect("claim should complete")
            .unwrap();
        assert_eq!(claimed.id, env.id);
    }

    #[tokio::test]
    async fn concurrent_claimers_each_get_distinct_envelopes() {
        let queue = Arc::new(plain_queue(60));
        for _ in 0..10 {
            queue.push(envelope(5)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(env) = queue.try_claim() {
                    queue.ack(env.id).unwrap();
                    claimed.push(env.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 10, "each envelope delivered to exactly one claimer");
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }
}
