//! Worker runtime: a long-lived consumer bound to one queue and one
//! task-processing function.
//!
//! Each worker instance handles exactly one envelope at a time: claim,
//! process, then acknowledge or requeue. Horizontal scale comes from
//! spawning more instances against the same queue; the broker guarantees
//! an envelope is in flight with at most one of them.

use std::sync::Arc;

use async_trait::async_trait;
use sy_broker::Queue;
use sy_core::shutdown::{DrainGuard, ShutdownSignal};
use sy_core::types::{HitlRequest, ProcessResult, TaskEnvelope, TaskType};
use sy_escalation::EscalationEngine;
use sy_events::{CompletionEvent, EventLog, FailureEvent, Topic};
use sy_hitl::HitlService;
use sy_telemetry::metrics::{
    global_metrics, ENVELOPES_ACKED, ESCALATIONS_RAISED, WORKER_RETRIES,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskProcessor
// ---------------------------------------------------------------------------

/// The opaque agent collaborator a worker runs for every claimed envelope.
/// The engine constrains only the return shape, never the implementation.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, envelope: &TaskEnvelope) -> ProcessResult;
}

/// Pushed to the optional completion sink after a successful ack, for
/// downstream notification outside the engine.
#[derive(Debug, Clone)]
pub struct CompletionNotice {
    pub envelope_id: Uuid,
    pub task_type: TaskType,
    pub output: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A single consumption loop bound to one queue.
pub struct Worker {
    queue: Arc<Queue>,
    processor: Arc<dyn TaskProcessor>,
    hitl: Arc<HitlService>,
    events: EventLog,
    escalation: EscalationEngine,
    max_attempts: u32,
    completion_tx: Option<flume::Sender<CompletionNotice>>,
}

impl Worker {
    pub fn new(
        queue: Arc<Queue>,
        processor: Arc<dyn TaskProcessor>,
        hitl: Arc<HitlService>,
        events: EventLog,
        escalation: EscalationEngine,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            processor,
            hitl,
            events,
            escalation,
            max_attempts,
            completion_tx: None,
        }
    }

    /// Attach a sink that receives a notice for every completed envelope.
    pub fn with_completion_sink(mut self, tx: flume::Sender<CompletionNotice>) -> Self {
        self.completion_tx = Some(tx);
        self
    }

    /// Run the consumption loop until shutdown. Confirms drain on exit.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        let _guard = DrainGuard::new(shutdown.clone());
        info!(queue = %self.queue.name(), "worker started");

        loop {
            if shutdown.is_shutting_down() {
                break;
            }
            let envelope = tokio::select! {
                envelope = self.queue.claim() => envelope,
                _ = shutdown_rx.recv() => break,
            };
            self.handle(envelope).await;
        }

        info!(queue = %self.queue.name(), "worker stopped");
    }

    /// Spawn the loop onto the runtime.
    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn handle(&self, envelope: TaskEnvelope) {
        match self.run_processor(&envelope).await {
            ProcessResult::Completed { output } => self.on_completed(&envelope, output),
            ProcessResult::Failed { error, retryable } => {
                self.on_failed(&envelope, error, retryable)
            }
            ProcessResult::NeedsEscalation { recommendation } => {
                self.on_escalation(&envelope, recommendation).await
            }
        }
    }

    /// Run the processor in its own task so a panic is contained and
    /// observed as a retryable failure instead of killing the worker.
    async fn run_processor(&self, envelope: &TaskEnvelope) -> ProcessResult {
        let processor = Arc::clone(&self.processor);
        let env = envelope.clone();
        match tokio::spawn(async move { processor.process(&env).await }).await {
            Ok(result) => result,
            Err(join_err) => {
                error!(
                    envelope_id = %envelope.id,
                    error = %join_err,
                    "processor task died"
                );
                ProcessResult::Failed {
                    error: format!("processor aborted: {join_err}"),
                    retryable: true,
                }
            }
        }
    }

    fn on_completed(&self, envelope: &TaskEnvelope, output: serde_json::Value) {
        if let Err(e) = self.queue.ack(envelope.id) {
            // The TTL sweep can beat a slow processor to a claimed
            // envelope; it is already in the DLQ, so do not double-record.
            warn!(envelope_id = %envelope.id, error = %e, "ack failed after completion");
            return;
        }
        self.events.append_typed(
            Topic::Completions,
            envelope.tenant_id.clone(),
            &CompletionEvent {
                envelope_id: envelope.id,
                task_type: envelope.task_type,
                attempt_count: envelope.attempt_count,
                output: output.clone(),
            },
        );
        global_metrics().increment_counter(
            ENVELOPES_ACKED,
            &[("queue", self.queue.name()), ("outcome", "completed")],
        );
        info!(
            envelope_id = %envelope.id,
            queue = %self.queue.name(),
            attempt_count = envelope.attempt_count,
            "envelope completed"
        );
        if let Some(tx) = &self.completion_tx {
            let _ = tx.send(CompletionNotice {
                envelope_id: envelope.id,
                task_type: envelope.task_type,
                output,
            });
        }
    }

    fn on_failed(&self, envelope: &TaskEnvelope, error: String, retryable: bool) {
        let budget_left = envelope.attempt_count + 1 < self.max_attempts;
        if retryable && budget_left {
            warn!(
                envelope_id = %envelope.id,
                attempt_count = envelope.attempt_count,
                error = %error,
                "retryable failure, requeueing"
            );
            if let Err(e) = self.queue.nack(envelope.id) {
                warn!(envelope_id = %envelope.id, error = %e, "nack failed");
            } else {
                global_metrics()
                    .increment_counter(WORKER_RETRIES, &[("queue", self.queue.name())]);
            }
            return;
        }

        if retryable {
            // Budget spent: the envelope goes to the dead-letter queue for
            // operator attention instead of looping forever.
            warn!(
                envelope_id = %envelope.id,
                max_attempts = self.max_attempts,
                "retry budget exhausted, dead-lettering"
            );
            if let Err(e) = self.queue.dead_letter(envelope.id) {
                warn!(envelope_id = %envelope.id, error = %e, "dead-letter failed");
                return;
            }
        } else if let Err(e) = self.queue.ack(envelope.id) {
            warn!(envelope_id = %envelope.id, error = %e, "ack failed after failure");
            return;
        }
        self.events.append_typed(
            Topic::Failures,
            envelope.tenant_id.clone(),
            &FailureEvent {
                envelope_id: envelope.id,
                task_type: envelope.task_type,
                attempt_count: envelope.attempt_count,
                error: error.clone(),
            },
        );
        global_metrics().increment_counter(
            ENVELOPES_ACKED,
            &[("queue", self.queue.name()), ("outcome", "failed")],
        );
        error!(
            envelope_id = %envelope.id,
            queue = %self.queue.name(),
            error = %error,
            "envelope failed terminally"
        );
    }

    async fn on_escalation(
        &self,
        envelope: &TaskEnvelope,
        recommendation: sy_core::types::AgentRecommendation,
    ) {
        let decision = self
            .escalation
            .evaluate(envelope.task_type, &envelope.payload);
        let request = HitlRequest::new(
            envelope.tenant_id.clone(),
            envelope.task_type,
            decision.urgency,
            decision.triggers,
            envelope.payload.clone(),
            Some(recommendation),
            self.queue.name(),
            envelope.priority,
        );
        let request_id = request.id;

        // Store the review request before acknowledging; if the store is
        // down the envelope stays claimable rather than vanishing.
        match self.hitl.create_request(request).await {
            Ok(_) => {
                if let Err(e) = self.queue.ack(envelope.id) {
                    warn!(envelope_id = %envelope.id, error = %e, "ack failed after escalation");
                    return;
                }
                global_metrics().increment_counter(
                    ESCALATIONS_RAISED,
                    &[("urgency", decision.urgency.as_str())],
                );
                info!(
                    envelope_id = %envelope.id,
                    request_id = %request_id,
                    urgency = decision.urgency.as_str(),
                    "envelope escalated for human review"
                );
            }
            Err(e) => {
                error!(
                    envelope_id = %envelope.id,
                    error = %e,
                    "failed to create review request, requeueing envelope"
                );
                if let Err(e) = self.queue.nack(envelope.id) {
                    warn!(envelope_id = %envelope.id, error = %e, "nack failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;
    use sy_broker::QueueRegistry;
    use sy_core::config::HitlConfig;
    use sy_core::types::AgentRecommendation;
    use sy_hitl::HitlDb;

    struct Fixture {
        registry: Arc<QueueRegistry>,
        queue: Arc<Queue>,
        hitl: Arc<HitlService>,
        events: EventLog,
        shutdown: ShutdownSignal,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(QueueRegistry::new());
        let queue = registry
            .declare("order.auto", 9, Duration::seconds(300))
            .unwrap();
        let events = EventLog::new();
        let hitl = Arc::new(HitlService::new(
            HitlDb::new_in_memory().await.unwrap(),
            events.clone(),
            Arc::clone(&registry),
            HitlConfig::default(),
        ));
        Fixture {
            registry,
            queue,
            hitl,
            events,
            shutdown: ShutdownSignal::new(),
        }
    }

    fn worker(f: &Fixture, processor: Arc<dyn TaskProcessor>) -> Worker {
        Worker::new(
            Arc::clone(&f.queue),
            processor,
            Arc::clone(&f.hitl),
            f.events.clone(),
            EscalationEngine::default(),
            3,
        )
    }

    fn envelope(payload: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope::new("acme", TaskType::Order, payload, 5)
    }

    // -- Mock processors --

    /// Fails with a retryable error until `failures` attempts have burned,
    /// then completes.
    struct FlakyProcessor {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskProcessor for FlakyProcessor {
        async fn process(&self, _envelope: &TaskEnvelope) -> ProcessResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ProcessResult::Failed {
                    error: format!("transient failure on call {call}"),
                    retryable: true,
                }
            } else {
                ProcessResult::Completed {
                    output: json!({"done": true}),
                }
            }
        }
    }

    struct EscalatingProcessor;

    #[async_trait]
    impl TaskProcessor for EscalatingProcessor {
        async fn process(&self, _envelope: &TaskEnvelope) -> ProcessResult {
            ProcessResult::NeedsEscalation {
                recommendation: AgentRecommendation {
                    action: json!({"fulfil": true}),
                    confidence: 0.3,
                },
            }
        }
    }

    struct PanickingProcessor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskProcessor for PanickingProcessor {
        async fn process(&self, _envelope: &TaskEnvelope) -> ProcessResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            ProcessResult::Completed { output: json!({}) }
        }
    }

    struct RecordingProcessor {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl TaskProcessor for RecordingProcessor {
        async fn process(&self, envelope: &TaskEnvelope) -> ProcessResult {
            self.seen.lock().unwrap().push(envelope.id);
            tokio::task::yield_now().await;
            ProcessResult::Completed { output: json!({}) }
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn flaky_processor_completes_on_third_attempt() {
        let f = fixture().await;
        let (tx, rx) = flume::unbounded();
        let w = worker(
            &f,
            Arc::new(FlakyProcessor {
                failures: 2,
                calls: AtomicU32::new(0),
            }),
        )
        .with_completion_sink(tx);

        f.registry
            .enqueue("order.auto", envelope(json!({})))
            .unwrap();
        let handle = w.spawn(f.shutdown.clone());

        let notice = rx.recv_async().await.expect("completion notice");
        f.shutdown.trigger();
        let _ = handle.await;

        // Two redeliveries happened before success.
        let completions = f.events.read(Topic::Completions);
        assert_eq!(completions.len(), 1);
        let event: CompletionEvent =
            serde_json::from_value(completions[0].payload.clone()).unwrap();
        assert_eq!(event.attempt_count, 2);
        assert_eq!(event.envelope_id, notice.envelope_id);
        assert!(f.events.read(Topic::Failures).is_empty());
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_a_terminal_failure() {
        let f = fixture().await;
        let w = worker(
            &f,
            Arc::new(FlakyProcessor {
                failures: 99,
                calls: AtomicU32::new(0),
            }),
        );

        f.registry
            .enqueue("order.auto", envelope(json!({})))
            .unwrap();
        let handle = w.spawn(f.shutdown.clone());

        let events = f.events.clone();
        wait_for(|| events.len(Topic::Failures) == 1).await;
        f.shutdown.trigger();
        let _ = handle.await;

        let failures = f.events.read(Topic::Failures);
        let event: FailureEvent = serde_json::from_value(failures[0].payload.clone()).unwrap();
        // Third attempt (index 2) burned the budget of 3.
        assert_eq!(event.attempt_count, 2);
        assert!(f.events.read(Topic::Completions).is_empty());
        assert_eq!(f.queue.depth(), 0);

        // The spent envelope sits in the dead-letter queue, id intact.
        let dlq = f.queue.dlq().unwrap();
        assert_eq!(dlq.depth(), 1);
        assert_eq!(dlq.try_claim().unwrap().id, event.envelope_id);
    }

    #[tokio::test]
    async fn non_retryable_failure_never_redelivers() {
        struct FatalProcessor;

        #[async_trait]
        impl TaskProcessor for FatalProcessor {
            async fn process(&self, _envelope: &TaskEnvelope) -> ProcessResult {
                ProcessResult::Failed {
                    error: "schema mismatch".into(),
                    retryable: false,
                }
            }
        }

        let f = fixture().await;
        let w = worker(&f, Arc::new(FatalProcessor));
        f.registry
            .enqueue("order.auto", envelope(json!({})))
            .unwrap();
        let handle = w.spawn(f.shutdown.clone());

        let events = f.events.clone();
        wait_for(|| events.len(Topic::Failures) == 1).await;
        f.shutdown.trigger();
        let _ = handle.await;

        let failures = f.events.read(Topic::Failures);
        let event: FailureEvent = serde_json::from_value(failures[0].payload.clone()).unwrap();
        assert_eq!(event.attempt_count, 0);
        assert_eq!(event.error, "schema mismatch");
    }

    #[tokio::test]
    async fn escalation_creates_a_pending_review_with_engine_verdict() {
        let f = fixture().await;
        let w = worker(&f, Arc::new(EscalatingProcessor));
        f.registry
            .enqueue(
                "order.auto",
                envelope(json!({"amount": 6000.0, "fraud_score": 0.9})),
            )
            .unwrap();
        let handle = w.spawn(f.shutdown.clone());

        let mut pending = Vec::new();
        for _ in 0..200 {
            pending = f.hitl.list_pending("acme", None).await.unwrap();
            if pending.len() == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        f.shutdown.trigger();
        let _ = handle.await;

        assert_eq!(pending.len(), 1);
        let request = &pending[0];
        assert_eq!(request.urgency, sy_core::types::Urgency::High);
        assert!(request.triggers.contains(&sy_core::types::Trigger::FraudRisk));
        assert!(request.triggers.contains(&sy_core::types::Trigger::HighValue));
        assert_eq!(request.origin_queue, "order.auto");
        let rec = request.ai_recommendation.as_ref().unwrap();
        assert!((rec.confidence - 0.3).abs() < 1e-9);
        // The envelope left the auto queue.
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn panicking_processor_is_retried() {
        let f = fixture().await;
        let w = worker(
            &f,
            Arc::new(PanickingProcessor {
                calls: AtomicU32::new(0),
            }),
        );
        f.registry
            .enqueue("order.auto", envelope(json!({})))
            .unwrap();
        let handle = w.spawn(f.shutdown.clone());

        let events = f.events.clone();
        wait_for(|| events.len(Topic::Completions) == 1).await;
        f.shutdown.trigger();
        let _ = handle.await;

        let completions = f.events.read(Topic::Completions);
        let event: CompletionEvent =
            serde_json::from_value(completions[0].payload.clone()).unwrap();
        assert_eq!(event.attempt_count, 1);
    }

    #[tokio::test]
    async fn two_workers_share_a_queue_without_double_processing() {
        let f = fixture().await;
        let processor = Arc::new(RecordingProcessor {
            seen: Mutex::new(Vec::new()),
        });

        for _ in 0..10 {
            f.registry
                .enqueue("order.auto", envelope(json!({})))
                .unwrap();
        }
        let h1 = worker(&f, processor.clone()).spawn(f.shutdown.clone());
        let h2 = worker(&f, processor.clone()).spawn(f.shutdown.clone());

        let events = f.events.clone();
        wait_for(|| events.len(Topic::Completions) == 10).await;
        f.shutdown.trigger();
        let _ = h1.await;
        let _ = h2.await;

        let mut seen = processor.seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10, "every envelope processed exactly once");
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.queue.in_flight_count(), 0);
    }
}
