use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sy_broker::QueueRegistry;
use sy_core::config::HitlConfig;
use sy_core::types::{Decision, HitlMetrics, HitlRequest, TaskEnvelope, Urgency};
use sy_events::{DecisionEvent, EventLog, Topic};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{DecideOutcome, HitlDb};
use crate::{HitlError, Result};

// ---------------------------------------------------------------------------
// DecisionSubmission
// ---------------------------------------------------------------------------

/// One reviewer verdict as submitted through the API.
#[derive(Debug, Clone)]
pub struct DecisionSubmission {
    pub request_id: Uuid,
    pub decision: Decision,
    pub reviewer: String,
    pub notes: String,
    pub modified_action: Option<serde_json::Value>,
}

/// What a submission did. `AlreadyDecided` is a success for the caller;
/// it tolerates at-least-once delivery of retried submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Applied,
    AlreadyDecided,
}

/// One promotion patrol sweep's findings.
#[derive(Debug, Clone, Default)]
pub struct PromotionReport {
    /// Requests promoted low -> medium.
    pub promoted_to_medium: usize,
    /// Requests promoted medium -> high.
    pub promoted_to_high: usize,
    /// High-urgency requests pending past the alert SLA.
    pub overdue_high: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// HitlService
// ---------------------------------------------------------------------------

/// Service layer over the review store: wires decisions to the audit log
/// and approve/modify re-enqueues to the broker.
pub struct HitlService {
    db: HitlDb,
    events: EventLog,
    registry: Arc<QueueRegistry>,
    config: HitlConfig,
}

impl HitlService {
    pub fn new(
        db: HitlDb,
        events: EventLog,
        registry: Arc<QueueRegistry>,
        config: HitlConfig,
    ) -> Self {
        Self {
            db,
            events,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &HitlConfig {
        &self.config
    }

    /// Store a new pending review request.
    pub async fn create_request(&self, request: HitlRequest) -> Result<Uuid> {
        let id = request.id;
        info!(
            request_id = %id,
            tenant = %request.tenant_id,
            task_type = %request.task_type,
            urgency = request.urgency.as_str(),
            trigger_count = request.triggers.len(),
            "review request created"
        );
        self.db.insert_pending(&request).await?;
        Ok(id)
    }

    /// Pending requests for one tenant, urgency high-to-low, oldest first
    /// within a tier.
    pub async fn list_pending(
        &self,
        tenant_id: &str,
        urgency: Option<Urgency>,
    ) -> Result<Vec<HitlRequest>> {
        Ok(self.db.list_pending(tenant_id, urgency).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<crate::store::StoredReview>> {
        Ok(self.db.get(id).await?)
    }

    /// Apply a reviewer verdict.
    ///
    /// Exactly one submission per request id ever applies; a duplicate is a
    /// successful no-op. On success a `decisions` event is appended,
    /// carrying the agent's recommendation, the human decision, and the
    /// agreement flag, and approve/modify decisions re-enqueue a derived
    /// envelope onto the request's origin queue.
    pub async fn submit_decision(&self, submission: DecisionSubmission) -> Result<SubmissionOutcome> {
        if submission.decision == Decision::Modify && submission.modified_action.is_none() {
            return Err(HitlError::MissingModifiedAction);
        }

        let outcome = self
            .db
            .decide(
                submission.request_id,
                submission.decision,
                &submission.reviewer,
                &submission.notes,
                submission.modified_action.clone(),
                Utc::now(),
            )
            .await?;

        let request = match outcome {
            DecideOutcome::NotFound => return Err(HitlError::NotFound(submission.request_id)),
            DecideOutcome::AlreadyDecided => {
                info!(request_id = %submission.request_id, "duplicate decision ignored");
                return Ok(SubmissionOutcome::AlreadyDecided);
            }
            DecideOutcome::Applied(request) => request,
        };

        let agreement = submission.decision == Decision::Approve;
        self.events.append_typed(
            Topic::Decisions,
            request.tenant_id.clone(),
            &DecisionEvent {
                request_id: request.id,
                task_type: request.task_type,
                urgency: request.urgency,
                triggers: request.triggers.iter().copied().collect(),
                ai_recommendation: request.ai_recommendation.clone(),
                decision: submission.decision,
                reviewer: submission.reviewer.clone(),
                agreement,
            },
        );

        match submission.decision {
            Decision::Approve => {
                let envelope = TaskEnvelope::derived_from(
                    request.id,
                    request.tenant_id.clone(),
                    request.task_type,
                    request.task_data.clone(),
                    request.priority,
                );
                self.registry.enqueue(&request.origin_queue, envelope)?;
            }
            Decision::Modify => {
                // Validated non-None above.
                let action = submission.modified_action.unwrap_or_default();
                let envelope = TaskEnvelope::derived_from(
                    request.id,
                    request.tenant_id.clone(),
                    request.task_type,
                    action,
                    request.priority,
                );
                self.registry.enqueue(&request.origin_queue, envelope)?;
            }
            Decision::Reject => {}
        }

        info!(
            request_id = %request.id,
            decision = submission.decision.as_str(),
            reviewer = %submission.reviewer,
            agreement,
            "review decided"
        );
        Ok(SubmissionOutcome::Applied)
    }

    /// The observability aggregate. `automation_rate` compares worker
    /// completions (no human involved) against everything completed in the
    /// rolling window; an empty window reports 1.0.
    pub async fn metrics(&self) -> Result<HitlMetrics> {
        let window_hours = self.config.metrics_window_hours;
        let cutoff = Utc::now() - Duration::hours(window_hours as i64);

        let pending_count = self.db.pending_count().await?;
        let urgency_breakdown = self.db.pending_by_urgency().await?;
        let decided_in_window = self.db.decided_since(cutoff).await?;

        let auto_completions = self
            .events
            .read(Topic::Completions)
            .iter()
            .filter(|r| r.recorded_at >= cutoff)
            .count() as u64;

        let total_completed = auto_completions + decided_in_window;
        let automation_rate = if total_completed == 0 {
            1.0
        } else {
            auto_completions as f64 / total_completed as f64
        };

        Ok(HitlMetrics {
            pending_count,
            completed_count_in_window: total_completed,
            urgency_breakdown,
            automation_rate,
            window_hours,
            timestamp: Utc::now(),
        })
    }

    /// One promotion sweep: pending requests older than their tier's SLA
    /// move one urgency tier up; high-urgency requests pending past the
    /// alert SLA are reported for operator attention.
    ///
    /// Medium runs before low so a request climbs one tier per sweep.
    /// Every promotion runs through the store's pending-only guard, so a
    /// request decided mid-sweep simply drops out.
    pub async fn run_promotion_sweep(&self, now: DateTime<Utc>) -> Result<PromotionReport> {
        let mut report = PromotionReport::default();

        let medium_cutoff = now - Duration::seconds(self.config.medium_sla_secs as i64);
        for id in self
            .db
            .pending_older_than(Urgency::Medium, medium_cutoff)
            .await?
        {
            if self.db.promote(id, Urgency::High).await? {
                info!(request_id = %id, "review promoted to high urgency");
                report.promoted_to_high += 1;
            }
        }

        let low_cutoff = now - Duration::seconds(self.config.low_sla_secs as i64);
        for id in self.db.pending_older_than(Urgency::Low, low_cutoff).await? {
            if self.db.promote(id, Urgency::Medium).await? {
                info!(request_id = %id, "review promoted to medium urgency");
                report.promoted_to_medium += 1;
            }
        }

        let alert_cutoff = now - Duration::seconds(self.config.high_alert_secs as i64);
        let overdue = self
            .db
            .pending_older_than(Urgency::High, alert_cutoff)
            .await?;
        for id in &overdue {
            warn!(request_id = %id, "high-urgency review unresolved past the alert SLA");
        }
        report.overdue_high = overdue;

        Ok(report)
    }

    /// Delete decided records past the retention window.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.config.retention_days as i64);
        let purged = self.db.purge_decided_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "expired decided reviews purged");
        }
        Ok(purged)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
