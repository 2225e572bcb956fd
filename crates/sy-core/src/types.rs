use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// The business domains the engine routes work for. Each type has its own
/// escalation rules and its own auto queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Order,
    SupportTicket,
    Content,
    Inventory,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Order => "order",
            TaskType::SupportTicket => "support_ticket",
            TaskType::Content => "content",
            TaskType::Inventory => "inventory",
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::Order,
            TaskType::SupportTicket,
            TaskType::Content,
            TaskType::Inventory,
        ]
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskEnvelope
// ---------------------------------------------------------------------------

/// The unit of queued work.
///
/// An envelope is immutable after creation except for `attempt_count`,
/// which the broker bumps on every redelivery. Anything else that needs to
/// change (a human-modified action, an approved re-run) is expressed as a
/// *new* envelope carrying a `caused_by` back-reference to its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub tenant_id: String,
    pub caused_by: Option<Uuid>,
}

impl TaskEnvelope {
    pub fn new(
        tenant_id: impl Into<String>,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            priority,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            tenant_id: tenant_id.into(),
            caused_by: None,
        }
    }

    /// Build a new envelope derived from an earlier unit of work (e.g. a
    /// human-approved or human-modified re-queue). Mints a fresh id, resets
    /// the attempt counter, and records the origin.
    pub fn derived_from(
        origin: Uuid,
        tenant_id: impl Into<String>,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: u8,
    ) -> Self {
        Self {
            caused_by: Some(origin),
            ..Self::new(tenant_id, task_type, payload, priority)
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger / Urgency
// ---------------------------------------------------------------------------

/// Reason codes for flagging a task for human review. A single task can
/// carry several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    HighValue,
    FraudRisk,
    NegativeSentiment,
    UnusualPattern,
    BrandCritical,
    LegalReview,
    NewCustomer,
    PolicyViolation,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::HighValue => "high_value",
            Trigger::FraudRisk => "fraud_risk",
            Trigger::NegativeSentiment => "negative_sentiment",
            Trigger::UnusualPattern => "unusual_pattern",
            Trigger::BrandCritical => "brand_critical",
            Trigger::LegalReview => "legal_review",
            Trigger::NewCustomer => "new_customer",
            Trigger::PolicyViolation => "policy_violation",
        }
    }
}

/// Coarse priority tier for pending human reviews. Distinct from queue
/// `priority`: urgency orders the review inbox, not the broker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
}

impl Urgency {
    /// The next tier up. High stays High.
    pub fn promoted(&self) -> Urgency {
        match self {
            Urgency::Low => Urgency::Medium,
            Urgency::Medium => Urgency::High,
            Urgency::High => Urgency::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Urgency> {
        match s {
            "low" => Some(Urgency::Low),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRecommendation / ProcessResult
// ---------------------------------------------------------------------------

/// What an agent proposed doing with a task, plus how sure it was.
/// The action itself is opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecommendation {
    pub action: serde_json::Value,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Outcome of one `process()` invocation on a claimed envelope.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    /// Task done; the envelope is acknowledged and a completion is audited.
    Completed { output: serde_json::Value },
    /// Task failed. Retryable failures are redelivered until the attempt
    /// budget runs out; non-retryable ones are terminal and audited.
    Failed { error: String, retryable: bool },
    /// The agent wants a human to look at this one. The envelope leaves the
    /// auto queue and a review request is created instead.
    NeedsEscalation { recommendation: AgentRecommendation },
}

// ---------------------------------------------------------------------------
// ReviewStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Decided,
}

impl ReviewStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    /// `pending -> decided` is the only move; `decided` is terminal.
    pub fn can_transition_to(&self, target: &ReviewStatus) -> bool {
        matches!((self, target), (ReviewStatus::Pending, ReviewStatus::Decided))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Decided => "decided",
        }
    }
}

// ---------------------------------------------------------------------------
// HitlRequest
// ---------------------------------------------------------------------------

/// A pending human-review request.
///
/// `origin_queue` and `priority` remember where the work came from so an
/// approve/modify decision can re-enqueue without a reverse lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequest {
    pub id: Uuid,
    pub tenant_id: String,
    pub task_type: TaskType,
    pub urgency: Urgency,
    pub triggers: BTreeSet<Trigger>,
    pub task_data: serde_json::Value,
    pub ai_recommendation: Option<AgentRecommendation>,
    /// Derived supporting data (customer history, related records).
    pub context: serde_json::Value,
    pub origin_queue: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl HitlRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        task_type: TaskType,
        urgency: Urgency,
        triggers: BTreeSet<Trigger>,
        task_data: serde_json::Value,
        ai_recommendation: Option<AgentRecommendation>,
        origin_queue: impl Into<String>,
        priority: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            task_type,
            urgency,
            triggers,
            task_data,
            ai_recommendation,
            context: serde_json::Value::Null,
            origin_queue: origin_queue.into(),
            priority,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Modify,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Modify => "modify",
        }
    }

    pub fn parse(s: &str) -> Option<Decision> {
        match s {
            "approve" => Some(Decision::Approve),
            "reject" => Some(Decision::Reject),
            "modify" => Some(Decision::Modify),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// HitlMetrics
// ---------------------------------------------------------------------------

/// Read-only aggregate over the review workload. Observability only; never
/// used to drive control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlMetrics {
    pub pending_count: u64,
    pub completed_count_in_window: u64,
    pub urgency_breakdown: UrgencyBreakdown,
    /// completed-without-escalation / total-completed over the window.
    pub automation_rate: f64,
    pub window_hours: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrgencyBreakdown {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
