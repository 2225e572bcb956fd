//! Escalation decision engine.
//!
//! A pure classifier: given a task type and its data, decide whether a
//! human should review it and why. Rules are table-driven per task type
//! and evaluated independently; a task can fire several triggers at once.
//! Thresholds come from configuration; the engine holds no other state and
//! has no failure mode of its own.

use std::collections::BTreeSet;

use serde_json::Value;
use sy_core::config::EscalationThresholds;
use sy_core::types::{TaskType, Trigger, Urgency};

// ---------------------------------------------------------------------------
// EscalationDecision
// ---------------------------------------------------------------------------

/// The verdict for one task: escalate or not, the reasons, and how urgently
/// a human should look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationDecision {
    pub should_escalate: bool,
    pub triggers: BTreeSet<Trigger>,
    pub urgency: Urgency,
}

impl EscalationDecision {
    fn from_triggers(triggers: BTreeSet<Trigger>) -> Self {
        let urgency = urgency_for(&triggers);
        Self {
            should_escalate: !triggers.is_empty(),
            triggers,
            urgency,
        }
    }
}

/// Triggers that force high urgency on their own.
const HIGH_URGENCY_TRIGGERS: [Trigger; 3] = [
    Trigger::FraudRisk,
    Trigger::LegalReview,
    Trigger::NegativeSentiment,
];

fn urgency_for(triggers: &BTreeSet<Trigger>) -> Urgency {
    if triggers.iter().any(|t| HIGH_URGENCY_TRIGGERS.contains(t)) {
        Urgency::High
    } else if triggers.len() >= 2 {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

// ---------------------------------------------------------------------------
// EscalationEngine
// ---------------------------------------------------------------------------

/// Stateless rule evaluator. Cheap to clone; owns only its thresholds.
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    thresholds: EscalationThresholds,
}

impl EscalationEngine {
    pub fn new(thresholds: EscalationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &EscalationThresholds {
        &self.thresholds
    }

    /// Evaluate the rule table for one task. Pure: identical inputs always
    /// produce identical decisions. A field that is missing or has the
    /// wrong shape simply fails its rule.
    pub fn evaluate(&self, task_type: TaskType, task_data: &Value) -> EscalationDecision {
        let t = &self.thresholds;
        let mut triggers = BTreeSet::new();

        match task_type {
            TaskType::Order => {
                let amount = number(task_data, "amount");
                if amount > t.high_value_threshold {
                    triggers.insert(Trigger::HighValue);
                }
                if number(task_data, "fraud_score") > t.fraud_threshold {
                    triggers.insert(Trigger::FraudRisk);
                }
                if boolean(task_data, "customer_new") && amount > t.new_customer_amount {
                    triggers.insert(Trigger::NewCustomer);
                }
            }
            TaskType::SupportTicket => {
                if number_or(task_data, "sentiment", 0.0) < t.negative_sentiment_threshold {
                    triggers.insert(Trigger::NegativeSentiment);
                }
                if let Some(message) = task_data.get("message").and_then(Value::as_str) {
                    let lowered = message.to_lowercase();
                    if t.legal_keywords
                        .iter()
                        .any(|kw| lowered.contains(&kw.to_lowercase()))
                    {
                        triggers.insert(Trigger::LegalReview);
                    }
                }
            }
            TaskType::Content => {
                if boolean(task_data, "is_brand_critical") {
                    triggers.insert(Trigger::BrandCritical);
                }
                if boolean(task_data, "legal_review_required") {
                    triggers.insert(Trigger::LegalReview);
                }
            }
            TaskType::Inventory => {
                if boolean(task_data, "unusual_demand") {
                    triggers.insert(Trigger::UnusualPattern);
                }
                if number(task_data, "cost_impact") > t.cost_impact_threshold {
                    triggers.insert(Trigger::HighValue);
                }
            }
        }

        EscalationDecision::from_triggers(triggers)
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new(EscalationThresholds::default())
    }
}

// ---------------------------------------------------------------------------
// Field extraction helpers
// ---------------------------------------------------------------------------

fn number(data: &Value, field: &str) -> f64 {
    number_or(data, field, f64::NEG_INFINITY)
}

fn number_or(data: &Value, field: &str, fallback: f64) -> f64 {
    data.get(field).and_then(Value::as_f64).unwrap_or(fallback)
}

fn boolean(data: &Value, field: &str) -> bool {
    data.get(field).and_then(Value::as_bool).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
