//! Append-only, topic-partitioned event log.
//!
//! Completions, failures, and human decisions are appended here for audit
//! and downstream learning. Records are never mutated or removed; readers
//! get snapshots and live subscribers get at-least-once fan-out. Ordering
//! is guaranteed within a topic only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sy_core::types::{AgentRecommendation, Decision, TaskType, Trigger, Urgency};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Completions,
    Failures,
    Decisions,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Completions => "completions",
            Topic::Failures => "failures",
            Topic::Decisions => "decisions",
        }
    }
}

// ---------------------------------------------------------------------------
// EventRecord + typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub topic: Topic,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A worker finished an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub envelope_id: Uuid,
    pub task_type: TaskType,
    pub attempt_count: u32,
    pub output: serde_json::Value,
}

/// A worker gave up on an envelope (non-retryable, or retry budget spent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub envelope_id: Uuid,
    pub task_type: TaskType,
    pub attempt_count: u32,
    pub error: String,
}

/// A human decided a review request. `agreement` is the feedback signal
/// for agent tuning: did the human simply approve what the agent proposed?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub request_id: Uuid,
    pub task_type: TaskType,
    pub urgency: Urgency,
    pub triggers: Vec<Trigger>,
    pub ai_recommendation: Option<AgentRecommendation>,
    pub decision: Decision,
    pub reviewer: String,
    pub agreement: bool,
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

struct Partition {
    records: Vec<EventRecord>,
    subscribers: Vec<flume::Sender<EventRecord>>,
}

impl Partition {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            subscribers: Vec::new(),
        }
    }
}

/// In-process event log client. Cheap to clone; all clones share the same
/// partitions.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<HashMap<Topic, Partition>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append a record to a topic and fan it out to live subscribers.
    /// Disconnected subscribers are pruned. Returns the stored record.
    pub fn append(
        &self,
        topic: Topic,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> EventRecord {
        let record = EventRecord {
            id: Uuid::new_v4(),
            topic,
            tenant_id: tenant_id.into(),
            payload,
            recorded_at: Utc::now(),
        };
        let mut partitions = self.inner.lock().expect("EventLog lock poisoned");
        let partition = partitions.entry(topic).or_insert_with(Partition::new);
        partition.records.push(record.clone());
        partition
            .subscribers
            .retain(|tx| tx.send(record.clone()).is_ok());
        tracing::debug!(topic = topic.as_str(), event_id = %record.id, "event appended");
        record
    }

    /// Serialize a typed payload and append it.
    pub fn append_typed<T: Serialize>(
        &self,
        topic: Topic,
        tenant_id: impl Into<String>,
        event: &T,
    ) -> EventRecord {
        let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        self.append(topic, tenant_id, payload)
    }

    /// Snapshot of every record appended to a topic so far, in append order.
    pub fn read(&self, topic: Topic) -> Vec<EventRecord> {
        let partitions = self.inner.lock().expect("EventLog lock poisoned");
        partitions
            .get(&topic)
            .map(|p| p.records.clone())
            .unwrap_or_default()
    }

    /// Number of records in a topic.
    pub fn len(&self, topic: Topic) -> usize {
        let partitions = self.inner.lock().expect("EventLog lock poisoned");
        partitions.get(&topic).map(|p| p.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, topic: Topic) -> bool {
        self.len(topic) == 0
    }

    /// Register a live subscriber for a topic. The receiver sees every
    /// record appended after this call.
    pub fn subscribe(&self, topic: Topic) -> flume::Receiver<EventRecord> {
        let (tx, rx) = flume::unbounded();
        let mut partitions = self.inner.lock().expect("EventLog lock poisoned");
        partitions
            .entry(topic)
            .or_insert_with(Partition::new)
            .subscribers
            .push(tx);
        rx
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
