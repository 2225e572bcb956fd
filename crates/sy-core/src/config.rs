use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::TaskType;

/// Top-level engine configuration, loaded from `switchyard.toml`.
///
/// Every operational knob lives here (queue topology, escalation
/// thresholds, retry budgets, review SLAs) so operators can tune
/// sensitivity without redeploying logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub escalation: EscalationThresholds,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl EngineConfig {
    /// Load config from the `SWITCHYARD_CONFIG` path or `./switchyard.toml`,
    /// falling back to defaults when neither file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = EngineConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: EngineConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings not expressible via type checks.
    /// Failures here are fatal and prevent engine start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.escalation.validate()?;
        self.worker.validate()?;
        self.hitl.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        std::env::var("SWITCHYARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("switchyard.toml"))
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "switchyard".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// One auto-queue declaration. The paired dead-letter queue `<name>.dlq`
/// is declared implicitly by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// The task type whose inbound events route to this queue.
    pub route: TaskType,
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Worker instances to run against this queue.
    #[serde(default = "default_worker_count")]
    pub workers: u32,
}

fn default_max_priority() -> u8 {
    9
}
fn default_message_ttl_secs() -> u64 {
    300
}
fn default_worker_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,
    /// How often the TTL sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_queues() -> Vec<QueueConfig> {
    TaskType::all()
        .iter()
        .map(|t| QueueConfig {
            name: format!("{t}.auto"),
            route: *t,
            max_priority: default_max_priority(),
            message_ttl_secs: default_message_ttl_secs(),
            workers: default_worker_count(),
        })
        .collect()
}

fn default_sweep_interval_secs() -> u64 {
    10
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Validation("broker.queues must not be empty".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "broker.sweep_interval_secs must be > 0".into(),
            ));
        }
        let mut seen_names = std::collections::HashSet::new();
        let mut seen_routes = std::collections::HashSet::new();
        for q in &self.queues {
            if q.name.ends_with(".dlq") {
                return Err(ConfigError::Validation(format!(
                    "queue '{}' uses the reserved .dlq suffix",
                    q.name
                )));
            }
            if !seen_names.insert(q.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate queue name '{}'",
                    q.name
                )));
            }
            if !seen_routes.insert(q.route) {
                return Err(ConfigError::Validation(format!(
                    "task type '{}' routed to more than one queue",
                    q.route
                )));
            }
            if q.message_ttl_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "queue '{}' has a zero message_ttl_secs",
                    q.name
                )));
            }
        }
        Ok(())
    }

    /// The queue an inbound event of the given task type routes to.
    pub fn queue_for(&self, task_type: TaskType) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.route == task_type)
    }
}

/// Rule thresholds for the escalation decision engine. See the engine's
/// rule table for how each is applied per task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationThresholds {
    #[serde(default = "default_high_value")]
    pub high_value_threshold: f64,
    #[serde(default = "default_fraud")]
    pub fraud_threshold: f64,
    #[serde(default = "default_new_customer_amount")]
    pub new_customer_amount: f64,
    #[serde(default = "default_negative_sentiment")]
    pub negative_sentiment_threshold: f64,
    #[serde(default = "default_legal_keywords")]
    pub legal_keywords: Vec<String>,
    #[serde(default = "default_cost_impact")]
    pub cost_impact_threshold: f64,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            high_value_threshold: default_high_value(),
            fraud_threshold: default_fraud(),
            new_customer_amount: default_new_customer_amount(),
            negative_sentiment_threshold: default_negative_sentiment(),
            legal_keywords: default_legal_keywords(),
            cost_impact_threshold: default_cost_impact(),
        }
    }
}

fn default_high_value() -> f64 {
    5000.0
}
fn default_fraud() -> f64 {
    0.7
}
fn default_new_customer_amount() -> f64 {
    1000.0
}
fn default_negative_sentiment() -> f64 {
    -0.8
}
fn default_legal_keywords() -> Vec<String> {
    vec!["refund".into(), "lawsuit".into(), "fraud".into()]
}
fn default_cost_impact() -> f64 {
    10000.0
}

impl EscalationThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fraud_threshold) {
            return Err(ConfigError::Validation(
                "escalation.fraud_threshold must be within [0, 1]".into(),
            ));
        }
        if self.high_value_threshold < 0.0 || self.cost_impact_threshold < 0.0 {
            return Err(ConfigError::Validation(
                "escalation value thresholds must be non-negative".into(),
            ));
        }
        if self.legal_keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "escalation.legal_keywords must not contain blank entries".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Total attempts before a retryable failure becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("worker.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    /// SQLite path for the review store. `:memory:` is accepted for tests.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Pending requests older than their tier's SLA are promoted one tier.
    #[serde(default = "default_low_sla")]
    pub low_sla_secs: u64,
    #[serde(default = "default_medium_sla")]
    pub medium_sla_secs: u64,
    /// High-urgency requests pending past this raise an operator alert.
    #[serde(default = "default_high_alert")]
    pub high_alert_secs: u64,
    /// How often the promotion patrol runs.
    #[serde(default = "default_patrol_interval_secs")]
    pub patrol_interval_secs: u64,
    /// Decided records older than this become eligible for deletion.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Rolling window for the metrics aggregate.
    #[serde(default = "default_metrics_window_hours")]
    pub metrics_window_hours: u32,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            low_sla_secs: default_low_sla(),
            medium_sla_secs: default_medium_sla(),
            high_alert_secs: default_high_alert(),
            patrol_interval_secs: default_patrol_interval_secs(),
            retention_days: default_retention_days(),
            metrics_window_hours: default_metrics_window_hours(),
        }
    }
}

fn default_store_path() -> String {
    "switchyard-hitl.db".into()
}
fn default_low_sla() -> u64 {
    4 * 3600
}
fn default_medium_sla() -> u64 {
    3600
}
fn default_high_alert() -> u64 {
    2 * 3600
}
fn default_patrol_interval_secs() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    90
}
fn default_metrics_window_hours() -> u32 {
    24
}

impl HitlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.store_path.trim().is_empty() {
            return Err(ConfigError::Validation("hitl.store_path must not be blank".into()));
        }
        if self.patrol_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "hitl.patrol_interval_secs must be > 0".into(),
            ));
        }
        if self.metrics_window_hours == 0 {
            return Err(ConfigError::Validation(
                "hitl.metrics_window_hours must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8974
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
