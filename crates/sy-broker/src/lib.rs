//! Broker layer: named queues with priority delivery, at-most-once-in-flight
//! claims, and TTL-driven dead-lettering.
//!
//! The registry owns queue topology for the engine's lifetime. Workers own a
//! claimed envelope only for one claim-process-acknowledge cycle; anything
//! that sits too long (never claimed, or claimed and never acknowledged)
//! is moved verbatim to the queue's paired dead-letter sibling for operator
//! attention. Nothing is ever silently dropped.

pub mod queue;
pub mod registry;

pub use queue::Queue;
pub use registry::{QueueRegistry, SweepReport};

use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    /// `declare` was called for an existing name with different parameters.
    #[error("queue '{0}' already declared with different parameters")]
    ConflictingDeclaration(String),
    /// Direct declaration of a `.dlq` name; dead-letter queues are created
    /// implicitly and never chain.
    #[error("queue name '{0}' uses the reserved .dlq suffix")]
    ReservedDlqName(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("priority {priority} exceeds max {max} for queue '{queue}'")]
    PriorityOutOfRange { queue: String, priority: u8, max: u8 },
    /// ack/nack for an envelope this queue has no claim record of.
    #[error("no in-flight delivery for envelope {0}")]
    UnknownDelivery(Uuid),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
