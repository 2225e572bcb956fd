//! Human-in-the-loop review: durable request store and the service layer
//! that wires decisions to the audit log and the broker.

pub mod service;
pub mod store;

pub use service::{DecisionSubmission, HitlService, PromotionReport, SubmissionOutcome};
pub use store::{DecideOutcome, HitlDb, ReviewOutcome, StoredReview};

use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HitlError {
    #[error("review request not found: {0}")]
    NotFound(Uuid),
    #[error("modify decision requires a modified_action")]
    MissingModifiedAction,
    #[error("store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),
    #[error("broker error: {0}")]
    Broker(#[from] sy_broker::BrokerError),
}

pub type Result<T> = std::result::Result<T, HitlError>;
