//! HTTP surface of the engine: the review inbox, decision submission,
//! metrics, and inbound event ingestion.

pub mod api_error;
pub mod http_api;
pub mod ingest;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState};
pub use ingest::{IngestOutcome, IngestService};
