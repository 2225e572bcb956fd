pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod request_id;
