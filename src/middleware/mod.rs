//! # HTTP Middleware
//!
//! - **logging**: structured start/finish log lines per request, tagged
//!   with a generated request id
//! - **metrics**: global and per-endpoint request counters in
//!   [`crate::state::AppState`]

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
