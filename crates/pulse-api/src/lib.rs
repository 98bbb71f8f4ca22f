//! Pulse API crate - the live relay.
//!
//! Accepts webhook events and raw tool calls over HTTP, runs them through the
//! classifier, the per-type rate limiter, the title dedup gate and the
//! file-read batcher, and forwards the result to the activity sink.

pub mod batcher;
pub mod dedup;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod schedule;
pub mod service;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use service::RelayService;
pub use state::AppState;
