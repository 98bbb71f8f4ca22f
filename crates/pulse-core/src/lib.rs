pub mod classify;
pub mod config;
pub mod error;
pub mod types;

pub use classify::{classify_tool, enrich, event_activity, infer_status, Enriched};
pub use config::PulseConfig;
pub use error::{PulseError, Result};
pub use types::*;
