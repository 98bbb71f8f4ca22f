//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use pulse_core::config::PulseConfig;
use pulse_sink::ActivitySink;

use crate::service::RelayService;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration (file + env + CLI).
    pub config: Arc<PulseConfig>,
    /// Gates, batcher and sink.
    pub service: Arc<RelayService>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: PulseConfig, sink: Arc<dyn ActivitySink>) -> Self {
        let service = RelayService::new(&config, sink);
        Self {
            config: Arc::new(config),
            service: Arc::new(service),
            start_time: Instant::now(),
        }
    }
}
