//! `pulse-relay` - the live telemetry relay.
//!
//! 1. Resolve configuration (CLI > env > TOML file > defaults)
//! 2. Install the tracing subscriber
//! 3. Build the HTTP sink and the relay service
//! 4. Serve until SIGINT/SIGTERM, then drain buffered file reads

use std::sync::Arc;

use clap::Parser;

use pulse_api::state::AppState;
use pulse_api::start_server;
use pulse_app::cli::RelayArgs;
use pulse_app::logging;
use pulse_core::config::PulseConfig;
use pulse_sink::HttpSink;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = RelayArgs::parse();
    let config_path = args.resolve_config_path();
    let config_found = config_path.exists();
    let mut config = PulseConfig::load_or_default(&config_path);
    args.apply(&mut config);

    logging::init(&config.general.log_level, false);
    if config_found {
        tracing::info!(path = %config_path.display(), "Configuration loaded");
    } else {
        tracing::info!(path = %config_path.display(), "No configuration file, using defaults");
    }

    let sink = Arc::new(HttpSink::from_config(&config.sink));
    tracing::info!(
        sink = %sink.url(),
        rate_limit_ms = config.relay.rate_limit_ms,
        dedup_window_ms = config.relay.dedup_window_ms,
        batch_window_ms = config.batcher.window_ms,
        "Relay configured"
    );

    let state = AppState::new(config, sink);
    start_server(state).await?;

    tracing::info!("Relay stopped");
    Ok(())
}
