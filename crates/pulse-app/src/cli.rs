//! CLI argument definitions for the Pulse binaries.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::Parser;

use pulse_core::config::PulseConfig;

/// Pulse relay: receives agent tool calls and forwards classified activities.
#[derive(Parser, Debug)]
#[command(name = "pulse-relay", version, about)]
pub struct RelayArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Bind address.
    #[arg(long = "host")]
    pub host: Option<String>,

    /// HTTP port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Activity store endpoint.
    #[arg(long = "sink-url")]
    pub sink_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl RelayArgs {
    pub fn resolve_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_ref())
    }

    /// Resolve the relay port.
    ///
    /// Priority: --port flag > PULSE_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        env_port().unwrap_or(config_port)
    }

    /// Fold CLI and environment overrides into a loaded config.
    pub fn apply(&self, config: &mut PulseConfig) {
        config.relay.port = self.resolve_port(config.relay.port);
        if let Some(host) = &self.host {
            config.relay.host = host.clone();
        }
        apply_sink_url(self.sink_url.as_ref(), config);
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

/// Pulse backfill: replays agent transcripts into the activity store.
#[derive(Parser, Debug)]
#[command(name = "pulse-backfill", version, about)]
pub struct BackfillArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Transcript directory to scan (repeatable). Replaces the configured roots.
    #[arg(long = "dir")]
    pub dir: Vec<PathBuf>,

    /// Ignore activities before this date (YYYY-MM-DD or RFC 3339).
    #[arg(long = "since")]
    pub since: Option<String>,

    /// Classify and deduplicate without posting or saving offsets.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Quiet mode for scheduled runs: warnings, errors and a one-line
    /// summary when something happened.
    #[arg(long = "cron")]
    pub cron: bool,

    /// Offsets file location.
    #[arg(long = "state-file")]
    pub state_file: Option<PathBuf>,

    /// Activity store endpoint.
    #[arg(long = "sink-url")]
    pub sink_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl BackfillArgs {
    pub fn resolve_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_ref())
    }

    pub fn apply(&self, config: &mut PulseConfig) {
        apply_sink_url(self.sink_url.as_ref(), config);
        if !self.dir.is_empty() {
            config.backfill.roots = self
                .dir
                .iter()
                .map(|d| d.to_string_lossy().to_string())
                .collect();
        }
        if let Some(state_file) = &self.state_file {
            config.backfill.state_file = state_file.to_string_lossy().to_string();
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

/// Priority: --config flag > PULSE_CONFIG env var > ~/.pulse/config.toml.
fn resolve_config_path(flag: Option<&PathBuf>) -> PathBuf {
    if let Some(p) = flag {
        return p.clone();
    }
    if let Ok(p) = std::env::var("PULSE_CONFIG") {
        return PathBuf::from(p);
    }
    default_config_path()
}

/// Priority: --sink-url flag > PULSE_SINK_URL env var > config file value.
fn apply_sink_url(flag: Option<&String>, config: &mut PulseConfig) {
    if let Some(url) = flag {
        config.sink.url = url.clone();
    } else if let Ok(url) = std::env::var("PULSE_SINK_URL") {
        if !url.trim().is_empty() {
            config.sink.url = url;
        }
    }
}

fn env_port() -> Option<u16> {
    std::env::var("PULSE_PORT").ok()?.parse().ok()
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".pulse").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".pulse").join("config.toml");
    }
    PathBuf::from("config.toml")
}
