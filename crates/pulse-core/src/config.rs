use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PulseError, Result};

/// Top-level configuration for the relay and the backfill scanner.
///
/// Loaded from `~/.pulse/config.toml` by default. Every section has serde
/// defaults, so a partial (or empty) file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

impl PulseConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PulseConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or
    /// cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PulseError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// HTTP ingress and gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address. The relay assumes a trusted private network.
    pub host: String,
    pub port: u16,
    /// Minimum spacing between two events of the same type.
    pub rate_limit_ms: u64,
    /// Window in which an identical title is suppressed.
    pub dedup_window_ms: u64,
    /// Maximum request body size.
    pub body_limit_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3077,
            rate_limit_ms: 1_000,
            dedup_window_ms: 30_000,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

/// File-read batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Lifetime of a bucket before it is flushed.
    pub window_ms: u64,
    /// Bucket size at which entries collapse into one summary activity.
    pub collapse_threshold: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            collapse_threshold: 5,
        }
    }
}

/// External activity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Endpoint that accepts `POST` of one activity.
    pub url: String,
    /// Endpoint answering activity queries. Defaults to `url`.
    pub query_url: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3210/api/activities".to_string(),
            query_url: None,
        }
    }
}

impl SinkConfig {
    pub fn resolved_query_url(&self) -> &str {
        self.query_url.as_deref().unwrap_or(&self.url)
    }
}

/// Backfill scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Directories walked for `*.jsonl` transcripts.
    pub roots: Vec<String>,
    /// Maximum directory depth below each root.
    pub max_depth: usize,
    /// Location of the resumable offsets file.
    pub state_file: String,
    /// Size of the bulk fetch used when range queries are unavailable.
    pub fetch_limit: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            roots: vec![
                "~/.pulse/sessions".to_string(),
                "~/.agent/sessions".to_string(),
            ],
            max_depth: 6,
            state_file: "~/.pulse/backfill-state.json".to_string(),
            fetch_limit: 1_000,
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = PulseConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.relay.rate_limit_ms, 1_000);
        assert_eq!(config.relay.dedup_window_ms, 30_000);
        assert_eq!(config.batcher.window_ms, 10_000);
        assert_eq!(config.batcher.collapse_threshold, 5);
        assert_eq!(config.backfill.max_depth, 6);
        assert!(config.sink.query_url.is_none());
        assert_eq!(config.sink.resolved_query_url(), config.sink.url);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[relay]
port = 4000

[sink]
url = "http://store.lan/activities"
query_url = "http://store.lan/activities/query"
"#;
        let file = create_temp_config(content);
        let config = PulseConfig::load(file.path()).unwrap();
        assert_eq!(config.relay.port, 4000);
        assert_eq!(config.relay.rate_limit_ms, 1_000);
        assert_eq!(config.sink.url, "http://store.lan/activities");
        assert_eq!(
            config.sink.resolved_query_url(),
            "http://store.lan/activities/query"
        );
        assert_eq!(config.batcher.collapse_threshold, 5);
    }

    #[test]
    fn test_load_backfill_section() {
        let content = r#"
[backfill]
roots = ["/var/agent/sessions"]
max_depth = 3
state_file = "/tmp/state.json"
fetch_limit = 50
"#;
        let file = create_temp_config(content);
        let config = PulseConfig::load(file.path()).unwrap();
        assert_eq!(config.backfill.roots, vec!["/var/agent/sessions"]);
        assert_eq!(config.backfill.max_depth, 3);
        assert_eq!(config.backfill.fetch_limit, 50);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(PulseConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = PulseConfig::load_or_default(Path::new("/nonexistent/pulse.toml"));
        assert_eq!(config.relay.port, RelayConfig::default().port);
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = PulseConfig::default();
        config.relay.port = 5000;
        config.save(&path).unwrap();

        let reloaded = PulseConfig::load(&path).unwrap();
        assert_eq!(reloaded.relay.port, 5000);
        assert_eq!(reloaded.backfill.roots, config.backfill.roots);
    }

    #[test]
    fn test_empty_file_uses_all_defaults() {
        let file = create_temp_config("");
        let config = PulseConfig::load(file.path()).unwrap();
        assert_eq!(config.batcher.window_ms, 10_000);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        let expanded = expand_home("~/x/y");
        assert!(expanded.ends_with("x/y"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
