//! Persisted per-file offsets.
//!
//! The file is rewritten through a temporary sibling and a rename, so a crash
//! mid-write leaves the previous state intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_core::error::{PulseError, Result};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillState {
    pub version: u32,
    /// Keyed by absolute transcript path.
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    /// Number of leading lines already handled.
    pub line_offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<i64>,
    pub updated_at: i64,
}

impl Default for BackfillState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            files: BTreeMap::new(),
        }
    }
}

impl BackfillState {
    /// Load the state file. A missing file is an empty state; an unreadable
    /// or foreign one is an error, since silently starting over would replay
    /// every transcript.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No backfill state yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let state: BackfillState = serde_json::from_str(&content).map_err(|e| {
            PulseError::State(format!("{} is not valid state: {}", path.display(), e))
        })?;
        if state.version != STATE_VERSION {
            return Err(PulseError::State(format!(
                "{} has unsupported version {}",
                path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    /// Write the state atomically, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = tmp_path(path);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn offset(&self, file: &str) -> usize {
        self.files.get(file).map(|f| f.line_offset).unwrap_or(0)
    }

    pub fn get(&self, file: &str) -> Option<&FileState> {
        self.files.get(file)
    }

    pub fn record(&mut self, file: &str, entry: FileState) {
        self.files.insert(file.to_string(), entry);
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
