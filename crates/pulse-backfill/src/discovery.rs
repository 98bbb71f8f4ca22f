//! Transcript discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use walkdir::WalkDir;

/// Whether `path` names a live transcript.
///
/// Lock files and transcripts renamed with a `.deleted.` marker are skipped.
pub fn is_transcript(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    if name.ends_with(".jsonl.lock") {
        return false;
    }
    if path.to_string_lossy().contains(".deleted.") {
        return false;
    }
    name.ends_with(".jsonl")
}

/// Collect transcripts under `roots`, oldest first.
///
/// Missing roots are skipped. A file reachable from two roots is returned
/// once. Files with the same mtime are ordered by path.
pub fn discover_transcripts(roots: &[PathBuf], max_depth: usize) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();

    for root in roots {
        if !root.exists() {
            debug!(root = %root.display(), "Transcript root missing, skipping");
            continue;
        }

        for entry in WalkDir::new(root).max_depth(max_depth).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() || !is_transcript(entry.path()) {
                continue;
            }

            let path = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if !seen.insert(path.clone()) {
                continue;
            }

            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((mtime, path));
        }
    }

    found.sort();
    debug!(count = found.len(), "Transcripts discovered");
    found.into_iter().map(|(_, path)| path).collect()
}
