//! The backfill run: discover, resume, pair, classify, dedup, forward.
//!
//! Strictly sequential. The first failed post halts the run so that the
//! persisted offsets never skip an activity the store has not accepted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use pulse_core::classify::enrich;
use pulse_core::config::{expand_home, BackfillConfig};
use pulse_core::error::{PulseError, Result};
use pulse_core::types::now_millis;
use pulse_sink::{ActivitySink, ActivitySource};

use crate::dedup::{DedupCache, Verdict};
use crate::discovery::discover_transcripts;
use crate::state::{BackfillState, FileState};
use crate::transcript::{CallPairer, PairedCall};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub roots: Vec<PathBuf>,
    pub max_depth: usize,
    pub state_file: PathBuf,
    /// Activities older than this (ms) are dropped.
    pub since: Option<i64>,
    /// Classify and dedup without posting or saving state.
    pub dry_run: bool,
    pub fetch_limit: usize,
}

impl ScanOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            roots: config.roots.iter().map(|r| expand_home(r)).collect(),
            max_depth: config.max_depth,
            state_file: expand_home(&config.state_file),
            since: None,
            dry_run: false,
            fetch_limit: config.fetch_limit,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub files_scanned: usize,
    pub lines_read: usize,
    pub parse_errors: usize,
    pub pairs: usize,
    pub forwarded: usize,
    /// Dry run only: activities that would have been posted.
    pub would_forward: usize,
    pub duplicates_in_run: usize,
    pub duplicates_in_store: usize,
    pub skipped_before_since: usize,
    pub post_errors: usize,
    pub halted_at: Option<PathBuf>,
    pub dry_run: bool,
}

impl ScanReport {
    /// Whether the run changed anything or hit a problem worth reporting.
    pub fn did_work(&self) -> bool {
        self.forwarded > 0 || self.would_forward > 0 || self.post_errors > 0 || self.parse_errors > 0
    }

    pub fn summary(&self) -> String {
        let mut line = if self.dry_run {
            format!(
                "backfill (dry run): {} files, {} pairs, {} would be forwarded",
                self.files_scanned, self.pairs, self.would_forward
            )
        } else {
            format!(
                "backfill: {} files, {} pairs, {} forwarded",
                self.files_scanned, self.pairs, self.forwarded
            )
        };
        line.push_str(&format!(
            ", {} duplicates, {} before cutoff, {} parse errors, {} post errors",
            self.duplicates_in_run + self.duplicates_in_store,
            self.skipped_before_since,
            self.parse_errors,
            self.post_errors
        ));
        if let Some(path) = &self.halted_at {
            line.push_str(&format!(" (halted at {})", path.display()));
        }
        line
    }
}

/// Result of scanning one file.
struct FileScan {
    next_offset: usize,
    last_timestamp: Option<i64>,
    halted: bool,
}

pub struct Scanner {
    options: ScanOptions,
    sink: Arc<dyn ActivitySink>,
    source: Arc<dyn ActivitySource>,
}

impl Scanner {
    pub fn new(
        options: ScanOptions,
        sink: Arc<dyn ActivitySink>,
        source: Arc<dyn ActivitySource>,
    ) -> Self {
        Self {
            options,
            sink,
            source,
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Run one backfill pass.
    ///
    /// Post failures do not make this return `Err`; they halt the pass and
    /// show up in [`ScanReport::post_errors`]. `Err` means the run could not
    /// start or could not persist its state.
    pub async fn run(&self) -> Result<ScanReport> {
        let opts = &self.options;
        let mut state = BackfillState::load(&opts.state_file)?;
        let files = discover_transcripts(&opts.roots, opts.max_depth);
        let mut dedup = DedupCache::new(Arc::clone(&self.source), opts.fetch_limit);
        let mut report = ScanReport {
            dry_run: opts.dry_run,
            ..Default::default()
        };

        info!(files = files.len(), dry_run = opts.dry_run, "Backfill starting");

        for path in files {
            let key = path.to_string_lossy().to_string();
            let offset = state.offset(&key);

            let scan = match self.scan_file(&path, offset, &mut dedup, &mut report).await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable transcript");
                    continue;
                }
            };
            report.files_scanned += 1;

            let previous = state.get(&key).cloned();
            let changed = previous.as_ref().map_or(true, |p| {
                p.line_offset != scan.next_offset
                    || (scan.last_timestamp.is_some() && p.last_timestamp != scan.last_timestamp)
            });
            if changed {
                let last_timestamp = scan
                    .last_timestamp
                    .or_else(|| previous.and_then(|p| p.last_timestamp));
                state.record(
                    &key,
                    FileState {
                        line_offset: scan.next_offset,
                        last_timestamp,
                        updated_at: now_millis(),
                    },
                );
                if !opts.dry_run {
                    state.save(&opts.state_file)?;
                }
            }

            if scan.halted {
                report.halted_at = Some(path);
                break;
            }
        }

        if dedup.using_fallback() {
            debug!("Store dedup ran on the bulk-fetch fallback");
        }
        info!(
            forwarded = report.forwarded,
            pairs = report.pairs,
            post_errors = report.post_errors,
            "Backfill finished"
        );
        Ok(report)
    }

    async fn scan_file(
        &self,
        path: &Path,
        offset: usize,
        dedup: &mut DedupCache,
        report: &mut ScanReport,
    ) -> Result<FileScan> {
        let content = std::fs::read(path)
            .map_err(|e| PulseError::Transcript(format!("{}: {}", path.display(), e)))?;
        let session_key = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        // Stand-in timestamp for pairs that carry none, stable across runs.
        let fallback_ts = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);

        let mut pairer = CallPairer::new(session_key.clone());
        let mut scan = FileScan {
            next_offset: offset,
            last_timestamp: None,
            halted: false,
        };

        debug!(file = %path.display(), offset, "Scanning transcript");

        // Bytes, not text: one line of invalid UTF-8 must not cost the file.
        for (index, raw) in content.split_inclusive(|b| *b == b'\n').enumerate().skip(offset) {
            if raw.iter().all(u8::is_ascii_whitespace) {
                scan.next_offset = index + 1;
                continue;
            }

            let record: Value = match serde_json::from_slice(raw) {
                Ok(record) => record,
                Err(e) => {
                    if raw.last() != Some(&b'\n') {
                        // Still being written; pick it up next run.
                        break;
                    }
                    report.parse_errors += 1;
                    debug!(file = %path.display(), line = index + 1, error = %e, "Malformed transcript line");
                    scan.next_offset = index + 1;
                    continue;
                }
            };
            report.lines_read += 1;

            for pair in pairer.push(&record, index) {
                report.pairs += 1;
                let call_line = pair.call_line;
                let call_id = pair.call_id.clone();
                match self
                    .handle_pair(pair, path, &session_key, fallback_ts, dedup, report)
                    .await
                {
                    Ok(Some(ts)) => {
                        scan.last_timestamp = Some(scan.last_timestamp.map_or(ts, |t| t.max(ts)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.post_errors += 1;
                        error!(
                            file = %path.display(),
                            line = index + 1,
                            tool_call_id = %call_id,
                            error = %e,
                            "Post failed, halting backfill"
                        );
                        // Resume from the line that opened this call so the
                        // pair can be rebuilt next run.
                        scan.next_offset = call_line.map_or(index, |c| c.min(index));
                        scan.halted = true;
                        return Ok(scan);
                    }
                }
            }
            scan.next_offset = index + 1;
        }

        Ok(scan)
    }

    /// Returns the activity timestamp when the pair reached the dedup stage.
    async fn handle_pair(
        &self,
        pair: PairedCall,
        path: &Path,
        session_key: &str,
        fallback_ts: i64,
        dedup: &mut DedupCache,
        report: &mut ScanReport,
    ) -> Result<Option<i64>> {
        let mut activity = enrich(&pair.call, fallback_ts).activity;
        activity.set_extra("sessionId", session_key);
        activity.set_extra("sessionFile", path.to_string_lossy().to_string());
        activity.set_extra("toolCallId", pair.call_id);

        if let Some(since) = self.options.since {
            if activity.timestamp < since {
                report.skipped_before_since += 1;
                return Ok(None);
            }
        }

        let key = activity.dedup_key();
        let ts = activity.timestamp;
        match dedup.check(&key, ts).await {
            Verdict::SeenThisRun => {
                report.duplicates_in_run += 1;
                return Ok(Some(ts));
            }
            Verdict::InStore => {
                report.duplicates_in_store += 1;
                return Ok(Some(ts));
            }
            Verdict::New => {}
        }

        if self.options.dry_run {
            dedup.mark(&key, ts);
            report.would_forward += 1;
            debug!(title = %activity.title, "Would forward");
            return Ok(Some(ts));
        }

        self.sink.forward(&activity).await?;
        dedup.mark(&key, ts);
        report.forwarded += 1;
        debug!(title = %activity.title, "Forwarded");
        Ok(Some(ts))
    }
}

/// Parse a `--since` value: an RFC 3339 timestamp or a plain `YYYY-MM-DD`
/// date (midnight UTC).
pub fn parse_since(value: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| {
            PulseError::Config(format!(
                "invalid --since value '{}': expected YYYY-MM-DD or RFC 3339",
                value
            ))
        })
}
