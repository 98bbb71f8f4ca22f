//! File-read batcher.
//!
//! File reads are the noisiest, least interesting activities an agent emits.
//! They are held in buckets keyed by `sessionKey:directory`; a bucket that
//! reaches the collapse threshold is forwarded as a single summary activity,
//! while a bucket whose window runs out is released entry by entry.
//!
//! A bucket is flushed exactly once: whichever path flushes first (threshold,
//! staleness check on arrival, timer, shutdown) removes it from the map under
//! the lock, and the timer only flushes the bucket generation that armed it.
//! Timer releases already under way are counted so that shutdown can wait for
//! them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use pulse_core::config::BatcherConfig;
use pulse_core::error::Result;
use pulse_core::types::{ActivityMetadata, ActivityRecord, ActivityStatus, ActivityType};
use pulse_sink::ActivitySink;

use crate::schedule::DelayedTask;

const DEFAULT_SESSION: &str = "default";
const DEFAULT_DIRECTORY: &str = "workspace";

/// What happened to one file read handed to the batcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// The read is waiting in a bucket.
    pub buffered: bool,
    /// Activities sent to the sink while handling this read.
    pub forwarded: usize,
}

struct Bucket {
    session_key: String,
    directory: String,
    entries: Vec<ActivityRecord>,
    files: Vec<String>,
    started_at: Instant,
    generation: u64,
    timer: Option<DelayedTask>,
}

impl Bucket {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[derive(Default)]
struct BatcherState {
    buckets: HashMap<String, Bucket>,
    next_generation: u64,
    /// Timer releases removed from `buckets` but not yet finished.
    in_flight: usize,
}

struct BatcherInner {
    sink: Arc<dyn ActivitySink>,
    window: Duration,
    threshold: usize,
    state: Mutex<BatcherState>,
    idle: Notify,
}

/// Marks one timer release as running; dropping it wakes shutdown waiters.
struct InFlight<'a>(&'a BatcherInner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
        self.0.idle.notify_waiters();
    }
}

/// Aggregates bursts of file reads before they reach the sink.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Clone)]
pub struct FileReadBatcher {
    inner: Arc<BatcherInner>,
}

impl FileReadBatcher {
    pub fn new(sink: Arc<dyn ActivitySink>, config: &BatcherConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                sink,
                window: Duration::from_millis(config.window_ms),
                threshold: config.collapse_threshold.max(1),
                state: Mutex::new(BatcherState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue a classified file-read activity.
    ///
    /// Must be called from within a tokio runtime: a new bucket arms its
    /// flush timer with `tokio::spawn`.
    pub async fn add(&self, activity: ActivityRecord, file_path: Option<&str>) -> Result<BatchOutcome> {
        let session_key = activity
            .metadata
            .session_key
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        let directory = directory_of(file_path);
        let key = bucket_key(&session_key, &directory);

        let mut outcome = BatchOutcome::default();

        let stale = {
            let mut state = self.inner.lock();
            let expired = state
                .buckets
                .get(&key)
                .is_some_and(|b| b.started_at.elapsed() > self.inner.window);
            if expired {
                state.buckets.remove(&key).map(|mut b| {
                    b.cancel_timer();
                    b
                })
            } else {
                None
            }
        };
        if let Some(bucket) = stale {
            debug!(key = %key, entries = bucket.entries.len(), "Flushing stale bucket");
            outcome.forwarded += self.inner.release(bucket).await?;
        }

        let full = {
            let mut state = self.inner.lock();
            if !state.buckets.contains_key(&key) {
                let generation = state.next_generation;
                state.next_generation += 1;
                let timer = self.arm_timer(key.clone(), generation);
                state.buckets.insert(
                    key.clone(),
                    Bucket {
                        session_key,
                        directory,
                        entries: Vec::new(),
                        files: Vec::new(),
                        started_at: Instant::now(),
                        generation,
                        timer: Some(timer),
                    },
                );
            }

            let len = match state.buckets.get_mut(&key) {
                Some(bucket) => {
                    if let Some(path) = file_path {
                        bucket.files.push(path.to_string());
                    }
                    bucket.entries.push(activity);
                    bucket.entries.len()
                }
                None => 0,
            };

            if len >= self.inner.threshold {
                state.buckets.remove(&key).map(|mut b| {
                    b.cancel_timer();
                    b
                })
            } else {
                None
            }
        };

        match full {
            Some(bucket) => {
                debug!(key = %key, entries = bucket.entries.len(), "Bucket reached threshold");
                outcome.forwarded += self.inner.release(bucket).await?;
            }
            None => outcome.buffered = true,
        }
        Ok(outcome)
    }

    /// Flush one bucket now. Returns the number of activities forwarded.
    pub async fn flush(&self, key: &str) -> Result<usize> {
        let bucket = self.inner.lock().buckets.remove(key).map(|mut b| {
            b.cancel_timer();
            b
        });
        match bucket {
            Some(bucket) => self.inner.release(bucket).await,
            None => Ok(0),
        }
    }

    /// Flush every bucket. Used on shutdown.
    ///
    /// Every bucket is attempted even if an earlier one fails; the first
    /// failure is returned. Also waits for timer flushes that were already
    /// forwarding; their activities are not part of the returned count.
    pub async fn flush_all(&self) -> Result<usize> {
        let buckets: Vec<Bucket> = {
            let mut state = self.inner.lock();
            state
                .buckets
                .drain()
                .map(|(_, mut b)| {
                    b.cancel_timer();
                    b
                })
                .collect()
        };

        if !buckets.is_empty() {
            info!(buckets = buckets.len(), "Draining file-read buckets");
        }

        let mut forwarded = 0;
        let mut first_error = None;
        for bucket in buckets {
            match self.inner.release(bucket).await {
                Ok(n) => forwarded += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.inner.wait_idle().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(forwarded),
        }
    }

    /// Number of buckets currently holding reads.
    pub fn queued_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Keys of the buckets currently holding reads.
    pub fn bucket_keys(&self) -> Vec<String> {
        self.inner.lock().buckets.keys().cloned().collect()
    }

    fn arm_timer(&self, key: String, generation: u64) -> DelayedTask {
        let inner = Arc::clone(&self.inner);
        DelayedTask::spawn(self.inner.window, async move {
            inner.flush_expired(&key, generation).await;
        })
    }
}

impl BatcherInner {
    fn lock(&self) -> MutexGuard<'_, BatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer path. The timer does not cancel itself: aborting the running
    /// task would cut the sink call short.
    async fn flush_expired(&self, key: &str, generation: u64) {
        let bucket = {
            let mut state = self.lock();
            let current = state
                .buckets
                .get(key)
                .is_some_and(|b| b.generation == generation);
            if current {
                state.in_flight += 1;
                state.buckets.remove(key)
            } else {
                None
            }
        };

        let Some(bucket) = bucket else {
            return;
        };
        let _in_flight = InFlight(self);
        debug!(key = %key, entries = bucket.entries.len(), "Bucket window elapsed");
        // No caller to report to; failures are only logged.
        if let Err(e) = self.release(bucket).await {
            error!(key = %key, error = %e, "Timed file-read flush failed");
        }
    }

    /// Resolve once no timer release is running.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = self.lock().in_flight;
            if busy == 0 {
                return;
            }
            debug!(in_flight = busy, "Waiting for timed file-read flushes");
            notified.await;
        }
    }

    /// Forward a removed bucket: collapsed when it reached the threshold,
    /// otherwise entry by entry in arrival order.
    async fn release(&self, bucket: Bucket) -> Result<usize> {
        if bucket.entries.len() >= self.threshold {
            let summary = collapse(&bucket);
            self.sink.forward(&summary).await?;
            info!(title = %summary.title, "Collapsed file reads forwarded");
            return Ok(1);
        }

        let mut forwarded = 0;
        let mut first_error = None;
        for entry in &bucket.entries {
            match self.sink.forward(entry).await {
                Ok(_) => forwarded += 1,
                Err(e) => {
                    error!(title = %entry.title, error = %e, "Failed to forward file read");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(forwarded),
        }
    }
}

/// Build the summary activity standing in for a full bucket.
fn collapse(bucket: &Bucket) -> ActivityRecord {
    let count = bucket.entries.len();
    let errored = bucket.entries.iter().any(|e| e.status.is_error());
    let status = if errored {
        ActivityStatus::Error
    } else {
        ActivityStatus::Success
    };

    let first = bucket.entries.first();
    let mut metadata = ActivityMetadata {
        importance: if errored { 5 } else { 1 },
        tool: first
            .map(|e| e.metadata.tool.clone())
            .unwrap_or_else(|| "read".to_string()),
        duration: None,
        session_key: Some(bucket.session_key.clone()),
        extra: Default::default(),
    };
    metadata
        .extra
        .insert("fileCount".to_string(), Value::from(count));
    metadata
        .extra
        .insert("directory".to_string(), Value::from(bucket.directory.clone()));
    metadata.extra.insert(
        "files".to_string(),
        Value::Array(bucket.files.iter().cloned().map(Value::String).collect()),
    );

    ActivityRecord {
        activity_type: ActivityType::File,
        title: format!("Read {} files in {}", count, bucket.directory),
        description: None,
        status,
        metadata,
        timestamp: first.map(|e| e.timestamp).unwrap_or_else(pulse_core::now_millis),
    }
}

/// Parent directory of a read path, or `workspace` when there is none.
pub fn directory_of(file_path: Option<&str>) -> String {
    file_path
        .and_then(|p| Path::new(p).parent())
        .map(|dir| dir.to_string_lossy().to_string())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTORY.to_string())
}

pub fn bucket_key(session_key: &str, directory: &str) -> String {
    format!("{}:{}", session_key, directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::classify::enrich;
    use pulse_core::types::RawToolCall;
    use pulse_sink::MemorySink;
    use serde_json::json;

    fn config() -> BatcherConfig {
        BatcherConfig {
            window_ms: 10_000,
            collapse_threshold: 5,
        }
    }

    fn read(path: &str, session: &str) -> (ActivityRecord, Option<String>) {
        let enriched = enrich(
            &RawToolCall::new("read", json!({ "path": path })).with_session(session),
            1_000,
        );
        (enriched.activity, enriched.file_path)
    }

    async fn add(batcher: &FileReadBatcher, path: &str, session: &str) -> BatchOutcome {
        let (activity, file_path) = read(path, session);
        batcher.add(activity, file_path.as_deref()).await.unwrap()
    }

    #[test]
    fn test_directory_of() {
        assert_eq!(directory_of(Some("/repo/src/main.rs")), "/repo/src");
        assert_eq!(directory_of(Some("main.rs")), "workspace");
        assert_eq!(directory_of(Some("/")), "workspace");
        assert_eq!(directory_of(None), "workspace");
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_threshold_released_individually_after_window() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        for name in ["a", "b", "c", "d"] {
            let outcome = add(&batcher, &format!("/repo/src/{}.rs", name), "s1").await;
            assert!(outcome.buffered);
            assert_eq!(outcome.forwarded, 0);
        }
        assert_eq!(sink.forwarded_count(), 0);
        assert_eq!(batcher.queued_buckets(), 1);

        tokio::time::sleep(Duration::from_millis(10_001)).await;

        assert_eq!(
            sink.forwarded_titles(),
            vec![
                "Read /repo/src/a.rs",
                "Read /repo/src/b.rs",
                "Read /repo/src/c.rs",
                "Read /repo/src/d.rs",
            ]
        );
        assert_eq!(batcher.queued_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_collapses_immediately() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        for name in ["a", "b", "c", "d"] {
            add(&batcher, &format!("/repo/src/{}.rs", name), "s1").await;
        }
        let outcome = add(&batcher, "/repo/src/e.rs", "s1").await;
        assert!(!outcome.buffered);
        assert_eq!(outcome.forwarded, 1);

        let forwarded = sink.forwarded();
        assert_eq!(forwarded.len(), 1);
        let summary = &forwarded[0];
        assert_eq!(summary.title, "Read 5 files in /repo/src");
        assert_eq!(summary.activity_type, ActivityType::File);
        assert_eq!(summary.status, ActivityStatus::Success);
        assert_eq!(summary.metadata.importance, 1);
        assert_eq!(summary.metadata.extra["fileCount"], json!(5));
        assert_eq!(summary.metadata.extra["directory"], json!("/repo/src"));
        assert_eq!(summary.metadata.extra["files"].as_array().unwrap().len(), 5);

        // The cancelled timer must not release anything later.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.forwarded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapsed_error_status() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        for i in 0..5 {
            let mut call = RawToolCall::new("read", json!({ "path": format!("/tmp/{}.txt", i) }));
            if i == 2 {
                call = call.with_result(json!({ "error": "ENOENT" }));
            }
            let enriched = enrich(&call, 0);
            batcher
                .add(enriched.activity, enriched.file_path.as_deref())
                .await
                .unwrap();
        }

        let summary = &sink.forwarded()[0];
        assert_eq!(summary.status, ActivityStatus::Error);
        assert_eq!(summary.metadata.importance, 5);
        assert_eq!(summary.metadata.session_key.as_deref(), Some("default"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_keyed_by_session_and_directory() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/src/a.rs", "s1").await;
        add(&batcher, "/repo/src/b.rs", "s2").await;
        add(&batcher, "/repo/docs/c.md", "s1").await;
        add(&batcher, "notes.txt", "s1").await;

        let mut keys = batcher.bucket_keys();
        keys.sort();
        assert_eq!(
            keys,
            vec!["s1:/repo/docs", "s1:/repo/src", "s1:workspace", "s2:/repo/src"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_bucket_flushed_on_arrival() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/a.rs", "s1").await;
        // Move the clock past the window without letting the timer run.
        let key = bucket_key("s1", "/repo");
        if let Some(bucket) = batcher.inner.lock().buckets.get_mut(&key) {
            bucket.cancel_timer();
        }
        tokio::time::advance(Duration::from_millis(10_001)).await;

        let outcome = add(&batcher, "/repo/b.rs", "s1").await;
        assert!(outcome.buffered);
        assert_eq!(outcome.forwarded, 1);
        assert_eq!(sink.forwarded_titles(), vec!["Read /repo/a.rs"]);
        assert_eq!(batcher.queued_buckets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_at_exact_window_is_not_stale() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/a.rs", "s1").await;
        let key = bucket_key("s1", "/repo");
        if let Some(bucket) = batcher.inner.lock().buckets.get_mut(&key) {
            bucket.cancel_timer();
        }
        tokio::time::advance(Duration::from_millis(10_000)).await;

        let outcome = add(&batcher, "/repo/b.rs", "s1").await;
        assert!(outcome.buffered);
        assert_eq!(outcome.forwarded, 0);
        assert_eq!(sink.forwarded_count(), 0);
        assert_eq!(batcher.flush(&key).await.unwrap(), 2);
    }

    /// Sink that takes a while to acknowledge each activity.
    struct SlowSink {
        inner: MemorySink,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ActivitySink for SlowSink {
        async fn forward(&self, activity: &ActivityRecord) -> Result<pulse_sink::SinkReceipt> {
            tokio::time::sleep(self.delay).await;
            self.inner.forward(activity).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_waits_for_running_timer_flush() {
        let sink = Arc::new(SlowSink {
            inner: MemorySink::new(),
            delay: Duration::from_secs(5),
        });
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        for name in ["a", "b", "c"] {
            add(&batcher, &format!("/repo/src/{}.rs", name), "s1").await;
        }
        // The timer has taken the bucket and is part-way through forwarding.
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(batcher.queued_buckets(), 0);
        assert_eq!(sink.inner.forwarded_count(), 0);

        assert_eq!(batcher.flush_all().await.unwrap(), 0);
        assert_eq!(
            sink.inner.forwarded_titles(),
            vec!["Read /repo/src/a.rs", "Read /repo/src/b.rs", "Read /repo/src/c.rs"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_drains_buckets_and_running_flushes() {
        let sink = Arc::new(SlowSink {
            inner: MemorySink::new(),
            delay: Duration::from_secs(5),
        });
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/src/a.rs", "s1").await;
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        add(&batcher, "/repo/docs/b.md", "s1").await;
        assert_eq!(batcher.queued_buckets(), 1);

        assert_eq!(batcher.flush_all().await.unwrap(), 1);
        assert_eq!(sink.inner.forwarded_count(), 2);
        assert_eq!(batcher.queued_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_drains_everything() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/src/a.rs", "s1").await;
        add(&batcher, "/repo/src/b.rs", "s2").await;
        add(&batcher, "/repo/src/c.rs", "s2").await;

        let forwarded = batcher.flush_all().await.unwrap();
        assert_eq!(forwarded, 3);
        assert_eq!(batcher.queued_buckets(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.forwarded_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_then_timer_is_noop() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/repo/src/a.rs", "s1").await;
        assert_eq!(batcher.flush("s1:/repo/src").await.unwrap(), 1);
        assert_eq!(batcher.flush("s1:/repo/src").await.unwrap(), 0);

        // A new bucket under the same key gets its own generation.
        add(&batcher, "/repo/src/b.rs", "s1").await;
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(
            sink.forwarded_titles(),
            vec!["Read /repo/src/a.rs", "Read /repo/src/b.rs"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapse_failure_propagates() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        for name in ["a", "b", "c", "d"] {
            add(&batcher, &format!("/r/{}.rs", name), "s1").await;
        }
        let (activity, path) = read("/r/e.rs", "s1");
        assert!(batcher.add(activity, path.as_deref()).await.is_err());
        assert_eq!(batcher.queued_buckets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_failure_is_logged_not_panicked() {
        let sink = Arc::new(MemorySink::new());
        let batcher = FileReadBatcher::new(sink.clone(), &config());

        add(&batcher, "/r/a.rs", "s1").await;
        add(&batcher, "/r/b.rs", "s1").await;
        sink.set_failing(true);

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(batcher.queued_buckets(), 0);
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.forwarded_count(), 0);
    }
}
