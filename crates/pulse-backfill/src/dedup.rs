//! Backfill deduplication.
//!
//! Two layers sit in front of the sink: keys already handled in this run, and
//! keys the store already holds. The store is asked once per UTC day touched
//! by the run. When it cannot answer range queries, the most recent
//! activities are fetched once and filtered locally instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use pulse_sink::{ActivitySource, StoredActivity};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    New,
    /// Already handled earlier in this run.
    SeenThisRun,
    /// Already present in the store.
    InStore,
}

pub struct DedupCache {
    source: Arc<dyn ActivitySource>,
    fetch_limit: usize,
    seen: HashSet<String>,
    /// Store keys per UTC day index.
    days: HashMap<i64, HashSet<String>>,
    /// Bulk fetch used once range queries have failed.
    fallback: Option<Vec<StoredActivity>>,
}

impl DedupCache {
    pub fn new(source: Arc<dyn ActivitySource>, fetch_limit: usize) -> Self {
        Self {
            source,
            fetch_limit,
            seen: HashSet::new(),
            days: HashMap::new(),
            fallback: None,
        }
    }

    /// Classify `key` for an activity stamped `timestamp`. Never fails: an
    /// unreachable store degrades to the in-run layer only.
    pub async fn check(&mut self, key: &str, timestamp: i64) -> Verdict {
        if self.seen.contains(key) {
            return Verdict::SeenThisRun;
        }
        let day = day_index(timestamp);
        if !self.days.contains_key(&day) {
            let keys = self.load_day(day).await;
            self.days.insert(day, keys);
        }
        if self.days.get(&day).is_some_and(|keys| keys.contains(key)) {
            return Verdict::InStore;
        }
        Verdict::New
    }

    /// Record `key` as handled in both layers.
    pub fn mark(&mut self, key: &str, timestamp: i64) {
        self.seen.insert(key.to_string());
        self.days
            .entry(day_index(timestamp))
            .or_default()
            .insert(key.to_string());
    }

    /// Whether the bulk-fetch fallback is in use.
    pub fn using_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    async fn load_day(&mut self, day: i64) -> HashSet<String> {
        let start = day * DAY_MS;
        let end = start + DAY_MS;

        if self.fallback.is_none() {
            match self.source.activities_between(start, end).await {
                Ok(activities) => {
                    debug!(day, count = activities.len(), "Loaded store keys for day");
                    return activities.iter().map(StoredActivity::dedup_key).collect();
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        limit = self.fetch_limit,
                        "Range query unavailable, falling back to recent activities"
                    );
                    let recent = match self.source.recent_activities(self.fetch_limit).await {
                        Ok(recent) => recent,
                        Err(e) => {
                            warn!(error = %e, "Recent activities unavailable, store dedup disabled");
                            Vec::new()
                        }
                    };
                    self.fallback = Some(recent);
                }
            }
        }

        self.fallback
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|a| a.timestamp >= start && a.timestamp < end)
            .map(StoredActivity::dedup_key)
            .collect()
    }
}

/// UTC day containing `timestamp` (ms), counted from the epoch.
pub fn day_index(timestamp: i64) -> i64 {
    timestamp.div_euclid(DAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_sink::MemorySink;

    fn stored(timestamp: i64, title: &str) -> StoredActivity {
        StoredActivity {
            timestamp,
            tool: "Exec".to_string(),
            title: title.to_string(),
        }
    }

    #[test]
    fn test_day_index() {
        assert_eq!(day_index(0), 0);
        assert_eq!(day_index(DAY_MS - 1), 0);
        assert_eq!(day_index(DAY_MS), 1);
        assert_eq!(day_index(-1), -1);
    }

    #[tokio::test]
    async fn test_store_layer_queries_once_per_day() {
        let sink = Arc::new(MemorySink::new());
        sink.seed([stored(1_000, "Git push"), stored(DAY_MS + 5, "npm test")]);
        let mut cache = DedupCache::new(sink.clone(), 100);

        assert_eq!(cache.check("1000|exec|Git push", 1_000).await, Verdict::InStore);
        assert_eq!(cache.check("2000|exec|Git pull", 2_000).await, Verdict::New);
        assert_eq!(sink.range_queries(), 1);

        assert_eq!(
            cache.check(&format!("{}|exec|npm test", DAY_MS + 5), DAY_MS + 5).await,
            Verdict::InStore
        );
        assert_eq!(sink.range_queries(), 2);
        assert!(!cache.using_fallback());
    }

    #[tokio::test]
    async fn test_mark_feeds_in_run_layer() {
        let sink = Arc::new(MemorySink::new());
        let mut cache = DedupCache::new(sink, 100);

        assert_eq!(cache.check("5|read|Read a", 5).await, Verdict::New);
        cache.mark("5|read|Read a", 5);
        assert_eq!(cache.check("5|read|Read a", 5).await, Verdict::SeenThisRun);
    }

    #[tokio::test]
    async fn test_fallback_to_recent_fetch_once() {
        let sink = Arc::new(MemorySink::new().without_range_queries());
        sink.seed([stored(1_000, "Git push"), stored(DAY_MS + 1, "Git pull")]);
        let mut cache = DedupCache::new(sink.clone(), 100);

        assert_eq!(cache.check("1000|exec|Git push", 1_000).await, Verdict::InStore);
        assert!(cache.using_fallback());
        assert_eq!(
            cache.check(&format!("{}|exec|Git pull", DAY_MS + 1), DAY_MS + 1).await,
            Verdict::InStore
        );
        assert_eq!(cache.check("7|exec|Other", 7).await, Verdict::New);

        assert_eq!(sink.range_queries(), 1);
        assert_eq!(sink.bulk_queries(), 1);
    }
}
