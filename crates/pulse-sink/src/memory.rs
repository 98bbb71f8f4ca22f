//! In-process sink used by tests and local previews.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use pulse_core::error::{PulseError, Result};
use pulse_core::types::ActivityRecord;

use crate::{ActivitySink, ActivitySource, SinkReceipt, StoredActivity};

#[derive(Default)]
struct MemoryState {
    forwarded: Vec<ActivityRecord>,
    seeded: Vec<StoredActivity>,
    attempts: usize,
    fail_after: Option<usize>,
    failing: bool,
    range_unsupported: bool,
    range_queries: usize,
    bulk_queries: usize,
}

/// Records every forwarded activity and answers queries from them.
///
/// Failure injection: [`MemorySink::fail_after`] makes every post after the
/// first `n` successful ones fail; [`MemorySink::set_failing`] toggles all
/// posts; [`MemorySink::without_range_queries`] makes range queries error so
/// callers exercise their bulk-fetch fallback.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_after(self, successes: usize) -> Self {
        self.lock().fail_after = Some(successes);
        self
    }

    pub fn without_range_queries(self) -> Self {
        self.lock().range_unsupported = true;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Clear a previous `fail_after` limit.
    pub fn recover(&self) {
        let mut state = self.lock();
        state.fail_after = None;
        state.failing = false;
    }

    /// Pretend the store already holds these activities.
    pub fn seed(&self, activities: impl IntoIterator<Item = StoredActivity>) {
        self.lock().seeded.extend(activities);
    }

    pub fn forwarded(&self) -> Vec<ActivityRecord> {
        self.lock().forwarded.clone()
    }

    pub fn forwarded_titles(&self) -> Vec<String> {
        self.lock()
            .forwarded
            .iter()
            .map(|a| a.title.clone())
            .collect()
    }

    pub fn forwarded_count(&self) -> usize {
        self.lock().forwarded.len()
    }

    /// Number of posts attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn range_queries(&self) -> usize {
        self.lock().range_queries
    }

    pub fn bulk_queries(&self) -> usize {
        self.lock().bulk_queries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stored(state: &MemoryState) -> Vec<StoredActivity> {
        state
            .seeded
            .iter()
            .cloned()
            .chain(state.forwarded.iter().map(StoredActivity::from))
            .collect()
    }
}

#[async_trait]
impl ActivitySink for MemorySink {
    async fn forward(&self, activity: &ActivityRecord) -> Result<SinkReceipt> {
        let mut state = self.lock();
        state.attempts += 1;

        let over_limit = state
            .fail_after
            .is_some_and(|limit| state.forwarded.len() >= limit);
        if state.failing || over_limit {
            return Err(PulseError::Sink("connection refused".to_string()));
        }

        state.forwarded.push(activity.clone());
        Ok(SinkReceipt {
            id: Some(Uuid::new_v4().to_string()),
        })
    }
}

#[async_trait]
impl ActivitySource for MemorySink {
    async fn activities_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<StoredActivity>> {
        let mut state = self.lock();
        state.range_queries += 1;
        if state.range_unsupported {
            return Err(PulseError::Sink("query returned 404 Not Found".to_string()));
        }
        Ok(Self::stored(&state)
            .into_iter()
            .filter(|a| a.timestamp >= start_ms && a.timestamp < end_ms)
            .collect())
    }

    async fn recent_activities(&self, limit: usize) -> Result<Vec<StoredActivity>> {
        let mut state = self.lock();
        state.bulk_queries += 1;
        let mut all = Self::stored(&state);
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }
}
