//! Pulse sink crate - forwarding activities to the external store.
//!
//! The store itself is out of scope; this crate only speaks to it. It defines
//! the [`ActivitySink`] seam used by the relay and the backfill scanner, the
//! [`ActivitySource`] query seam used by backfill deduplication, an HTTP
//! implementation of both, and an in-memory implementation for tests and
//! previews.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pulse_core::error::Result;
use pulse_core::types::{dedup_key, ActivityRecord};

pub use http::HttpSink;
pub use memory::MemorySink;

/// Acknowledgement returned by the store for one forwarded activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkReceipt {
    pub id: Option<String>,
}

/// Destination for enriched activities.
///
/// Implementations perform exactly one delivery attempt. Retrying, backing
/// off or queueing is left to the caller.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn forward(&self, activity: &ActivityRecord) -> Result<SinkReceipt>;
}

/// Read access to activities already held by the store.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Activities whose timestamp lies in `[start_ms, end_ms)`.
    async fn activities_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<StoredActivity>>;

    /// The `limit` most recent activities.
    async fn recent_activities(&self, limit: usize) -> Result<Vec<StoredActivity>>;
}

/// The subset of a stored activity needed to rebuild its dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredActivity {
    pub timestamp: i64,
    pub tool: String,
    pub title: String,
}

impl StoredActivity {
    pub fn dedup_key(&self) -> String {
        dedup_key(self.timestamp, &self.tool, &self.title)
    }

    /// Lenient extraction from a store document. Records without a numeric
    /// timestamp or a title are ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        let timestamp = value.get("timestamp").and_then(|t| {
            t.as_i64().or_else(|| t.as_f64().map(|f| f as i64))
        })?;
        let title = value.get("title").and_then(Value::as_str)?.to_string();
        let tool = value
            .get("metadata")
            .and_then(|m| m.get("tool"))
            .or_else(|| value.get("tool"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            timestamp,
            tool,
            title,
        })
    }
}

impl From<&ActivityRecord> for StoredActivity {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            tool: record.metadata.tool.clone(),
            title: record.title.clone(),
        }
    }
}

/// Parse a query response: either a bare array or `{ "activities": [...] }`.
pub fn parse_activity_list(value: &Value) -> Vec<StoredActivity> {
    let items: &[Value] = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("activities")
            .or_else(|| map.get("items"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    items.iter().filter_map(StoredActivity::from_value).collect()
}
