//! The relay service: gates, batcher and sink behind one object.
//!
//! All mutable relay state (rate-limit timestamps, recent titles, file-read
//! buckets) lives here, so a router, a test, or a second relay instance each
//! get their own independent copy.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use pulse_core::classify::{enrich, event_activity};
use pulse_core::config::PulseConfig;
use pulse_core::error::{PulseError, Result};
use pulse_core::types::{now_millis, ActivityType, RawToolCall, RelayEvent, ToolKind};
use pulse_sink::ActivitySink;

use crate::batcher::FileReadBatcher;
use crate::dedup::TitleDedup;
use crate::rate_limit::EventRateLimiter;

/// Result of a simple webhook event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Forwarded {
        id: Option<String>,
        activity_type: ActivityType,
    },
    RateLimited,
    Duplicate,
}

/// Result of one raw tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub title: String,
    pub buffered: bool,
    pub forwarded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemError {
    pub index: usize,
    pub error: String,
}

/// Aggregate result of a `/batch` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub buffered: usize,
    pub forwarded: usize,
    pub errors: Vec<BatchItemError>,
}

pub struct RelayService {
    sink: Arc<dyn ActivitySink>,
    limiter: EventRateLimiter,
    dedup: TitleDedup,
    batcher: FileReadBatcher,
}

impl RelayService {
    pub fn new(config: &PulseConfig, sink: Arc<dyn ActivitySink>) -> Self {
        Self {
            limiter: EventRateLimiter::new(Duration::from_millis(config.relay.rate_limit_ms)),
            dedup: TitleDedup::new(Duration::from_millis(config.relay.dedup_window_ms)),
            batcher: FileReadBatcher::new(Arc::clone(&sink), &config.batcher),
            sink,
        }
    }

    /// Gate and forward a simple webhook event.
    ///
    /// Rejected events are neither queued nor retried. The title enters the
    /// dedup window before the sink is called, so a sink failure still counts:
    /// a client retrying the same title within the window gets
    /// [`EventOutcome::Duplicate`] and the event is never stored.
    pub async fn ingest_event(&self, event: RelayEvent) -> Result<EventOutcome> {
        let event_type = event.event.as_str();
        if !self.limiter.try_acquire(event_type) {
            debug!(event = event_type, "Event rate limited");
            return Ok(EventOutcome::RateLimited);
        }
        if self.dedup.check_and_record(&event.title) {
            debug!(title = %event.title, "Duplicate event suppressed");
            return Ok(EventOutcome::Duplicate);
        }

        let activity = event_activity(&event, now_millis());
        let receipt = self.sink.forward(&activity).await?;
        info!(event = event_type, title = %activity.title, "Event forwarded");
        Ok(EventOutcome::Forwarded {
            id: receipt.id,
            activity_type: activity.activity_type,
        })
    }

    /// Classify one raw tool call. File reads go to the batcher, everything
    /// else straight to the sink.
    pub async fn ingest_tool_call(&self, call: RawToolCall) -> Result<ToolOutcome> {
        let enriched = enrich(&call, now_millis());
        let title = enriched.activity.title.clone();

        if enriched.kind == ToolKind::FileRead {
            let outcome = self
                .batcher
                .add(enriched.activity, enriched.file_path.as_deref())
                .await?;
            return Ok(ToolOutcome {
                title,
                buffered: outcome.buffered,
                forwarded: outcome.forwarded,
            });
        }

        self.sink.forward(&enriched.activity).await?;
        debug!(tool = %call.tool, title = %title, "Tool call forwarded");
        Ok(ToolOutcome {
            title,
            buffered: false,
            forwarded: 1,
        })
    }

    /// Process a batch in order. A bad item is reported by index and does
    /// not stop the rest.
    pub async fn ingest_batch(&self, items: Vec<Value>) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, item) in items.into_iter().enumerate() {
            let result = match parse_tool_call(item) {
                Ok(call) => self.ingest_tool_call(call).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => {
                    report.accepted += 1;
                    if outcome.buffered {
                        report.buffered += 1;
                    }
                    report.forwarded += outcome.forwarded;
                }
                Err(e) => report.errors.push(BatchItemError {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        if !report.errors.is_empty() {
            warn!(
                failed = report.errors.len(),
                accepted = report.accepted,
                "Batch partially failed"
            );
        }
        report
    }

    pub fn queued_buckets(&self) -> usize {
        self.batcher.queued_buckets()
    }

    pub fn batcher(&self) -> &FileReadBatcher {
        &self.batcher
    }

    /// Drain every pending file-read bucket.
    pub async fn shutdown(&self) -> Result<usize> {
        let forwarded = self.batcher.flush_all().await?;
        info!(forwarded, "Relay drained");
        Ok(forwarded)
    }
}

/// Validate an incoming tool call: `tool` must be a non-empty string and
/// `params` an object.
pub fn parse_tool_call(value: Value) -> Result<RawToolCall> {
    let obj = value
        .as_object()
        .ok_or_else(|| PulseError::Serialization("tool call must be a JSON object".to_string()))?;

    match obj.get("tool").and_then(Value::as_str) {
        Some(tool) if !tool.trim().is_empty() => {}
        _ => {
            return Err(PulseError::Serialization(
                "missing field `tool`".to_string(),
            ))
        }
    }
    if !obj.get("params").is_some_and(Value::is_object) {
        return Err(PulseError::Serialization(
            "missing field `params`".to_string(),
        ));
    }

    Ok(serde_json::from_value(value)?)
}

/// Validate an incoming webhook event.
pub fn parse_event(value: Value) -> Result<RelayEvent> {
    let event: RelayEvent = serde_json::from_value(value)?;
    if event.title.trim().is_empty() {
        return Err(PulseError::Serialization("missing field `title`".to_string()));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_sink::MemorySink;
    use serde_json::json;

    fn service() -> (RelayService, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let service = RelayService::new(&PulseConfig::default(), sink.clone());
        (service, sink)
    }

    fn event(kind: &str, title: &str) -> RelayEvent {
        parse_event(json!({ "event": kind, "title": title })).unwrap()
    }

    #[test]
    fn test_parse_tool_call_requires_tool_and_params() {
        assert!(parse_tool_call(json!({ "tool": "exec", "params": {} })).is_ok());
        assert!(parse_tool_call(json!({ "params": {} })).is_err());
        assert!(parse_tool_call(json!({ "tool": "", "params": {} })).is_err());
        assert!(parse_tool_call(json!({ "tool": "exec" })).is_err());
        assert!(parse_tool_call(json!({ "tool": "exec", "params": [] })).is_err());
        assert!(parse_tool_call(json!("exec")).is_err());
    }

    #[test]
    fn test_parse_event_validation() {
        assert!(parse_event(json!({ "event": "cron_fire", "title": "Nightly" })).is_ok());
        assert!(parse_event(json!({ "event": "cron_fire" })).is_err());
        assert!(parse_event(json!({ "event": "cron_fire", "title": "  " })).is_err());
        assert!(parse_event(json!({ "event": "bogus", "title": "x" })).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_gates() {
        let (service, sink) = service();

        let first = service.ingest_event(event("cron_fire", "Nightly")).await.unwrap();
        assert!(matches!(
            first,
            EventOutcome::Forwarded {
                activity_type: ActivityType::Cron,
                ..
            }
        ));

        let second = service.ingest_event(event("cron_fire", "Other")).await.unwrap();
        assert_eq!(second, EventOutcome::RateLimited);

        let third = service.ingest_event(event("message_sent", "Nightly")).await.unwrap();
        assert_eq!(third, EventOutcome::Duplicate);

        assert_eq!(sink.forwarded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_sink_failure_surfaces() {
        let (service, sink) = service();
        sink.set_failing(true);
        let err = service
            .ingest_event(event("error", "Boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, PulseError::Sink(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_event_title_still_holds_dedup_window() {
        let (service, sink) = service();
        sink.set_failing(true);
        assert!(service.ingest_event(event("error", "Boom")).await.is_err());
        sink.set_failing(false);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        let retry = service.ingest_event(event("error", "Boom")).await.unwrap();
        assert_eq!(retry, EventOutcome::Duplicate);
        assert_eq!(sink.forwarded_count(), 0);

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        let later = service.ingest_event(event("error", "Boom")).await.unwrap();
        assert!(matches!(later, EventOutcome::Forwarded { .. }));
        assert_eq!(sink.forwarded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_calls_bypass_event_gates() {
        let (service, sink) = service();
        for _ in 0..3 {
            let call = RawToolCall::new("exec", json!({ "command": "git push" }));
            let outcome = service.ingest_tool_call(call).await.unwrap();
            assert_eq!(outcome.title, "Git push");
            assert_eq!(outcome.forwarded, 1);
        }
        assert_eq!(sink.forwarded_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_reads_are_buffered_until_shutdown() {
        let (service, sink) = service();
        let call = RawToolCall::new("read_file", json!({ "path": "/repo/a.rs" }));
        let outcome = service.ingest_tool_call(call).await.unwrap();
        assert!(outcome.buffered);
        assert_eq!(service.queued_buckets(), 1);
        assert_eq!(sink.forwarded_count(), 0);

        assert_eq!(service.shutdown().await.unwrap(), 1);
        assert_eq!(sink.forwarded_titles(), vec!["Read /repo/a.rs"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_reports_bad_items_by_index() {
        let (service, _sink) = service();
        let report = service
            .ingest_batch(vec![
                json!({ "tool": "exec", "params": { "command": "ls" } }),
                json!({ "params": {} }),
                json!({ "tool": "read", "params": { "path": "/x/y" } }),
            ])
            .await;
        assert_eq!(report.accepted, 2);
        assert_eq!(report.buffered, 1);
        assert_eq!(report.forwarded, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
    }
}
