//! HTTP implementation of the sink and source seams.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use pulse_core::classify::truncate;
use pulse_core::config::SinkConfig;
use pulse_core::error::{PulseError, Result};
use pulse_core::types::ActivityRecord;

use crate::{parse_activity_list, ActivitySink, ActivitySource, SinkReceipt, StoredActivity};

/// Talks to the activity store over HTTP.
///
/// No request timeout is configured: a hung store blocks only the task that
/// is waiting on it.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    query_url: String,
}

/// Body returned by the store for a POST.
#[derive(Debug, Deserialize)]
struct SinkReply {
    ok: Option<bool>,
    id: Option<Value>,
    error: Option<String>,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, query_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            query_url: query_url.into(),
        }
    }

    pub fn from_config(config: &SinkConfig) -> Self {
        Self::new(config.url.clone(), config.resolved_query_url().to_string())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn query(&self, params: &[(&str, String)]) -> Result<Vec<StoredActivity>> {
        let response = self
            .client
            .get(&self.query_url)
            .query(params)
            .send()
            .await
            .map_err(|e| PulseError::Sink(format!("GET {} failed: {}", self.query_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PulseError::Sink(format!(
                "query returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| PulseError::Sink(format!("unparseable query response: {}", e)))?;
        Ok(parse_activity_list(&value))
    }
}

/// Interpret a 2xx response body. An empty body counts as success.
pub fn parse_receipt(body: &str) -> Result<SinkReceipt> {
    if body.trim().is_empty() {
        return Ok(SinkReceipt::default());
    }

    let reply: SinkReply = serde_json::from_str(body)
        .map_err(|e| PulseError::Sink(format!("unparseable sink response: {}", e)))?;

    if reply.ok == Some(false) {
        return Err(PulseError::Sink(
            reply
                .error
                .unwrap_or_else(|| "sink rejected activity".to_string()),
        ));
    }

    let id = reply.id.and_then(|id| match id {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    Ok(SinkReceipt { id })
}

#[async_trait]
impl ActivitySink for HttpSink {
    async fn forward(&self, activity: &ActivityRecord) -> Result<SinkReceipt> {
        let response = self
            .client
            .post(&self.url)
            .json(activity)
            .send()
            .await
            .map_err(|e| PulseError::Sink(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PulseError::Sink(format!("failed to read sink response: {}", e)))?;

        if !status.is_success() {
            return Err(PulseError::Sink(format!(
                "sink returned {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let receipt = parse_receipt(&body)?;
        debug!(title = %activity.title, id = ?receipt.id, "Activity forwarded");
        Ok(receipt)
    }
}

#[async_trait]
impl ActivitySource for HttpSink {
    async fn activities_between(&self, start_ms: i64, end_ms: i64) -> Result<Vec<StoredActivity>> {
        self.query(&[("start", start_ms.to_string()), ("end", end_ms.to_string())])
            .await
    }

    async fn recent_activities(&self, limit: usize) -> Result<Vec<StoredActivity>> {
        self.query(&[("limit", limit.to_string())]).await
    }
}
