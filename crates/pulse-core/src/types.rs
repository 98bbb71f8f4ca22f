use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Enums
// =============================================================================

/// User-facing category of an activity, as rendered by the dashboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Email,
    Code,
    Cron,
    Search,
    Message,
    File,
    Browser,
    System,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Email => "email",
            ActivityType::Code => "code",
            ActivityType::Cron => "cron",
            ActivityType::Search => "search",
            ActivityType::Message => "message",
            ActivityType::File => "file",
            ActivityType::Browser => "browser",
            ActivityType::System => "system",
        }
    }
}

/// Outcome of the underlying tool invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    Success,
    Error,
    Pending,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Error => "error",
            ActivityStatus::Pending => "pending",
        }
    }

    /// Parse one of the three wire values. Anything else yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(ActivityStatus::Success),
            "error" => Some(ActivityStatus::Error),
            "pending" => Some(ActivityStatus::Pending),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ActivityStatus::Error)
    }
}

/// The classifier's internal category for a raw tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Exec,
    Message,
    FileRead,
    FileModify,
    Browser,
    Cron,
    WebFetch,
    SessionsSpawn,
    Unknown,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Exec => "exec",
            ToolKind::Message => "message",
            ToolKind::FileRead => "file_read",
            ToolKind::FileModify => "file_modify",
            ToolKind::Browser => "browser",
            ToolKind::Cron => "cron",
            ToolKind::WebFetch => "web_fetch",
            ToolKind::SessionsSpawn => "sessions_spawn",
            ToolKind::Unknown => "unknown",
        }
    }

    /// Fixed mapping from tool kind to the user-facing activity type.
    pub fn activity_type(&self) -> ActivityType {
        match self {
            ToolKind::Exec => ActivityType::Code,
            ToolKind::Message => ActivityType::Message,
            ToolKind::FileRead | ToolKind::FileModify => ActivityType::File,
            ToolKind::Browser => ActivityType::Browser,
            ToolKind::Cron => ActivityType::Cron,
            ToolKind::WebFetch => ActivityType::Search,
            ToolKind::SessionsSpawn | ToolKind::Unknown => ActivityType::System,
        }
    }

    /// Importance on a 1-5 scale. Errors always rank highest.
    pub fn importance(&self, status: ActivityStatus) -> u8 {
        if status.is_error() {
            return 5;
        }
        match self {
            ToolKind::FileRead => 1,
            ToolKind::Message => 4,
            ToolKind::Exec | ToolKind::SessionsSpawn => 3,
            _ => 2,
        }
    }
}

/// Event names accepted by the simple webhook (`POST /events`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayEventKind {
    ToolCall,
    CronFire,
    MessageSent,
    FileChanged,
    Error,
}

impl RelayEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEventKind::ToolCall => "tool_call",
            RelayEventKind::CronFire => "cron_fire",
            RelayEventKind::MessageSent => "message_sent",
            RelayEventKind::FileChanged => "file_changed",
            RelayEventKind::Error => "error",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Metadata attached to every activity.
///
/// `extra` carries open-ended fields (`filePath`, `fileCount`, `sessionFile`,
/// ...) flattened next to the fixed ones on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetadata {
    pub importance: u8,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The canonical output unit of the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ActivityStatus,
    pub metadata: ActivityMetadata,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ActivityRecord {
    /// Exact identity used by the backfill dedup layers.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.timestamp, &self.metadata.tool, &self.title)
    }

    /// Insert an open-ended metadata field.
    pub fn set_extra(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.extra.insert(key.to_string(), value.into());
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.metadata.extra.get(key).and_then(Value::as_str)
    }
}

/// Build a `timestamp|tool|title` key. The tool name is lowercased.
pub fn dedup_key(timestamp: i64, tool: &str, title: &str) -> String {
    format!("{}|{}|{}", timestamp, tool.to_lowercase(), title)
}

/// A raw tool invocation as reported by the agent or rebuilt from a transcript.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToolCall {
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RawToolCall {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            tool: tool.into(),
            params,
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Simple webhook shape handled without full tool-call enrichment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEvent {
    pub event: RelayEventKind,
    #[serde(default)]
    pub tool: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ActivityStatus>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
