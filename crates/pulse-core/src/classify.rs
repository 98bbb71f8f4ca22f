//! Tool-call classification and enrichment.
//!
//! Maps a raw tool invocation to a typed [`ActivityRecord`] in five steps:
//! tool kind, status, title/description, importance, activity type. The
//! classifier is a pure function and never fails; any missing field degrades
//! to a generic label.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::types::{
    ActivityMetadata, ActivityRecord, ActivityStatus, ActivityType, RawToolCall, RelayEvent,
    RelayEventKind, ToolKind,
};

const TITLE_SNIPPET: usize = 60;
const URL_SNIPPET: usize = 80;
const DESCRIPTION_LIMIT: usize = 200;

const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "file", "filename", "target"];
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script"];
const PLATFORMS: &[&str] = &["discord", "telegram", "slack", "whatsapp"];

// =============================================================================
// Step 1: tool kind rules
// =============================================================================

/// A single predicate over a lowercased tool name.
pub enum NameMatcher {
    Exact(&'static [&'static str]),
    Contains(&'static [&'static str]),
    Pattern(Regex),
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Exact(names) => names.iter().any(|n| *n == name),
            NameMatcher::Contains(needles) => needles.iter().any(|n| name.contains(n)),
            NameMatcher::Pattern(regex) => regex.is_match(name),
        }
    }
}

/// Maps a tool name to a kind when any of its matchers fires.
pub struct ToolRule {
    pub kind: ToolKind,
    matchers: Vec<NameMatcher>,
}

impl ToolRule {
    pub fn new(kind: ToolKind, matchers: Vec<NameMatcher>) -> Self {
        Self { kind, matchers }
    }

    /// `name` must already be lowercased.
    pub fn matches(&self, name: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(name))
    }
}

/// The ordered rule table. First match wins.
pub fn tool_rules() -> &'static [ToolRule] {
    static RULES: OnceLock<Vec<ToolRule>> = OnceLock::new();
    RULES.get_or_init(build_rules)
}

fn build_rules() -> Vec<ToolRule> {
    use NameMatcher::{Contains, Exact, Pattern};

    vec![
        // Shell-family names win over any file verb they also contain.
        ToolRule::new(
            ToolKind::Exec,
            vec![
                Contains(&["bash", "shell", "exec", "terminal"]),
                Exact(&["process"]),
            ],
        ),
        ToolRule::new(
            ToolKind::FileRead,
            vec![
                Pattern(Regex::new(r"^(read|cat|view|open)_?file").expect("Invalid file_read regex")),
                Exact(&["read"]),
            ],
        ),
        ToolRule::new(
            ToolKind::FileModify,
            vec![
                Pattern(
                    Regex::new(r"^(write|edit|patch|modify|update|save)_?file")
                        .expect("Invalid file_modify regex"),
                ),
                Contains(&["apply_patch"]),
                Exact(&["write", "edit"]),
            ],
        ),
        ToolRule::new(
            ToolKind::Message,
            vec![Contains(&["message", "discord", "telegram", "slack", "whatsapp"])],
        ),
        ToolRule::new(
            ToolKind::Browser,
            vec![Contains(&["browser", "navigate", "playwright", "screenshot"])],
        ),
        ToolRule::new(ToolKind::Cron, vec![Contains(&["cron"])]),
        ToolRule::new(
            ToolKind::WebFetch,
            vec![Contains(&["fetch", "web_search", "search"])],
        ),
        ToolRule::new(
            ToolKind::SessionsSpawn,
            vec![Contains(&["sessions_spawn", "spawn", "subagent"])],
        ),
    ]
}

/// Classify a tool name (case-insensitive).
pub fn classify_tool(name: &str) -> ToolKind {
    let lower = name.trim().to_lowercase();
    tool_rules()
        .iter()
        .find(|rule| rule.matches(&lower))
        .map(|rule| rule.kind)
        .unwrap_or(ToolKind::Unknown)
}

// =============================================================================
// Step 2: status
// =============================================================================

/// Infer the status of a tool invocation from its result payload.
///
/// A missing or non-object result counts as success.
pub fn infer_status(result: Option<&Value>) -> ActivityStatus {
    match result {
        Some(Value::Object(map)) => infer_from_map(map),
        _ => ActivityStatus::Success,
    }
}

fn infer_from_map(map: &Map<String, Value>) -> ActivityStatus {
    if let Some(status) = map
        .get("status")
        .and_then(Value::as_str)
        .and_then(ActivityStatus::parse)
    {
        return status;
    }

    let explicit_false = |key: &str| matches!(map.get(key), Some(Value::Bool(false)));
    if map.get("error").is_some_and(is_truthy) || explicit_false("ok") || explicit_false("success")
    {
        return ActivityStatus::Error;
    }

    for key in ["exitCode", "exit_code", "code"] {
        if let Some(code) = map.get(key).and_then(Value::as_f64) {
            if code != 0.0 {
                return ActivityStatus::Error;
            }
        }
    }

    match map.get("details") {
        Some(Value::Object(details)) => infer_from_map(details),
        _ => ActivityStatus::Success,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// =============================================================================
// Step 3: titles
// =============================================================================

struct ExecPatterns {
    git: Regex,
    package: Regex,
    patch_file: Regex,
    url_host: Regex,
}

fn patterns() -> &'static ExecPatterns {
    static PATTERNS: OnceLock<ExecPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ExecPatterns {
        git: Regex::new(r"(?:^|[\s;&|(])git\s+(push|pull|commit)\b").expect("Invalid git regex"),
        package: Regex::new(
            r"(?:^|[\s;&|(])(npm|pnpm|yarn)\s+(?:run\s+)?(install|ci|add|i|test|build)\b",
        )
        .expect("Invalid package manager regex"),
        patch_file: Regex::new(r"\*\*\* (?:Update|Add|Delete) File: ([^\r\n]+)")
            .expect("Invalid patch regex"),
        url_host: Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://(?:[^@/?#]*@)?([^/:?#]+)")
            .expect("Invalid url regex"),
    })
}

/// Truncate to `max` characters, appending "..." when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let prefix: String = trimmed.chars().take(max).collect();
    format!("{}...", prefix.trim_end())
}

fn param_str(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| params.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn nested_str(params: &Map<String, Value>, outer: &str, keys: &[&str]) -> Option<String> {
    params
        .get(outer)
        .and_then(Value::as_object)
        .and_then(|inner| param_str(inner, keys))
}

fn command_text(params: &Map<String, Value>) -> Option<String> {
    for key in COMMAND_KEYS {
        match params.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Array(parts)) => {
                let joined = parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
                if !joined.trim().is_empty() {
                    return Some(joined);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a file path from the usual parameter aliases.
pub fn extract_path(params: &Map<String, Value>) -> Option<String> {
    param_str(params, PATH_KEYS)
}

/// Hostname of a URL, or the leading segment of a scheme-less address.
pub fn hostname(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(caps) = patterns().url_host.captures(url) {
        return caps.get(1).map(|m| m.as_str().to_lowercase());
    }
    let host = url.split(['/', '?', '#', ':']).next().unwrap_or("").trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

struct Label {
    title: String,
    description: Option<String>,
}

impl Label {
    fn title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }

    fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.map(|d| truncate(&d, DESCRIPTION_LIMIT));
        self
    }
}

fn describe_exec(params: &Map<String, Value>) -> Label {
    let Some(command) = command_text(params) else {
        return Label::title("Ran command");
    };
    let p = patterns();

    let title = if let Some(caps) = p.git.captures(&command) {
        format!("Git {}", &caps[1])
    } else if let Some(caps) = p.package.captures(&command) {
        let action = match &caps[2] {
            "i" | "ci" | "add" => "install",
            other => other,
        };
        format!("{} {}", &caps[1], action)
    } else {
        format!("Ran command: {}", truncate(&command, TITLE_SNIPPET))
    };

    Label::title(title).with_description(Some(command))
}

fn describe_message(tool: &str, params: &Map<String, Value>) -> Label {
    let lower = tool.to_lowercase();
    let mut target = param_str(params, &["target", "to", "channelId", "chatId"]);
    let mut platform = PLATFORMS
        .iter()
        .find(|p| lower.contains(*p))
        .map(|p| p.to_string())
        .or_else(|| param_str(params, &["platform", "provider"]));

    if let Some(channel) = param_str(params, &["channel"]) {
        if platform.is_none() && PLATFORMS.contains(&channel.to_lowercase().as_str()) {
            platform = Some(channel);
        } else if target.is_none() {
            target = Some(channel);
        }
    }

    let mut title = match platform {
        Some(p) => format!("Sent {} message", capitalize(&p.to_lowercase())),
        None => "Sent message".to_string(),
    };
    if let Some(target) = target {
        title.push_str(" to ");
        title.push_str(&truncate(&target, TITLE_SNIPPET));
    }

    Label::title(title).with_description(param_str(params, &["message", "text", "content"]))
}

fn describe_file_read(path: Option<&str>) -> Label {
    match path {
        Some(path) => Label::title(format!("Read {}", path)),
        None => Label::title("Read file"),
    }
}

fn describe_file_modify(tool: &str, params: &Map<String, Value>, path: Option<&str>) -> Label {
    let lower = tool.to_lowercase();
    if lower.contains("apply_patch") {
        let patched = path.map(str::to_string).or_else(|| {
            let body = param_str(params, &["input", "patch"])?;
            patterns()
                .patch_file
                .captures(&body)
                .map(|caps| caps[1].trim().to_string())
        });
        return match patched {
            Some(p) => Label::title(format!("Applied patch to {}", p)),
            None => Label::title("Applied patch"),
        };
    }

    match path {
        Some(path) if lower.starts_with("write") || lower.starts_with("save") => {
            Label::title(format!("Wrote {}", path))
        }
        Some(path) => Label::title(format!("Edited {}", path)),
        None => Label::title("Modified file"),
    }
}

fn describe_browser(params: &Map<String, Value>) -> Label {
    if let Some(url) = param_str(params, &["url", "targetUrl"]) {
        return Label::title(format!("Browsed {}", truncate(&url, URL_SNIPPET)));
    }
    match param_str(params, &["action"]) {
        Some(action) => Label::title(format!("Browser: {}", action)),
        None => Label::title("Browser action"),
    }
}

fn describe_cron(params: &Map<String, Value>) -> Label {
    let name = param_str(params, &["name", "jobId", "id"])
        .or_else(|| nested_str(params, "job", &["name", "id"]));
    let action = param_str(params, &["action"]);

    let schedule = param_str(params, &["schedule", "cron", "expr"])
        .or_else(|| nested_str(params, "schedule", &["expr", "cron"]))
        .or_else(|| {
            let job = params.get("job").and_then(Value::as_object)?;
            param_str(job, &["schedule", "cron"])
                .or_else(|| nested_str(job, "schedule", &["expr", "cron"]))
        });

    let title = match (action, name) {
        (Some(action), Some(name)) => format!("Cron {}: {}", action, name),
        (None, Some(name)) => format!("Cron: {}", name),
        (Some(action), None) => format!("Cron {}", action),
        (None, None) => "Cron job".to_string(),
    };

    Label::title(title).with_description(schedule.map(|s| format!("Schedule: {}", s)))
}

fn describe_web_fetch(params: &Map<String, Value>) -> Label {
    if let Some(query) = param_str(params, &["query", "q"]) {
        return Label::title(format!("Searched web: {}", truncate(&query, TITLE_SNIPPET)));
    }
    match param_str(params, &["url"]) {
        Some(url) => {
            let host = hostname(&url).unwrap_or_else(|| truncate(&url, URL_SNIPPET));
            Label::title(format!("Fetched {}", host)).with_description(Some(url))
        }
        None => Label::title("Fetched web content"),
    }
}

fn describe_spawn(params: &Map<String, Value>) -> Label {
    match param_str(params, &["task", "prompt", "message"]) {
        Some(task) => Label::title(format!(
            "Spawned sub-agent: {}",
            truncate(&task, TITLE_SNIPPET)
        ))
        .with_description(Some(task)),
        None => Label::title("Spawned sub-agent"),
    }
}

fn describe(kind: ToolKind, call: &RawToolCall, path: Option<&str>) -> Label {
    let params = &call.params;
    match kind {
        ToolKind::Exec => describe_exec(params),
        ToolKind::Message => describe_message(&call.tool, params),
        ToolKind::FileRead => describe_file_read(path),
        ToolKind::FileModify => describe_file_modify(&call.tool, params, path),
        ToolKind::Browser => describe_browser(params),
        ToolKind::Cron => describe_cron(params),
        ToolKind::WebFetch => describe_web_fetch(params),
        ToolKind::SessionsSpawn => describe_spawn(params),
        ToolKind::Unknown => {
            let name = if call.tool.trim().is_empty() {
                "unknown"
            } else {
                call.tool.trim()
            };
            Label::title(format!("Ran tool: {}", name))
        }
    }
}

fn error_message(result: Option<&Value>) -> Option<String> {
    let map = result?.as_object()?;
    param_str(map, &["error", "message"]).or_else(|| nested_str(map, "details", &["error"]))
}

// =============================================================================
// Enrichment
// =============================================================================

/// Classifier output.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    pub activity: ActivityRecord,
    pub kind: ToolKind,
    pub file_path: Option<String>,
}

/// Classify and enrich a raw tool call.
///
/// `arrival_ms` is used as the timestamp when the call carries none.
pub fn enrich(call: &RawToolCall, arrival_ms: i64) -> Enriched {
    let kind = classify_tool(&call.tool);
    let status = infer_status(call.result.as_ref());

    let file_path = match kind {
        ToolKind::FileRead | ToolKind::FileModify => extract_path(&call.params),
        _ => None,
    };

    let mut label = describe(kind, call, file_path.as_deref());
    if status.is_error() && label.description.is_none() {
        label.description = error_message(call.result.as_ref()).map(|e| truncate(&e, DESCRIPTION_LIMIT));
    }

    let mut extra = Map::new();
    if let Some(path) = &file_path {
        extra.insert("filePath".to_string(), Value::String(path.clone()));
    }

    let activity = ActivityRecord {
        activity_type: kind.activity_type(),
        title: label.title,
        description: label.description,
        status,
        metadata: ActivityMetadata {
            importance: kind.importance(status),
            tool: call.tool.clone(),
            duration: call.duration,
            session_key: call.session_key.clone(),
            extra,
        },
        timestamp: call.timestamp.unwrap_or(arrival_ms),
    };

    Enriched {
        activity,
        kind,
        file_path,
    }
}

/// Convert a simple webhook event into an activity.
pub fn event_activity(event: &RelayEvent, arrival_ms: i64) -> ActivityRecord {
    let tool_kind = event.tool.as_deref().map(classify_tool);

    let activity_type = match event.event {
        RelayEventKind::ToolCall => tool_kind
            .map(|k| k.activity_type())
            .unwrap_or(ActivityType::System),
        RelayEventKind::CronFire => ActivityType::Cron,
        RelayEventKind::MessageSent => ActivityType::Message,
        RelayEventKind::FileChanged => ActivityType::File,
        RelayEventKind::Error => ActivityType::System,
    };

    let status = event.status.unwrap_or(match event.event {
        RelayEventKind::Error => ActivityStatus::Error,
        _ => ActivityStatus::Success,
    });

    let importance = if status.is_error() {
        5
    } else {
        match event.event {
            RelayEventKind::MessageSent => 4,
            RelayEventKind::ToolCall => tool_kind.map(|k| k.importance(status)).unwrap_or(2),
            _ => 2,
        }
    };

    let extra = event.metadata.clone().unwrap_or_default();
    let timestamp = extra
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(arrival_ms);
    let session_key = extra
        .get("sessionKey")
        .and_then(Value::as_str)
        .map(str::to_string);
    let duration = extra.get("duration").and_then(Value::as_f64);

    let mut extra = extra;
    for key in ["timestamp", "sessionKey", "duration", "importance", "tool"] {
        extra.remove(key);
    }

    ActivityRecord {
        activity_type,
        title: event.title.clone(),
        description: event.description.clone(),
        status,
        metadata: ActivityMetadata {
            importance,
            tool: event
                .tool
                .clone()
                .unwrap_or_else(|| event.event.as_str().to_string()),
            duration,
            session_key,
            extra,
        },
        timestamp,
    }
}
