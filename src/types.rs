//! Core session types for the a3s-session system
//!
//! Wire payloads use snake_case field names, matching the session server's
//! event stream and REST surface. Events arrive as `{event: tag, data: {...}}`
//! units and decode into the exhaustive [`SessionEvent`] union.

use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no task started yet
    #[default]
    Pending,
    /// Agent is executing
    Running,
    /// Agent is idle, awaiting user input
    Waiting,
    /// Task finished (successfully or not)
    Completed,
    /// Takeover requested, waiting for the agent to yield
    TakeoverPending,
    /// Human operator drives the shell/browser
    Takeover,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Completed => "completed",
            SessionStatus::TakeoverPending => "takeover_pending",
            SessionStatus::Takeover => "takeover",
        }
    }

    /// Whether the server may still emit events for this session
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending
                | SessionStatus::Running
                | SessionStatus::TakeoverPending
                | SessionStatus::Takeover
        )
    }

    /// Whether a takeover is requested or in effect
    pub fn is_controlled(&self) -> bool {
        matches!(self, SessionStatus::TakeoverPending | SessionStatus::Takeover)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and timing fields shared by every event payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Server-assigned, roughly monotonic identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(
        default,
        with = "flexible_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl EventMeta {
    pub fn with_id(event_id: impl Into<String>) -> Self {
        Self {
            event_id: Some(event_id.into()),
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// File reference attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub role: MessageRole,
    pub message: String,

    /// Identifies one streamed message across its partial snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    /// True while more snapshots of this stream are expected
    #[serde(default)]
    pub partial: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleEvent {
    pub title: String,
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    /// Whether the step has reached a final state
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// One step of the agent's plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub id: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Calling,
    Called,
}

/// One prompt/command/output record of a shell console
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleRecord {
    #[serde(default)]
    pub ps1: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool_call_id: String,

    /// Tool family, e.g. "shell", "browser", "file"
    pub name: String,

    /// Concrete function, e.g. "shell_exec", "browser_navigate"
    pub function: String,

    #[serde(default)]
    pub args: serde_json::Value,

    /// Result content, present once the call has produced output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,

    pub status: ToolStatus,

    #[serde(flatten)]
    pub meta: EventMeta,
}

impl ToolEvent {
    /// String argument by name
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    /// Shell sub-session the call ran in (shell tools only)
    pub fn shell_session_id(&self) -> Option<&str> {
        self.arg_str("id")
    }

    pub fn command(&self) -> Option<&str> {
        self.arg_str("command")
    }

    pub fn url(&self) -> Option<&str> {
        self.arg_str("url")
    }

    /// Console records from a shell tool result
    pub fn console(&self) -> Vec<ConsoleRecord> {
        self.content
            .as_ref()
            .and_then(|c| c.get("console"))
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default()
    }

    /// Screenshot reference from a browser tool result
    pub fn screenshot(&self) -> Option<&str> {
        self.content
            .as_ref()
            .and_then(|c| c.get("screenshot"))
            .and_then(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Requested,
    Started,
    Renewed,
    Ended,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    User,
    Agent,
    System,
}

/// Takeover lifecycle notice emitted by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<TakeoverScope>,
    pub source: ControlSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub takeover_id: Option<String>,
    #[serde(
        default,
        with = "flexible_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,

    /// Explicit recoverability; when absent the reconciler's pattern list decides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,

    #[serde(flatten)]
    pub meta: EventMeta,
}

/// Entry of the sessions overview list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub latest_message: Option<String>,
    #[serde(
        default,
        with = "flexible_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_message_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsListEvent {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(flatten)]
    pub meta: EventMeta,
}

/// A typed event of a session timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Message(MessageEvent),
    Title(TitleEvent),
    Plan(PlanEvent),
    Step(StepEvent),
    Tool(ToolEvent),
    Control(ControlEvent),
    Wait(WaitEvent),
    Done(DoneEvent),
    Error(ErrorEvent),
    #[serde(rename = "sessions-list", alias = "sessions")]
    SessionsList(SessionsListEvent),
}

/// Payload-free discriminant of [`SessionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Title,
    Plan,
    Step,
    Tool,
    Control,
    Wait,
    Done,
    Error,
    SessionsList,
}

impl EventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Title => "title",
            EventKind::Plan => "plan",
            EventKind::Step => "step",
            EventKind::Tool => "tool",
            EventKind::Control => "control",
            EventKind::Wait => "wait",
            EventKind::Done => "done",
            EventKind::Error => "error",
            EventKind::SessionsList => "sessions-list",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "message" => EventKind::Message,
            "title" => EventKind::Title,
            "plan" => EventKind::Plan,
            "step" => EventKind::Step,
            "tool" => EventKind::Tool,
            "control" => EventKind::Control,
            "wait" => EventKind::Wait,
            "done" => EventKind::Done,
            "error" => EventKind::Error,
            "sessions-list" | "sessions" => EventKind::SessionsList,
            _ => return None,
        })
    }

    /// `wait`, `done` and `error` end the live portion of an interaction
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Wait | EventKind::Done | EventKind::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One undecoded unit of the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

impl SessionEvent {
    /// Decode a wire unit, rejecting tags this client does not know
    pub fn decode(raw: RawEvent) -> Result<Self> {
        if EventKind::from_tag(&raw.event).is_none() {
            return Err(SessionError::UnknownEvent(raw.event));
        }
        let data = if raw.data.is_null() {
            serde_json::json!({})
        } else {
            raw.data
        };
        let value = serde_json::json!({ "event": raw.event, "data": data });
        Ok(serde_json::from_value(value)?)
    }

    /// Encode back into a wire unit
    pub fn to_raw(&self) -> Result<RawEvent> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Message(_) => EventKind::Message,
            SessionEvent::Title(_) => EventKind::Title,
            SessionEvent::Plan(_) => EventKind::Plan,
            SessionEvent::Step(_) => EventKind::Step,
            SessionEvent::Tool(_) => EventKind::Tool,
            SessionEvent::Control(_) => EventKind::Control,
            SessionEvent::Wait(_) => EventKind::Wait,
            SessionEvent::Done(_) => EventKind::Done,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::SessionsList(_) => EventKind::SessionsList,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            SessionEvent::Message(e) => &e.meta,
            SessionEvent::Title(e) => &e.meta,
            SessionEvent::Plan(e) => &e.meta,
            SessionEvent::Step(e) => &e.meta,
            SessionEvent::Tool(e) => &e.meta,
            SessionEvent::Control(e) => &e.meta,
            SessionEvent::Wait(e) => &e.meta,
            SessionEvent::Done(e) => &e.meta,
            SessionEvent::Error(e) => &e.meta,
            SessionEvent::SessionsList(e) => &e.meta,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        self.meta().event_id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.meta().created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// The canonical, reconciled view of one remote session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub title: Option<String>,
    /// Insertion order is causal order; one entry per semantic slot
    pub events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// Authoritative session state as returned by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// Surface a takeover lease applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverScope {
    Shell,
    Browser,
}

impl fmt::Display for TakeoverScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeoverScope::Shell => f.write_str("shell"),
            TakeoverScope::Browser => f.write_str("browser"),
        }
    }
}

/// Server-issued, time-bounded right to drive the shell or browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverLease {
    pub takeover_id: String,
    pub scope: TakeoverScope,
    pub expires_at: DateTime<Utc>,
}

impl TakeoverLease {
    /// Remaining time-to-live at `now`, zero once expired
    pub fn ttl_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a takeover request as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Lease issued; control is with the human
    Started,
    /// Queued until the agent yields
    #[serde(alias = "pending")]
    Starting,
    Renewed,
    Ended,
    Rejected,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTakeoverRequest {
    pub scope: TakeoverScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTakeoverResponse {
    pub status: SessionStatus,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub takeover_id: Option<String>,
    #[serde(
        default,
        with = "flexible_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StartTakeoverResponse {
    /// The lease asserted by this response, if it carries one
    pub fn lease(&self, scope: TakeoverScope) -> Option<TakeoverLease> {
        match (&self.takeover_id, self.expires_at) {
            (Some(id), Some(expires_at)) => Some(TakeoverLease {
                takeover_id: id.clone(),
                scope,
                expires_at,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewTakeoverRequest {
    pub takeover_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewTakeoverResponse {
    pub status: SessionStatus,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub takeover_id: String,
    #[serde(
        default,
        with = "flexible_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectDecision {
    /// Agent keeps working
    Continue,
    /// Agent stops; session completes
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectTakeoverRequest {
    pub decision: RejectDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectTakeoverResponse {
    pub status: SessionStatus,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffMode {
    /// Agent resumes the task
    Continue,
    /// Task is considered finished by the operator
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTakeoverRequest {
    pub handoff_mode: HandoffMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTakeoverResponse {
    pub status: SessionStatus,
    pub handoff_mode: HandoffMode,
}

/// Body of a stream-opening request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// New user message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resume after this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Unix seconds of the user message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl ChatRequest {
    /// Resume a stream after `event_id` without sending a message
    pub fn resume(event_id: Option<String>) -> Self {
        Self {
            event_id,
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>, after: Option<String>) -> Self {
        Self {
            message: Some(message.into()),
            event_id: after,
            timestamp: Some(Utc::now().timestamp()),
            attachments: Vec::new(),
        }
    }
}

/// Read-only view of a shell sub-session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellView {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub console: Vec<ConsoleRecord>,
}

/// Timestamps as RFC 3339 strings or Unix seconds/milliseconds
pub(crate) mod flexible_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    // Anything above this is taken to be milliseconds
    const MILLIS_THRESHOLD: i64 = 100_000_000_000;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = Option::<Wire>::deserialize(deserializer)?;
        let parsed = match wire {
            None => return Ok(None),
            Some(Wire::Int(n)) if n > MILLIS_THRESHOLD => DateTime::from_timestamp_millis(n),
            Some(Wire::Int(n)) => DateTime::from_timestamp(n, 0),
            Some(Wire::Float(f)) => {
                DateTime::from_timestamp(f.trunc() as i64, (f.fract() * 1e9) as u32)
            }
            Some(Wire::Text(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(<D::Error as serde::de::Error>::custom)
                .map(Some)?,
        };
        parsed
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_message_event() {
        let raw = RawEvent::new(
            "message",
            json!({
                "role": "assistant",
                "message": "Working on it",
                "stream_id": "s-1",
                "partial": true,
                "event_id": "e-1",
                "created_at": 1700000000
            }),
        );

        let event = SessionEvent::decode(raw).unwrap();
        match &event {
            SessionEvent::Message(m) => {
                assert_eq!(m.role, MessageRole::Assistant);
                assert_eq!(m.stream_id.as_deref(), Some("s-1"));
                assert!(m.partial);
                assert!(m.attachments.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.event_id(), Some("e-1"));
        assert_eq!(event.created_at().unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn test_decode_unknown_tag_is_rejected() {
        let err = SessionEvent::decode(RawEvent::new("heartbeat", json!({}))).unwrap_err();
        assert!(matches!(err, SessionError::UnknownEvent(tag) if tag == "heartbeat"));
    }

    #[test]
    fn test_decode_malformed_payload_is_serialization_error() {
        let err = SessionEvent::decode(RawEvent::new("step", json!({"id": 3}))).unwrap_err();
        assert!(matches!(err, SessionError::Serialization(_)));
    }

    #[test]
    fn test_decode_empty_terminal_events() {
        let wait = SessionEvent::decode(RawEvent::new("wait", serde_json::Value::Null)).unwrap();
        assert_eq!(wait.kind(), EventKind::Wait);
        let done = SessionEvent::decode(RawEvent::new("done", json!({}))).unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.event_id(), None);
    }

    #[test]
    fn test_decode_sessions_list_alias() {
        let raw = RawEvent::new(
            "sessions",
            json!({"sessions": [{"session_id": "a", "status": "running"}]}),
        );
        let event = SessionEvent::decode(raw).unwrap();
        assert_eq!(event.kind(), EventKind::SessionsList);
        assert_eq!(event.to_raw().unwrap().event, "sessions-list");
    }

    #[test]
    fn test_tool_event_accessors() {
        let raw = RawEvent::new(
            "tool",
            json!({
                "tool_call_id": "t1",
                "name": "shell",
                "function": "shell_exec",
                "args": {"id": "sh-1", "command": "ls -la"},
                "content": {"console": [{"ps1": "$", "command": "ls -la", "output": "total 0"}]},
                "status": "called"
            }),
        );
        let SessionEvent::Tool(tool) = SessionEvent::decode(raw).unwrap() else {
            panic!("expected tool event");
        };
        assert_eq!(tool.shell_session_id(), Some("sh-1"));
        assert_eq!(tool.command(), Some("ls -la"));
        assert_eq!(tool.console().len(), 1);
        assert_eq!(tool.console()[0].output, "total 0");
        assert!(tool.screenshot().is_none());
    }

    #[test]
    fn test_control_event_with_rfc3339_expiry() {
        let raw = RawEvent::new(
            "control",
            json!({
                "action": "started",
                "scope": "shell",
                "source": "user",
                "takeover_id": "tk-1",
                "expires_at": "2026-01-01T00:15:00Z"
            }),
        );
        let SessionEvent::Control(control) = SessionEvent::decode(raw).unwrap() else {
            panic!("expected control event");
        };
        assert_eq!(control.action, ControlAction::Started);
        assert_eq!(control.scope, Some(TakeoverScope::Shell));
        assert_eq!(control.expires_at.unwrap().to_rfc3339(), "2026-01-01T00:15:00+00:00");
    }

    #[test]
    fn test_millisecond_timestamps() {
        let raw = RawEvent::new("done", json!({"created_at": 1700000000123i64}));
        let event = SessionEvent::decode(raw).unwrap();
        assert_eq!(event.created_at().unwrap().timestamp_millis(), 1700000000123);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::TakeoverPending).unwrap(),
            "\"takeover_pending\""
        );
        let parsed: SessionStatus = serde_json::from_str("\"takeover\"").unwrap();
        assert_eq!(parsed, SessionStatus::Takeover);
        assert!(parsed.is_controlled());
        assert!(!SessionStatus::Waiting.is_active());
    }

    #[test]
    fn test_request_status_aliases() {
        let parsed: RequestStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(parsed, RequestStatus::Starting);
        let parsed: RequestStatus = serde_json::from_str("\"granted-ish\"").unwrap();
        assert_eq!(parsed, RequestStatus::Unknown);
    }

    #[test]
    fn test_start_response_lease() {
        let resp: StartTakeoverResponse = serde_json::from_value(json!({
            "status": "takeover",
            "request_status": "started",
            "takeover_id": "tk-9",
            "expires_at": 1700000900
        }))
        .unwrap();
        let lease = resp.lease(TakeoverScope::Browser).unwrap();
        assert_eq!(lease.takeover_id, "tk-9");
        assert_eq!(lease.scope, TakeoverScope::Browser);

        let now = DateTime::from_timestamp(1700000000, 0).unwrap();
        assert_eq!(lease.ttl_at(now), Duration::from_secs(900));
        assert!(!lease.is_expired_at(now));

        let pending: StartTakeoverResponse = serde_json::from_value(json!({
            "status": "takeover_pending",
            "request_status": "starting"
        }))
        .unwrap();
        assert!(pending.lease(TakeoverScope::Shell).is_none());
    }

    #[test]
    fn test_lease_ttl_saturates_at_zero() {
        let lease = TakeoverLease {
            takeover_id: "tk".into(),
            scope: TakeoverScope::Shell,
            expires_at: DateTime::from_timestamp(100, 0).unwrap(),
        };
        let later = DateTime::from_timestamp(200, 0).unwrap();
        assert_eq!(lease.ttl_at(later), Duration::ZERO);
        assert!(lease.is_expired_at(later));
    }

    #[test]
    fn test_chat_request_skips_empty_fields() {
        let json = serde_json::to_string(&ChatRequest::resume(None)).unwrap();
        assert_eq!(json, "{}");
        let json = serde_json::to_string(&ChatRequest::resume(Some("e-7".into()))).unwrap();
        assert_eq!(json, r#"{"event_id":"e-7"}"#);
    }
}
