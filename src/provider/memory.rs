//! In-memory session backend
//!
//! A scripted, single-process stand-in for the session server. It keeps
//! authoritative session state, issues and checks takeover leases, replays
//! history on resume, and lets callers inject failures per operation.

use crate::error::{Result, SessionError};
use crate::provider::{EventStream, SessionApi};
use crate::types::{
    ChatRequest, EndTakeoverRequest, EndTakeoverResponse, HandoffMode, RawEvent, RejectDecision,
    RejectTakeoverRequest, RejectTakeoverResponse, RenewTakeoverRequest, RenewTakeoverResponse,
    RequestStatus, SessionSnapshot, SessionStatus, ShellView, StartTakeoverRequest,
    StartTakeoverResponse, TakeoverScope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Operations of the `SessionApi` surface, for call accounting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOp {
    GetSession,
    OpenStream,
    StartTakeover,
    RenewTakeover,
    RejectTakeover,
    EndTakeover,
    ViewShell,
}

/// Failure to return from the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// HTTP-style status response (409 = conflict)
    Status(u16),
    /// Connection dropped before a response
    Network,
}

impl Failure {
    fn into_error(self, op: ApiOp) -> SessionError {
        match self {
            Failure::Status(status) => {
                SessionError::from_status(format!("{:?}", op), status, "injected failure")
            }
            Failure::Network => SessionError::Connection(format!("{:?}: injected failure", op)),
        }
    }
}

/// Behavior knobs of the simulated server
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Lease TTL issued on start and renew
    pub lease_ttl: Duration,
    /// Whether the agent yields at once or leaves the request pending
    pub yield_immediately: bool,
    /// Artificial latency of `view_shell`
    pub shell_latency: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(900),
            yield_immediately: true,
            shell_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct Lease {
    takeover_id: String,
    scope: TakeoverScope,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionState {
    status: SessionStatus,
    title: Option<String>,
    events: Vec<RawEvent>,
    lease: Option<Lease>,
    pending_scope: Option<TakeoverScope>,
    shells: HashMap<String, ShellView>,
    streams: Vec<mpsc::UnboundedSender<Result<RawEvent>>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionState>,
    failures: HashMap<ApiOp, VecDeque<Failure>>,
    calls: HashMap<ApiOp, usize>,
    stream_requests: Vec<ChatRequest>,
}

/// In-memory `SessionApi` implementation
///
/// Cloning shares the same underlying state.
#[derive(Clone, Default)]
pub struct MemorySessionApi {
    inner: Arc<Mutex<Inner>>,
    config: Arc<MemoryConfig>,
}

impl MemorySessionApi {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config: Arc::new(config),
        }
    }

    /// Register a session with its status and history
    pub async fn insert_session(&self, session_id: &str, status: SessionStatus, events: Vec<RawEvent>) {
        let mut inner = self.inner.lock().await;
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        state.status = status;
        state.events = events;
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(state) = self.inner.lock().await.sessions.get_mut(session_id) {
            state.status = status;
        }
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.status)
    }

    /// Append an event to history and deliver it to every open stream
    pub async fn emit(&self, session_id: &str, event: RawEvent) {
        let mut inner = self.inner.lock().await;
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        if event.event == "title" {
            if let Some(title) = event.data.get("title").and_then(|t| t.as_str()) {
                state.title = Some(title.to_string());
            }
        }
        state.events.push(event.clone());
        state.streams.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Close every open stream of a session
    pub async fn close_streams(&self, session_id: &str) {
        if let Some(state) = self.inner.lock().await.sessions.get_mut(session_id) {
            state.streams.clear();
        }
    }

    /// Fail every open stream of a session with a read error
    pub async fn fail_streams(&self, session_id: &str, message: &str) {
        if let Some(state) = self.inner.lock().await.sessions.get_mut(session_id) {
            for tx in state.streams.drain(..) {
                let _ = tx.send(Err(SessionError::Stream(message.to_string())));
            }
        }
    }

    pub async fn open_stream_count(&self, session_id: &str) -> usize {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(state) => {
                state.streams.retain(|tx| !tx.is_closed());
                state.streams.len()
            }
            None => 0,
        }
    }

    /// Let the agent yield to a pending takeover request
    pub async fn grant_pending(&self, session_id: &str) -> Option<String> {
        let ttl = self.config.lease_ttl;
        let mut inner = self.inner.lock().await;
        let state = inner.sessions.get_mut(session_id)?;
        let scope = state.pending_scope.take()?;
        let lease = issue_lease(scope, ttl);
        let takeover_id = lease.takeover_id.clone();
        state.lease = Some(lease);
        state.status = SessionStatus::Takeover;
        Some(takeover_id)
    }

    /// Reclaim control for the agent; the next renewal conflicts
    pub async fn revoke_lease(&self, session_id: &str) {
        if let Some(state) = self.inner.lock().await.sessions.get_mut(session_id) {
            state.lease = None;
            if state.status.is_controlled() {
                state.status = SessionStatus::Running;
            }
        }
    }

    pub async fn lease_id(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .sessions
            .get(session_id)
            .and_then(|s| s.lease.as_ref())
            .map(|l| l.takeover_id.clone())
    }

    pub async fn set_shell_view(&self, session_id: &str, shell_session_id: &str, view: ShellView) {
        let mut inner = self.inner.lock().await;
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        state.shells.insert(shell_session_id.to_string(), view);
    }

    /// Make the next call of `op` fail with `failure`
    pub async fn fail_next(&self, op: ApiOp, failure: Failure) {
        self.inner
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Number of calls of `op` seen so far (including failed ones)
    pub async fn calls(&self, op: ApiOp) -> usize {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Every stream-opening request received, oldest first
    pub async fn stream_requests(&self) -> Vec<ChatRequest> {
        self.inner.lock().await.stream_requests.clone()
    }

    async fn enter(&self, op: ApiOp) -> Result<tokio::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;
        *inner.calls.entry(op).or_default() += 1;
        if let Some(failure) = inner.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            tracing::debug!(?op, ?failure, "Injected failure");
            return Err(failure.into_error(op));
        }
        Ok(inner)
    }
}

fn issue_lease(scope: TakeoverScope, ttl: Duration) -> Lease {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    Lease {
        takeover_id: uuid::Uuid::new_v4().to_string(),
        scope,
        expires_at: Utc::now() + ttl,
    }
}

fn session_mut<'a>(inner: &'a mut Inner, session_id: &str) -> Result<&'a mut SessionState> {
    inner
        .sessions
        .get_mut(session_id)
        .ok_or_else(|| SessionError::NotFound(format!("session {}", session_id)))
}

/// Stream backed by a history backlog followed by live delivery
struct MemoryStream {
    backlog: VecDeque<RawEvent>,
    live: mpsc::UnboundedReceiver<Result<RawEvent>>,
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<RawEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        match self.live.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionApi for MemorySessionApi {
    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let mut inner = self.enter(ApiOp::GetSession).await?;
        let state = session_mut(&mut inner, session_id)?;
        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            title: state.title.clone(),
            status: state.status,
            events: state.events.clone(),
        })
    }

    async fn open_stream(
        &self,
        session_id: &str,
        request: &ChatRequest,
    ) -> Result<Box<dyn EventStream>> {
        let mut inner = self.enter(ApiOp::OpenStream).await?;
        inner.stream_requests.push(request.clone());
        let state = session_mut(&mut inner, session_id)?;

        // resume strictly after the named event; unknown ids replay everything
        let start = request
            .event_id
            .as_deref()
            .and_then(|id| {
                state
                    .events
                    .iter()
                    .position(|e| e.data.get("event_id").and_then(|v| v.as_str()) == Some(id))
            })
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let backlog: VecDeque<RawEvent> = state.events[start..].iter().cloned().collect();

        if let Some(message) = &request.message {
            let user = RawEvent::new(
                "message",
                serde_json::json!({"role": "user", "message": message}),
            );
            state.events.push(user);
            if state.status == SessionStatus::Waiting || state.status == SessionStatus::Pending {
                state.status = SessionStatus::Running;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.push(tx);
        Ok(Box::new(MemoryStream { backlog, live: rx }))
    }

    async fn start_takeover(
        &self,
        session_id: &str,
        request: &StartTakeoverRequest,
    ) -> Result<StartTakeoverResponse> {
        let ttl = self.config.lease_ttl;
        let yield_immediately = self.config.yield_immediately;
        let mut inner = self.enter(ApiOp::StartTakeover).await?;
        let state = session_mut(&mut inner, session_id)?;

        match state.status {
            SessionStatus::Pending | SessionStatus::Completed => {
                return Err(SessionError::from_status(
                    "start_takeover",
                    400,
                    format!("session is {}", state.status),
                ))
            }
            SessionStatus::Takeover => {
                if let Some(lease) = &state.lease {
                    return Ok(StartTakeoverResponse {
                        status: state.status,
                        request_status: RequestStatus::Started,
                        takeover_id: Some(lease.takeover_id.clone()),
                        expires_at: Some(lease.expires_at),
                    });
                }
            }
            _ => {}
        }

        if yield_immediately {
            let lease = issue_lease(request.scope, ttl);
            let response = StartTakeoverResponse {
                status: SessionStatus::Takeover,
                request_status: RequestStatus::Started,
                takeover_id: Some(lease.takeover_id.clone()),
                expires_at: Some(lease.expires_at),
            };
            state.lease = Some(lease);
            state.status = SessionStatus::Takeover;
            Ok(response)
        } else {
            state.pending_scope = Some(request.scope);
            state.status = SessionStatus::TakeoverPending;
            Ok(StartTakeoverResponse {
                status: SessionStatus::TakeoverPending,
                request_status: RequestStatus::Starting,
                takeover_id: None,
                expires_at: None,
            })
        }
    }

    async fn renew_takeover(
        &self,
        session_id: &str,
        request: &RenewTakeoverRequest,
    ) -> Result<RenewTakeoverResponse> {
        let ttl = self.config.lease_ttl;
        let mut inner = self.enter(ApiOp::RenewTakeover).await?;
        let state = session_mut(&mut inner, session_id)?;

        let held = match &state.lease {
            Some(lease) if lease.takeover_id == request.takeover_id => lease.clone(),
            _ => return Err(SessionError::Conflict("lease superseded".into())),
        };
        if held.expires_at <= Utc::now() {
            state.lease = None;
            return Err(SessionError::Conflict("lease expired".into()));
        }

        let renewed = issue_lease(held.scope, ttl);
        let expires_at = renewed.expires_at;
        state.lease = Some(Lease {
            takeover_id: held.takeover_id.clone(),
            ..renewed
        });
        Ok(RenewTakeoverResponse {
            status: state.status,
            request_status: RequestStatus::Renewed,
            takeover_id: held.takeover_id,
            expires_at: Some(expires_at),
        })
    }

    async fn reject_takeover(
        &self,
        session_id: &str,
        request: &RejectTakeoverRequest,
    ) -> Result<RejectTakeoverResponse> {
        let mut inner = self.enter(ApiOp::RejectTakeover).await?;
        let state = session_mut(&mut inner, session_id)?;
        if state.status != SessionStatus::TakeoverPending {
            return Err(SessionError::from_status(
                "reject_takeover",
                409,
                format!("no pending takeover while {}", state.status),
            ));
        }
        state.pending_scope = None;
        state.status = match request.decision {
            RejectDecision::Continue => SessionStatus::Running,
            RejectDecision::Terminate => SessionStatus::Completed,
        };
        Ok(RejectTakeoverResponse {
            status: state.status,
            reason: "takeover rejected".into(),
        })
    }

    async fn end_takeover(
        &self,
        session_id: &str,
        request: &EndTakeoverRequest,
    ) -> Result<EndTakeoverResponse> {
        let mut inner = self.enter(ApiOp::EndTakeover).await?;
        let state = session_mut(&mut inner, session_id)?;
        if state.lease.take().is_none() {
            return Err(SessionError::Conflict("no takeover in effect".into()));
        }
        state.status = match request.handoff_mode {
            HandoffMode::Continue => SessionStatus::Running,
            HandoffMode::Complete => SessionStatus::Completed,
        };
        Ok(EndTakeoverResponse {
            status: state.status,
            handoff_mode: request.handoff_mode,
        })
    }

    async fn view_shell(&self, session_id: &str, shell_session_id: &str) -> Result<ShellView> {
        let view = {
            let mut inner = self.enter(ApiOp::ViewShell).await?;
            let state = session_mut(&mut inner, session_id)?;
            state
                .shells
                .get(shell_session_id)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(format!("shell {}", shell_session_id)))?
        };
        if !self.config.shell_latency.is_zero() {
            tokio::time::sleep(self.config.shell_latency).await;
        }
        Ok(view)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(tag: &str, id: &str) -> RawEvent {
        RawEvent::new(tag, json!({"role": "assistant", "message": id, "event_id": id}))
    }

    #[tokio::test]
    async fn test_stream_resumes_after_event_id() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![raw("message", "e1"), raw("message", "e2")])
            .await;

        let mut stream = api
            .open_stream("s", &ChatRequest::resume(Some("e1".into())))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data["event_id"], "e2");

        api.emit("s", raw("message", "e3")).await;
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.data["event_id"], "e3");

        api.close_streams("s").await;
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(api.stream_requests().await[0].event_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![]).await;

        let started = api
            .start_takeover("s", &StartTakeoverRequest { scope: TakeoverScope::Shell })
            .await
            .unwrap();
        assert_eq!(started.request_status, RequestStatus::Started);
        let id = started.takeover_id.clone().unwrap();

        let renewed = api
            .renew_takeover("s", &RenewTakeoverRequest { takeover_id: id.clone() })
            .await
            .unwrap();
        assert_eq!(renewed.takeover_id, id);

        api.revoke_lease("s").await;
        let err = api
            .renew_takeover("s", &RenewTakeoverRequest { takeover_id: id })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Conflict(_)));
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 2);
    }

    #[tokio::test]
    async fn test_pending_takeover_then_grant() {
        let api = MemorySessionApi::new(MemoryConfig {
            yield_immediately: false,
            ..Default::default()
        });
        api.insert_session("s", SessionStatus::Running, vec![]).await;

        let resp = api
            .start_takeover("s", &StartTakeoverRequest { scope: TakeoverScope::Browser })
            .await
            .unwrap();
        assert_eq!(resp.status, SessionStatus::TakeoverPending);
        assert!(resp.lease(TakeoverScope::Browser).is_none());

        assert!(api.grant_pending("s").await.is_some());
        assert_eq!(api.status("s").await, Some(SessionStatus::Takeover));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_once() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![]).await;
        api.fail_next(ApiOp::GetSession, Failure::Status(503)).await;

        let err = api.get_session("s").await.unwrap_err();
        assert!(err.is_transient());
        assert!(api.get_session("s").await.is_ok());
        assert_eq!(api.calls(ApiOp::GetSession).await, 2);
    }
}
