//! Session API trait: the core abstraction for session backends
//!
//! All backends (HTTP + SSE, in-memory, etc.) implement `SessionApi` to
//! provide a uniform surface for fetching sessions, streaming their events,
//! and driving the takeover lease.

use crate::error::Result;
use crate::types::{
    ChatRequest, EndTakeoverRequest, EndTakeoverResponse, RawEvent, RejectTakeoverRequest,
    RejectTakeoverResponse, RenewTakeoverRequest, RenewTakeoverResponse, SessionSnapshot,
    ShellView, StartTakeoverRequest, StartTakeoverResponse,
};
use async_trait::async_trait;

pub mod http;
pub mod memory;

/// Core trait for session backends
///
/// Implementations handle the transport-specific details. The server is
/// authoritative for every value returned here; callers reconcile, never
/// assume.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Fetch the authoritative state and history of a session
    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot>;

    /// Open an event stream, optionally resuming after `request.event_id`
    async fn open_stream(
        &self,
        session_id: &str,
        request: &ChatRequest,
    ) -> Result<Box<dyn EventStream>>;

    /// Request control of the shell or browser
    async fn start_takeover(
        &self,
        session_id: &str,
        request: &StartTakeoverRequest,
    ) -> Result<StartTakeoverResponse>;

    /// Extend a held lease; a conflict means it is gone
    async fn renew_takeover(
        &self,
        session_id: &str,
        request: &RenewTakeoverRequest,
    ) -> Result<RenewTakeoverResponse>;

    /// Decline a pending takeover
    async fn reject_takeover(
        &self,
        session_id: &str,
        request: &RejectTakeoverRequest,
    ) -> Result<RejectTakeoverResponse>;

    /// Return control to the agent
    async fn end_takeover(
        &self,
        session_id: &str,
        request: &EndTakeoverRequest,
    ) -> Result<EndTakeoverResponse>;

    /// Read-only view of a shell sub-session
    async fn view_shell(&self, session_id: &str, shell_session_id: &str) -> Result<ShellView>;

    /// Backend name (e.g., "http", "memory")
    fn name(&self) -> &str;
}

/// Async stream of undecoded session events
///
/// Decoding is left to the consumer so unknown tags can be quarantined
/// rather than failing the whole stream.
#[async_trait]
pub trait EventStream: Send {
    /// Receive the next event; `Ok(None)` once the server closed the stream
    async fn next(&mut self) -> Result<Option<RawEvent>>;
}
