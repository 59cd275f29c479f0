//! HTTP session backend
//!
//! Implements `SessionApi` over the session server's REST surface, with
//! events delivered as `text/event-stream`.

mod client;
mod stream;

pub use client::HttpClient;
pub use stream::{SseParser, SseStream};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::provider::{EventStream, SessionApi};
use crate::types::{
    ChatRequest, EndTakeoverRequest, EndTakeoverResponse, RejectTakeoverRequest,
    RejectTakeoverResponse, RenewTakeoverRequest, RenewTakeoverResponse, SessionSnapshot,
    ShellView, StartTakeoverRequest, StartTakeoverResponse,
};
use async_trait::async_trait;

/// HTTP session backend
///
/// Wraps `HttpClient` and implements the `SessionApi` trait.
pub struct HttpSessionApi {
    client: HttpClient,
}

impl HttpSessionApi {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
        })
    }

    /// Get the underlying HTTP client for advanced usage
    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.client.get_session(session_id).await
    }

    async fn open_stream(
        &self,
        session_id: &str,
        request: &ChatRequest,
    ) -> Result<Box<dyn EventStream>> {
        let stream = self.client.open_stream(session_id, request).await?;
        Ok(Box::new(stream))
    }

    async fn start_takeover(
        &self,
        session_id: &str,
        request: &StartTakeoverRequest,
    ) -> Result<StartTakeoverResponse> {
        self.client.start_takeover(session_id, request).await
    }

    async fn renew_takeover(
        &self,
        session_id: &str,
        request: &RenewTakeoverRequest,
    ) -> Result<RenewTakeoverResponse> {
        self.client.renew_takeover(session_id, request).await
    }

    async fn reject_takeover(
        &self,
        session_id: &str,
        request: &RejectTakeoverRequest,
    ) -> Result<RejectTakeoverResponse> {
        self.client.reject_takeover(session_id, request).await
    }

    async fn end_takeover(
        &self,
        session_id: &str,
        request: &EndTakeoverRequest,
    ) -> Result<EndTakeoverResponse> {
        self.client.end_takeover(session_id, request).await
    }

    async fn view_shell(&self, session_id: &str, shell_session_id: &str) -> Result<ShellView> {
        self.client.view_shell(session_id, shell_session_id).await
    }

    fn name(&self) -> &str {
        "http"
    }
}
