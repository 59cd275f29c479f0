//! HTTP client: session fetch, takeover REST calls, event stream opening

use super::stream::SseStream;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::types::{
    ChatRequest, EndTakeoverRequest, EndTakeoverResponse, RejectTakeoverRequest,
    RejectTakeoverResponse, RenewTakeoverRequest, RenewTakeoverResponse, SessionSnapshot,
    ShellView, StartTakeoverRequest, StartTakeoverResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Optional `{code, msg, data}` wrapper some deployments put around bodies
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Low-level HTTP client for one session server
///
/// Holds a pooled `reqwest::Client`; cheap to share behind an `Arc`.
pub struct HttpClient {
    http: reqwest::Client,
    config: Arc<SessionConfig>,
}

impl HttpClient {
    /// Build a client for the configured server
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        // streams stay open far longer than a request, so no global timeout here
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| SessionError::Config(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(base_url = %config.base_url, "Session HTTP client ready");

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Absolute URL for a path below the configured base
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Fetch the authoritative session snapshot
    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let path = format!("sessions/{}", session_id);
        let builder = self
            .http
            .get(self.endpoint(&path))
            .timeout(self.config.request_timeout());
        let snapshot: SessionSnapshot = self.execute(&path, builder).await?;

        tracing::debug!(
            session_id,
            status = %snapshot.status,
            events = snapshot.events.len(),
            "Session fetched"
        );
        Ok(snapshot)
    }

    /// Open the server-sent event stream for a session
    pub async fn open_stream(&self, session_id: &str, request: &ChatRequest) -> Result<SseStream> {
        let path = format!("sessions/{}/chat", session_id);
        let response = self
            .authorize(self.http.post(self.endpoint(&path)))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(SessionError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::from_status(path, status.as_u16(), body));
        }

        tracing::info!(
            session_id,
            resume_after = ?request.event_id,
            with_message = request.message.is_some(),
            "Event stream opened"
        );

        Ok(SseStream::new(response))
    }

    pub async fn start_takeover(
        &self,
        session_id: &str,
        request: &StartTakeoverRequest,
    ) -> Result<StartTakeoverResponse> {
        self.post_json(&format!("sessions/{}/takeover", session_id), request)
            .await
    }

    pub async fn renew_takeover(
        &self,
        session_id: &str,
        request: &RenewTakeoverRequest,
    ) -> Result<RenewTakeoverResponse> {
        self.post_json(&format!("sessions/{}/takeover/renew", session_id), request)
            .await
    }

    pub async fn reject_takeover(
        &self,
        session_id: &str,
        request: &RejectTakeoverRequest,
    ) -> Result<RejectTakeoverResponse> {
        self.post_json(&format!("sessions/{}/takeover/reject", session_id), request)
            .await
    }

    pub async fn end_takeover(
        &self,
        session_id: &str,
        request: &EndTakeoverRequest,
    ) -> Result<EndTakeoverResponse> {
        self.post_json(&format!("sessions/{}/takeover/end", session_id), request)
            .await
    }

    pub async fn view_shell(&self, session_id: &str, shell_session_id: &str) -> Result<ShellView> {
        #[derive(Serialize)]
        struct ViewShell<'a> {
            session_id: &'a str,
        }
        self.post_json(
            &format!("sessions/{}/shell", session_id),
            &ViewShell {
                session_id: shell_session_id,
            },
        )
        .await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self
            .http
            .post(self.endpoint(path))
            .timeout(self.config.request_timeout())
            .json(body);
        self.execute(path, builder).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        path: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(SessionError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(SessionError::from)?;

        if !status.is_success() {
            tracing::warn!(path, status = status.as_u16(), "Request failed");
            return Err(SessionError::from_status(path, status.as_u16(), body));
        }

        decode_body(path, &body)
    }
}

/// Decode a success body, unwrapping the `{code, msg, data}` envelope if present
pub(crate) fn decode_body<T: DeserializeOwned>(path: &str, body: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(body)?;

    let is_envelope = value
        .as_object()
        .map(|o| o.contains_key("code") && o.contains_key("data"))
        .unwrap_or(false);
    if !is_envelope {
        return Ok(serde_json::from_value(value)?);
    }

    let envelope: Envelope = serde_json::from_value(value)?;
    if envelope.code != 0 {
        let status = if (400..600).contains(&envelope.code) {
            envelope.code as u16
        } else {
            500
        };
        return Err(SessionError::from_status(path, status, envelope.msg));
    }
    Ok(serde_json::from_value(envelope.data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestStatus, SessionStatus};

    #[test]
    fn test_endpoint_joins_paths() {
        let client = HttpClient::new(SessionConfig::new("http://localhost:8000/api/v1/")).unwrap();
        assert_eq!(
            client.endpoint("/sessions/abc"),
            "http://localhost:8000/api/v1/sessions/abc"
        );
    }

    #[test]
    fn test_decode_plain_body() {
        let resp: RenewTakeoverResponse = decode_body(
            "renew",
            r#"{"status":"takeover","request_status":"renewed","takeover_id":"tk","expires_at":1700000900}"#,
        )
        .unwrap();
        assert_eq!(resp.status, SessionStatus::Takeover);
        assert_eq!(resp.request_status, RequestStatus::Renewed);
    }

    #[test]
    fn test_decode_enveloped_body() {
        let resp: RejectTakeoverResponse = decode_body(
            "reject",
            r#"{"code":0,"msg":"ok","data":{"status":"running","reason":"user declined"}}"#,
        )
        .unwrap();
        assert_eq!(resp.status, SessionStatus::Running);
        assert_eq!(resp.reason, "user declined");
    }

    #[test]
    fn test_enveloped_conflict_is_classified() {
        let err = decode_body::<RenewTakeoverResponse>(
            "renew",
            r#"{"code":409,"msg":"lease superseded","data":null}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Conflict(_)));

        let err = decode_body::<RenewTakeoverResponse>(
            "renew",
            r#"{"code":1001,"msg":"internal","data":null}"#,
        )
        .unwrap_err();
        assert!(err.is_transient());
    }
}
