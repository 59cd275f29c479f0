//! Client configuration
//!
//! All fields are defaulted so a partial JSON document (or none at all)
//! yields a working configuration.

use crate::error::{Result, SessionError};
use crate::reconcile::{RecoverablePolicy, DEFAULT_RECOVERABLE_PATTERNS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a session client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// REST and event-stream root, e.g. `https://agent.example.com/api/v1`
    pub base_url: String,

    /// Duplex transport root; derived from `base_url` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Per-request timeout for REST calls (milliseconds)
    pub request_timeout_ms: u64,

    pub renewal: RenewalConfig,
    pub transport: TransportConfig,
    pub preview: PreviewConfig,
    pub errors: ErrorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".to_string(),
            ws_url: None,
            auth_token: None,
            request_timeout_ms: 30_000,
            renewal: RenewalConfig::default(),
            transport: TransportConfig::default(),
            preview: PreviewConfig::default(),
            errors: ErrorConfig::default(),
        }
    }
}

/// Lease renewal timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenewalConfig {
    /// Lower bound of the renewal period
    pub min_period_secs: u64,
    /// Upper bound of the renewal period
    pub max_period_secs: u64,
    /// Cap on the delay before the first renewal
    pub initial_delay_secs: u64,
    /// Margin subtracted from the TTL for the first renewal
    pub expiry_safety_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            min_period_secs: 10,
            max_period_secs: 300,
            initial_delay_secs: 5,
            expiry_safety_secs: 2,
        }
    }
}

/// Interactive transport timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Quiet period before a geometry change is sent
    pub resize_debounce_ms: u64,
    /// Delays between reconnect attempts; its length bounds the retries
    pub reconnect_backoff_secs: Vec<u64>,
    /// Capacity of the outbound input queue
    pub input_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            resize_debounce_ms: 100,
            reconnect_backoff_secs: vec![1, 2, 4],
            input_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.reconnect_backoff_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

/// Shell preview polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfig {
    pub poll_interval_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl PreviewConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Error-event classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorConfig {
    /// Substrings marking an unflagged error as recoverable; empty = flag only
    pub recoverable_patterns: Vec<String>,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            recoverable_patterns: DEFAULT_RECOVERABLE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ErrorConfig {
    pub fn policy(&self) -> RecoverablePolicy {
        RecoverablePolicy::new(&self.recoverable_patterns)
    }
}

impl SessionConfig {
    /// Configuration pointing at `base_url`, everything else defaulted
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: SessionConfig = serde_json::from_str(&json).map_err(|e| {
            SessionError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), base_url = %config.base_url, "Config loaded");
        Ok(config)
    }

    /// Defaults overridden by `A3S_SESSION_BASE_URL`, `A3S_SESSION_WS_URL`, `A3S_SESSION_TOKEN`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("A3S_SESSION_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(url) = std::env::var("A3S_SESSION_WS_URL") {
            config.ws_url = Some(url);
        }
        if let Ok(token) = std::env::var("A3S_SESSION_TOKEN") {
            config.auth_token = Some(token);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(SessionError::Config("baseUrl must not be empty".into()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| SessionError::Config(format!("invalid baseUrl '{}': {}", self.base_url, e)))?;
        if let Some(ws) = &self.ws_url {
            url::Url::parse(ws)
                .map_err(|e| SessionError::Config(format!("invalid wsUrl '{}': {}", ws, e)))?;
        }
        if self.request_timeout_ms == 0 {
            return Err(SessionError::Config("requestTimeoutMs must be positive".into()));
        }
        let r = &self.renewal;
        if r.min_period_secs == 0 || r.min_period_secs > r.max_period_secs {
            return Err(SessionError::Config(format!(
                "renewal period bounds invalid: min {}s, max {}s",
                r.min_period_secs, r.max_period_secs
            )));
        }
        if self.transport.reconnect_backoff_secs.is_empty() {
            return Err(SessionError::Config(
                "transport.reconnectBackoffSecs must not be empty".into(),
            ));
        }
        if self.transport.input_buffer == 0 {
            return Err(SessionError::Config("transport.inputBuffer must be positive".into()));
        }
        if self.preview.poll_interval_ms == 0 {
            return Err(SessionError::Config("preview.pollIntervalMs must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Duplex root, swapping `http(s)` for `ws(s)` when not configured
    pub fn resolved_ws_url(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.trim_end_matches('/').to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        }
    }
}
