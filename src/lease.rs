//! Takeover lease protocol
//!
//! Client side of the start / renew / reject / end exchange. The server owns
//! the lease; this side only remembers what the last successful `start` or
//! `renew` asserted and forgets it on any sign the lease is gone.

use crate::error::{ErrorClass, Result, SessionError};
use crate::provider::SessionApi;
use crate::types::{
    EndTakeoverRequest, EndTakeoverResponse, HandoffMode, RejectDecision, RejectTakeoverRequest,
    RejectTakeoverResponse, RenewTakeoverRequest, RenewTakeoverResponse, RequestStatus,
    SessionStatus, StartTakeoverRequest, TakeoverLease, TakeoverScope,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Result of a `start` call
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub status: SessionStatus,
    pub request_status: RequestStatus,
    /// Present when control was granted at once
    pub lease: Option<TakeoverLease>,
}

impl StartOutcome {
    pub fn granted(&self) -> bool {
        self.lease.is_some()
    }
}

/// Result of one renewal attempt, as seen by the scheduler
#[derive(Debug)]
pub enum RenewOutcome {
    /// Lease extended; `ttl` is the new remaining time when the server sent an expiry
    Renewed { ttl: Option<Duration> },
    /// Failed twice with transient errors; keep the regular schedule
    Transient(SessionError),
    /// Lease is gone or the request was refused; stop renewing
    Fatal(SessionError),
}

/// Answer to "is the lease still held?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseValidity {
    Valid,
    /// Superseded, expired, or refused
    Invalid,
    /// Server unreachable; the lease may or may not be held
    Unknown,
}

/// Something that can extend the current lease
#[async_trait]
pub trait LeaseRenewer: Send + Sync {
    async fn renew(&self) -> RenewOutcome;
}

/// Something that can confirm the current lease is still held
#[async_trait]
pub trait LeaseValidator: Send + Sync {
    async fn validate(&self) -> LeaseValidity;
}

/// Lease protocol for one session
///
/// Cloning shares the remembered lease.
#[derive(Clone)]
pub struct LeaseProtocol {
    api: Arc<dyn SessionApi>,
    session_id: String,
    lease: Arc<RwLock<Option<TakeoverLease>>>,
}

impl LeaseProtocol {
    pub fn new(api: Arc<dyn SessionApi>, session_id: impl Into<String>) -> Self {
        Self {
            api,
            session_id: session_id.into(),
            lease: Arc::new(RwLock::new(None)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Lease asserted by the last successful start or renew
    pub async fn current(&self) -> Option<TakeoverLease> {
        self.lease.read().await.clone()
    }

    /// Remember a lease announced out of band (e.g. a `control` event)
    pub async fn observe(&self, lease: TakeoverLease) {
        tracing::debug!(
            session_id = %self.session_id,
            takeover_id = %lease.takeover_id,
            expires_at = %lease.expires_at,
            "Lease observed"
        );
        *self.lease.write().await = Some(lease);
    }

    /// Forget the lease locally
    pub async fn invalidate(&self) -> Option<TakeoverLease> {
        let dropped = self.lease.write().await.take();
        if let Some(lease) = &dropped {
            tracing::info!(
                session_id = %self.session_id,
                takeover_id = %lease.takeover_id,
                "Lease invalidated"
            );
        }
        dropped
    }

    /// Request control of `scope`
    ///
    /// Repeating a start while a lease is held returns that lease.
    pub async fn start(&self, scope: TakeoverScope) -> Result<StartOutcome> {
        let response = self
            .api
            .start_takeover(&self.session_id, &StartTakeoverRequest { scope })
            .await?;

        let lease = match response.request_status {
            RequestStatus::Started | RequestStatus::Renewed => response.lease(scope),
            _ => None,
        };

        match &lease {
            Some(lease) => {
                tracing::info!(
                    session_id = %self.session_id,
                    takeover_id = %lease.takeover_id,
                    %scope,
                    ttl_secs = lease.ttl().as_secs(),
                    "Takeover granted"
                );
                *self.lease.write().await = Some(lease.clone());
            }
            None => {
                tracing::info!(
                    session_id = %self.session_id,
                    %scope,
                    request_status = ?response.request_status,
                    "Takeover pending until the agent yields"
                );
            }
        }

        Ok(StartOutcome {
            status: response.status,
            request_status: response.request_status,
            lease,
        })
    }

    /// Renew the held lease
    ///
    /// Conflicts and other client errors are fatal and forget the lease.
    /// Transient failures are retried once immediately.
    pub async fn renew(&self) -> RenewOutcome {
        let Some(lease) = self.current().await else {
            return RenewOutcome::Fatal(SessionError::NoLease(self.session_id.clone()));
        };

        let first = match self.call_renew(&lease).await {
            Ok(response) => return self.accept_renewal(&lease, response).await,
            Err(e) => e,
        };
        if first.class() != ErrorClass::Transient {
            return self.fail(&lease, first).await;
        }

        tracing::warn!(
            session_id = %self.session_id,
            takeover_id = %lease.takeover_id,
            error = %first,
            "Lease renewal failed, retrying once"
        );

        match self.call_renew(&lease).await {
            Ok(response) => self.accept_renewal(&lease, response).await,
            Err(e) if e.class() == ErrorClass::Transient => {
                tracing::warn!(
                    session_id = %self.session_id,
                    takeover_id = %lease.takeover_id,
                    error = %e,
                    "Lease renewal retry failed, keeping schedule"
                );
                RenewOutcome::Transient(e)
            }
            Err(e) => self.fail(&lease, e).await,
        }
    }

    /// Confirm the lease with a single renewal, without retrying
    pub async fn validate(&self) -> LeaseValidity {
        let Some(lease) = self.current().await else {
            return LeaseValidity::Invalid;
        };
        match self.call_renew(&lease).await {
            Ok(response) => match self.accept_renewal(&lease, response).await {
                RenewOutcome::Renewed { .. } => LeaseValidity::Valid,
                _ => LeaseValidity::Invalid,
            },
            Err(e) if e.class() == ErrorClass::Transient => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Lease validation inconclusive");
                LeaseValidity::Unknown
            }
            Err(e) => {
                self.fail(&lease, e).await;
                LeaseValidity::Invalid
            }
        }
    }

    /// Decline a pending takeover
    pub async fn reject(&self, decision: RejectDecision) -> Result<RejectTakeoverResponse> {
        let response = self
            .api
            .reject_takeover(&self.session_id, &RejectTakeoverRequest { decision })
            .await?;
        self.lease.write().await.take();
        tracing::info!(
            session_id = %self.session_id,
            ?decision,
            status = %response.status,
            "Takeover rejected"
        );
        Ok(response)
    }

    /// Hand control back to the agent
    ///
    /// The local lease is forgotten even when the call fails: after an end
    /// request the client must not assume it still holds control.
    pub async fn end(&self, handoff_mode: HandoffMode) -> Result<EndTakeoverResponse> {
        let dropped = self.lease.write().await.take();
        let result = self
            .api
            .end_takeover(&self.session_id, &EndTakeoverRequest { handoff_mode })
            .await;
        match &result {
            Ok(response) => tracing::info!(
                session_id = %self.session_id,
                takeover_id = ?dropped.as_ref().map(|l| l.takeover_id.as_str()),
                ?handoff_mode,
                status = %response.status,
                "Takeover ended"
            ),
            Err(e) => tracing::warn!(
                session_id = %self.session_id,
                error = %e,
                "End takeover failed"
            ),
        }
        result
    }

    async fn call_renew(&self, lease: &TakeoverLease) -> Result<RenewTakeoverResponse> {
        self.api
            .renew_takeover(
                &self.session_id,
                &RenewTakeoverRequest {
                    takeover_id: lease.takeover_id.clone(),
                },
            )
            .await
    }

    async fn accept_renewal(
        &self,
        renewed: &TakeoverLease,
        response: RenewTakeoverResponse,
    ) -> RenewOutcome {
        if matches!(
            response.request_status,
            RequestStatus::Ended | RequestStatus::Rejected
        ) || !response.status.is_controlled()
        {
            return self
                .fail(
                    renewed,
                    SessionError::Conflict(format!(
                        "lease no longer in effect (session {})",
                        response.status
                    )),
                )
                .await;
        }
        if !response.takeover_id.is_empty() && response.takeover_id != renewed.takeover_id {
            return self
                .fail(
                    renewed,
                    SessionError::Conflict(format!(
                        "lease superseded by {}",
                        response.takeover_id
                    )),
                )
                .await;
        }

        let mut guard = self.lease.write().await;
        let Some(current) = guard.as_mut().filter(|l| l.takeover_id == renewed.takeover_id) else {
            // ended or replaced while the call was in flight
            return RenewOutcome::Fatal(SessionError::NoLease(self.session_id.clone()));
        };

        let ttl = response.expires_at.map(|expires_at| {
            current.expires_at = expires_at;
            current.ttl_at(Utc::now())
        });
        tracing::debug!(
            session_id = %self.session_id,
            takeover_id = %current.takeover_id,
            ttl_secs = ?ttl.map(|t| t.as_secs()),
            "Lease renewed"
        );
        RenewOutcome::Renewed { ttl }
    }

    async fn fail(&self, lease: &TakeoverLease, error: SessionError) -> RenewOutcome {
        {
            let mut guard = self.lease.write().await;
            if guard.as_ref().map(|l| &l.takeover_id) == Some(&lease.takeover_id) {
                guard.take();
            }
        }
        tracing::warn!(
            session_id = %self.session_id,
            takeover_id = %lease.takeover_id,
            class = ?error.class(),
            error = %error,
            "Lease lost"
        );
        RenewOutcome::Fatal(error)
    }
}

#[async_trait]
impl LeaseRenewer for LeaseProtocol {
    async fn renew(&self) -> RenewOutcome {
        LeaseProtocol::renew(self).await
    }
}

#[async_trait]
impl LeaseValidator for LeaseProtocol {
    async fn validate(&self) -> LeaseValidity {
        LeaseProtocol::validate(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{ApiOp, Failure, MemoryConfig, MemorySessionApi};

    async fn setup(config: MemoryConfig) -> (MemorySessionApi, LeaseProtocol) {
        let api = MemorySessionApi::new(config);
        api.insert_session("s1", SessionStatus::Running, vec![]).await;
        let protocol = LeaseProtocol::new(Arc::new(api.clone()), "s1");
        (api, protocol)
    }

    #[tokio::test]
    async fn test_start_grants_lease() {
        let (_api, protocol) = setup(MemoryConfig::default()).await;
        let outcome = protocol.start(TakeoverScope::Shell).await.unwrap();
        assert!(outcome.granted());
        assert_eq!(outcome.status, SessionStatus::Takeover);
        assert_eq!(protocol.current().await, outcome.lease);
    }

    #[tokio::test]
    async fn test_start_pending_holds_no_lease() {
        let (_api, protocol) = setup(MemoryConfig {
            yield_immediately: false,
            ..Default::default()
        })
        .await;
        let outcome = protocol.start(TakeoverScope::Shell).await.unwrap();
        assert!(!outcome.granted());
        assert_eq!(outcome.status, SessionStatus::TakeoverPending);
        assert!(protocol.current().await.is_none());
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();

        match protocol.renew().await {
            RenewOutcome::Renewed { ttl } => assert!(ttl.unwrap() > Duration::from_secs(800)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();
        api.fail_next(ApiOp::RenewTakeover, Failure::Status(503)).await;

        assert!(matches!(protocol.renew().await, RenewOutcome::Renewed { .. }));
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 2);
    }

    #[tokio::test]
    async fn test_repeated_transient_failure_keeps_lease() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();
        api.fail_next(ApiOp::RenewTakeover, Failure::Network).await;
        api.fail_next(ApiOp::RenewTakeover, Failure::Status(502)).await;

        assert!(matches!(protocol.renew().await, RenewOutcome::Transient(_)));
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 2);
        assert!(protocol.current().await.is_some());
    }

    #[tokio::test]
    async fn test_conflict_is_fatal_without_retry() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();
        api.revoke_lease("s1").await;

        match protocol.renew().await {
            RenewOutcome::Fatal(e) => assert_eq!(e.class(), ErrorClass::Conflict),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 1);
        assert!(protocol.current().await.is_none());
    }

    #[tokio::test]
    async fn test_client_error_is_fatal_without_retry() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();
        api.fail_next(ApiOp::RenewTakeover, Failure::Status(403)).await;

        match protocol.renew().await {
            RenewOutcome::Fatal(e) => assert_eq!(e.class(), ErrorClass::Client),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 1);
    }

    #[tokio::test]
    async fn test_renew_without_lease() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        assert!(matches!(
            protocol.renew().await,
            RenewOutcome::Fatal(SessionError::NoLease(_))
        ));
        assert_eq!(api.calls(ApiOp::RenewTakeover).await, 0);
    }

    #[tokio::test]
    async fn test_validate() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        assert_eq!(protocol.validate().await, LeaseValidity::Invalid);

        protocol.start(TakeoverScope::Shell).await.unwrap();
        assert_eq!(protocol.validate().await, LeaseValidity::Valid);

        api.fail_next(ApiOp::RenewTakeover, Failure::Network).await;
        assert_eq!(protocol.validate().await, LeaseValidity::Unknown);
        assert!(protocol.current().await.is_some());

        api.revoke_lease("s1").await;
        assert_eq!(protocol.validate().await, LeaseValidity::Invalid);
        assert!(protocol.current().await.is_none());
    }

    #[tokio::test]
    async fn test_end_forgets_lease() {
        let (api, protocol) = setup(MemoryConfig::default()).await;
        protocol.start(TakeoverScope::Shell).await.unwrap();

        let response = protocol.end(HandoffMode::Continue).await.unwrap();
        assert_eq!(response.status, SessionStatus::Running);
        assert!(protocol.current().await.is_none());
        assert!(api.lease_id("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_reject_pending() {
        let (_api, protocol) = setup(MemoryConfig {
            yield_immediately: false,
            ..Default::default()
        })
        .await;
        protocol.start(TakeoverScope::Browser).await.unwrap();

        let response = protocol.reject(RejectDecision::Terminate).await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);
    }
}
