//! Shell preview polling
//!
//! Read-only views of a shell sub-session, fetched on demand or on an
//! interval. At most one request per shell sub-session is in flight; a
//! concurrent request for the same shell is suppressed instead of racing.

use crate::config::PreviewConfig;
use crate::error::Result;
use crate::provider::SessionApi;
use crate::types::ShellView;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of a preview request
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewOutcome {
    View(ShellView),
    /// A request for the same shell was already in flight
    Suppressed,
}

/// Shell preview fetcher for one session
#[derive(Clone)]
pub struct PreviewPoller {
    api: Arc<dyn SessionApi>,
    session_id: String,
    interval: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Removes its key from the in-flight set when dropped
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl PreviewPoller {
    pub fn new(api: Arc<dyn SessionApi>, session_id: impl Into<String>, config: &PreviewConfig) -> Self {
        Self {
            api,
            session_id: session_id.into(),
            interval: config.poll_interval().max(Duration::from_millis(1)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a request for `shell_session_id` is in flight
    pub fn is_in_flight(&self, shell_session_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(shell_session_id)
    }

    /// Fetch one view unless a request for the same shell is already running
    pub async fn fetch(&self, shell_session_id: &str) -> Result<PreviewOutcome> {
        let Some(_guard) = self.claim(shell_session_id) else {
            tracing::debug!(
                session_id = %self.session_id,
                shell_session_id,
                "Preview suppressed, request in flight"
            );
            return Ok(PreviewOutcome::Suppressed);
        };

        let view = self.api.view_shell(&self.session_id, shell_session_id).await?;
        Ok(PreviewOutcome::View(view))
    }

    /// Poll `shell_session_id` on the configured interval until stopped
    ///
    /// Views and failures are sent to `updates`; the task also ends when
    /// `updates` is closed.
    pub fn poll(
        &self,
        shell_session_id: impl Into<String>,
        updates: mpsc::UnboundedSender<Result<ShellView>>,
    ) -> PreviewTask {
        let poller = self.clone();
        let shell_session_id = shell_session_id.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(
                session_id = %poller.session_id,
                shell_session_id = %shell_session_id,
                interval_ms = poller.interval.as_millis() as u64,
                "Preview polling started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = poller.fetch(&shell_session_id) => result,
                };

                let item = match result {
                    Ok(PreviewOutcome::View(view)) => Ok(view),
                    Ok(PreviewOutcome::Suppressed) => continue,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %poller.session_id,
                            shell_session_id = %shell_session_id,
                            error = %e,
                            "Preview request failed"
                        );
                        Err(e)
                    }
                };
                if updates.send(item).is_err() {
                    break;
                }
            }

            tracing::debug!(
                session_id = %poller.session_id,
                shell_session_id = %shell_session_id,
                "Preview polling stopped"
            );
        });

        PreviewTask {
            cancel,
            task: Some(task),
        }
    }

    fn claim(&self, shell_session_id: &str) -> Option<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(shell_session_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: self.in_flight.clone(),
            key: shell_session_id.to_string(),
        })
    }
}

/// Handle to a polling loop; dropping it stops the loop
pub struct PreviewTask {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PreviewTask {
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for PreviewTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{ApiOp, Failure, MemoryConfig, MemorySessionApi};
    use crate::types::SessionStatus;

    async fn setup(latency: Duration) -> (MemorySessionApi, PreviewPoller) {
        let api = MemorySessionApi::new(MemoryConfig {
            shell_latency: latency,
            ..Default::default()
        });
        api.insert_session("s", SessionStatus::Running, vec![]).await;
        api.set_shell_view(
            "s",
            "sh-1",
            ShellView {
                session_id: "sh-1".into(),
                output: "$ ls\nREADME.md".into(),
                console: vec![],
            },
        )
        .await;
        let poller = PreviewPoller::new(Arc::new(api.clone()), "s", &PreviewConfig::default());
        (api, poller)
    }

    #[tokio::test]
    async fn test_fetch_returns_view() {
        let (_api, poller) = setup(Duration::ZERO).await;
        match poller.fetch("sh-1").await.unwrap() {
            PreviewOutcome::View(view) => assert!(view.output.contains("README.md")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!poller.is_in_flight("sh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetch_is_suppressed() {
        let (api, poller) = setup(Duration::from_millis(500)).await;

        let (first, second) = tokio::join!(poller.fetch("sh-1"), async {
            tokio::task::yield_now().await;
            poller.fetch("sh-1").await
        });

        assert!(matches!(first.unwrap(), PreviewOutcome::View(_)));
        assert_eq!(second.unwrap(), PreviewOutcome::Suppressed);
        assert_eq!(api.calls(ApiOp::ViewShell).await, 1);
        assert!(!poller.is_in_flight("sh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_shells_do_not_block_each_other() {
        let (api, poller) = setup(Duration::from_millis(500)).await;
        api.set_shell_view("s", "sh-2", ShellView::default()).await;

        let (a, b) = tokio::join!(poller.fetch("sh-1"), poller.fetch("sh-2"));
        assert!(matches!(a.unwrap(), PreviewOutcome::View(_)));
        assert!(matches!(b.unwrap(), PreviewOutcome::View(_)));
        assert_eq!(api.calls(ApiOp::ViewShell).await, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_key() {
        let (api, poller) = setup(Duration::ZERO).await;
        api.fail_next(ApiOp::ViewShell, Failure::Status(502)).await;

        assert!(poller.fetch("sh-1").await.is_err());
        assert!(!poller.is_in_flight("sh-1"));
        assert!(matches!(poller.fetch("sh-1").await.unwrap(), PreviewOutcome::View(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stopped() {
        let (api, poller) = setup(Duration::ZERO).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = poller.poll("sh-1", tx);

        // first tick fires at once, then every 5s
        rx.recv().await.unwrap().unwrap();
        rx.recv().await.unwrap().unwrap();
        rx.recv().await.unwrap().unwrap();
        assert_eq!(api.calls(ApiOp::ViewShell).await, 3);

        task.stop();
        assert!(task.is_stopped());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.recv().await.is_none());
        assert_eq!(api.calls(ApiOp::ViewShell).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_failures_and_continues() {
        let (api, poller) = setup(Duration::ZERO).await;
        api.fail_next(ApiOp::ViewShell, Failure::Network).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = poller.poll("sh-1", tx);

        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.unwrap().is_ok());
    }
}
