//! Lease renewal scheduler
//!
//! Keeps a held lease alive with a period derived from its remaining TTL.
//! Renewal pauses while the consumer is not observable and fires at once
//! when it becomes observable again. Stopping the scheduler guarantees no
//! further renewal call starts.
//!
//! The scheduler only trusts the expiry asserted by the last successful
//! renewal. Once that instant passes without another success it reports the
//! lease lost and stops, whatever the reason renewals kept failing.

use crate::config::RenewalConfig;
use crate::error::SessionError;
use crate::lease::{LeaseRenewer, RenewOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Steady-state renewal period: `clamp(ttl / 3, min, max)`
pub fn renewal_period(ttl: Duration, config: &RenewalConfig) -> Duration {
    let min = Duration::from_secs(config.min_period_secs);
    let max = Duration::from_secs(config.max_period_secs);
    (ttl / 3).clamp(min, max)
}

/// Delay before the first renewal: `min(initial, max(0, ttl - safety))`
pub fn first_renewal_delay(ttl: Duration, config: &RenewalConfig) -> Duration {
    let initial = Duration::from_secs(config.initial_delay_secs);
    let safety = Duration::from_secs(config.expiry_safety_secs);
    initial.min(ttl.saturating_sub(safety))
}

/// What the scheduler reports to its owner
#[derive(Debug)]
pub enum RenewalNotice {
    /// Lease extended; `period` is the delay until the next renewal
    Renewed { period: Duration },
    /// Renewal failed transiently; the schedule continues until expiry
    Failed(SessionError),
    /// Lease lost; the scheduler has stopped
    Stopped(SessionError),
}

/// Handle to a running renewal task
///
/// Dropping the handle stops the task.
pub struct RenewalScheduler {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewalScheduler {
    /// Start renewing a lease whose remaining TTL is `ttl`
    ///
    /// `visible` tracks whether the consumer is observable; renewal is paused
    /// while it reads `false`.
    pub fn spawn(
        renewer: Arc<dyn LeaseRenewer>,
        ttl: Duration,
        config: RenewalConfig,
        visible: watch::Receiver<bool>,
        notices: mpsc::UnboundedSender<RenewalNotice>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            renewer,
            ttl,
            config,
            visible,
            notices,
            cancel.clone(),
        ));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop renewing; idempotent
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

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    renewer: Arc<dyn LeaseRenewer>,
    ttl: Duration,
    config: RenewalConfig,
    mut visible: watch::Receiver<bool>,
    notices: mpsc::UnboundedSender<RenewalNotice>,
    cancel: CancellationToken,
) {
    let mut period = renewal_period(ttl, &config);
    let mut deadline = Instant::now() + first_renewal_delay(ttl, &config);
    let mut expires_at = Instant::now() + ttl;

    tracing::debug!(
        ttl_secs = ttl.as_secs(),
        period_secs = period.as_secs(),
        "Renewal scheduled"
    );

    loop {
        if !*visible.borrow_and_update() {
            tracing::debug!("Renewal paused while hidden");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    changed = visible.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *visible.borrow_and_update() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(expires_at) => {
                        expire(&notices);
                        return;
                    }
                }
            }
            // a countdown from before the pause is stale
            deadline = Instant::now();
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = visible.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = tokio::time::sleep_until(deadline.min(expires_at)) => {}
        }
        if Instant::now() >= expires_at {
            expire(&notices);
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = renewer.renew() => outcome,
        };
        if cancel.is_cancelled() {
            return;
        }

        match outcome {
            RenewOutcome::Renewed { ttl } => {
                if let Some(ttl) = ttl {
                    period = renewal_period(ttl, &config);
                    expires_at = Instant::now() + ttl;
                }
                let _ = notices.send(RenewalNotice::Renewed { period });
            }
            RenewOutcome::Transient(e) => {
                let _ = notices.send(RenewalNotice::Failed(e));
            }
            RenewOutcome::Fatal(e) => {
                tracing::info!(error = %e, "Renewal stopped");
                let _ = notices.send(RenewalNotice::Stopped(e));
                return;
            }
        }
        deadline = Instant::now() + period;
    }
}

fn expire(notices: &mpsc::UnboundedSender<RenewalNotice>) {
    tracing::warn!("Lease expired without a successful renewal");
    let _ = notices.send(RenewalNotice::Stopped(SessionError::Conflict(
        "lease expired without a successful renewal".into(),
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records the elapsed time of every renewal and replays scripted outcomes
    struct ScriptedRenewer {
        start: Instant,
        calls: Mutex<Vec<Duration>>,
        script: Mutex<VecDeque<RenewOutcome>>,
    }

    impl ScriptedRenewer {
        fn new(script: Vec<RenewOutcome>) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
            })
        }

        fn calls(&self) -> Vec<Duration> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LeaseRenewer for ScriptedRenewer {
        async fn renew(&self) -> RenewOutcome {
            self.calls.lock().unwrap().push(self.start.elapsed());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RenewOutcome::Renewed { ttl: None })
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn spawn(
        renewer: Arc<ScriptedRenewer>,
        ttl: Duration,
    ) -> (
        RenewalScheduler,
        watch::Sender<bool>,
        mpsc::UnboundedReceiver<RenewalNotice>,
    ) {
        let (visible_tx, visible_rx) = watch::channel(true);
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler =
            RenewalScheduler::spawn(renewer, ttl, RenewalConfig::default(), visible_rx, tx);
        (scheduler, visible_tx, rx)
    }

    #[test]
    fn test_period_is_clamped() {
        let config = RenewalConfig::default();
        assert_eq!(renewal_period(secs(900), &config), secs(300));
        assert_eq!(renewal_period(secs(1800), &config), secs(300));
        assert_eq!(renewal_period(secs(60), &config), secs(20));
        assert_eq!(renewal_period(secs(3), &config), secs(10));
    }

    #[test]
    fn test_first_delay() {
        let config = RenewalConfig::default();
        assert_eq!(first_renewal_delay(secs(900), &config), secs(5));
        assert_eq!(first_renewal_delay(secs(3), &config), secs(1));
        assert_eq!(first_renewal_delay(secs(1), &config), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_ttl_schedule() {
        let renewer = ScriptedRenewer::new(vec![]);
        let (_scheduler, _visible, _rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(700)).await;
        assert_eq!(renewer.calls(), vec![secs(5), secs(305), secs(605)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_ttl_first_renewal() {
        let renewer = ScriptedRenewer::new(vec![]);
        let (_scheduler, _visible, _rx) = spawn(renewer.clone(), secs(3));

        tokio::time::sleep(secs(2)).await;
        assert_eq!(renewer.calls(), vec![secs(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_expiry_recomputes_period() {
        let renewer = ScriptedRenewer::new(vec![RenewOutcome::Renewed {
            ttl: Some(secs(60)),
        }]);
        let (_scheduler, _visible, mut rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(50)).await;
        assert_eq!(renewer.calls(), vec![secs(5), secs(25), secs(45)]);
        assert!(matches!(
            rx.recv().await,
            Some(RenewalNotice::Renewed { period }) if period == secs(20)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_halts_renewal() {
        let renewer = ScriptedRenewer::new(vec![RenewOutcome::Fatal(SessionError::Conflict(
            "superseded".into(),
        ))]);
        let (scheduler, _visible, mut rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(2000)).await;
        assert_eq!(renewer.calls(), vec![secs(5)]);
        assert!(matches!(rx.recv().await, Some(RenewalNotice::Stopped(_))));
        assert!(scheduler.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_schedule() {
        let renewer = ScriptedRenewer::new(vec![RenewOutcome::Transient(
            SessionError::Connection("reset".into()),
        )]);
        let (_scheduler, _visible, mut rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(400)).await;
        assert_eq!(renewer.calls(), vec![secs(5), secs(305)]);
        assert!(matches!(rx.recv().await, Some(RenewalNotice::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_renewals_stop_at_expiry() {
        let renewer = ScriptedRenewer::new(
            (0..10)
                .map(|_| RenewOutcome::Transient(SessionError::Connection("unreachable".into())))
                .collect(),
        );
        let (scheduler, _visible, mut rx) = spawn(renewer.clone(), secs(30));

        tokio::time::sleep(secs(600)).await;
        assert_eq!(renewer.calls(), vec![secs(5), secs(15), secs(25)]);
        assert!(scheduler.is_stopped());

        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        assert_eq!(notices.len(), 4);
        assert!(notices[..3].iter().all(|n| matches!(n, RenewalNotice::Failed(_))));
        assert!(matches!(
            &notices[3],
            RenewalNotice::Stopped(e) if e.class() == crate::error::ErrorClass::Conflict
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_renewals_extend_expiry() {
        let renewer = ScriptedRenewer::new(
            (0..20)
                .map(|_| RenewOutcome::Renewed { ttl: Some(secs(30)) })
                .collect(),
        );
        let (scheduler, _visible, _rx) = spawn(renewer.clone(), secs(30));

        tokio::time::sleep(secs(100)).await;
        assert_eq!(renewer.calls().len(), 10);
        assert!(!scheduler.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_past_expiry_stops() {
        let renewer = ScriptedRenewer::new(vec![]);
        let (scheduler, visible, mut rx) = spawn(renewer.clone(), secs(60));

        visible.send(false).unwrap();
        tokio::time::sleep(secs(120)).await;
        assert!(renewer.calls().is_empty());
        assert!(matches!(rx.recv().await, Some(RenewalNotice::Stopped(_))));
        assert!(scheduler.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let renewer = ScriptedRenewer::new(vec![]);
        let (mut scheduler, _visible, _rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(3)).await;
        scheduler.stop();
        scheduler.stop();
        tokio::time::sleep(secs(1000)).await;
        assert!(renewer.calls().is_empty());
        assert!(scheduler.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_pauses_and_visible_renews_immediately() {
        let renewer = ScriptedRenewer::new(vec![]);
        let (_scheduler, visible, _rx) = spawn(renewer.clone(), secs(900));

        tokio::time::sleep(secs(1)).await;
        visible.send(false).unwrap();
        tokio::time::sleep(secs(399)).await;
        assert!(renewer.calls().is_empty());

        visible.send(true).unwrap();
        tokio::time::sleep(secs(301)).await;
        assert_eq!(renewer.calls(), vec![secs(400), secs(700)]);
    }
}
