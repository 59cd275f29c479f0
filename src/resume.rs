//! Resume controller
//!
//! Owns the reconciler for one session and the single event stream attached
//! to it. A resume fetches the authoritative snapshot, rebases the local log
//! onto it, and re-attaches the stream after the last seen event id.
//! Every attach bumps a generation; deliveries from older generations are
//! dropped before they can touch the session.

use crate::error::{Result, SessionError};
use crate::provider::{EventStream, SessionApi};
use crate::reconcile::{MergeOutcome, RecoverablePolicy, Reconciler};
use crate::types::{ChatRequest, RawEvent, Session, SessionEvent, SessionStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Quarantined events kept for inspection
pub const QUARANTINE_LIMIT: usize = 64;

/// An event that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct Quarantined {
    pub raw: RawEvent,
    pub reason: String,
}

/// One item read from a stream
#[derive(Debug)]
pub enum StreamItem {
    Event(RawEvent),
    Error(SessionError),
    Ended,
}

/// A stream item tagged with the generation of the stream that produced it
#[derive(Debug)]
pub struct StreamDelivery {
    pub generation: u64,
    pub item: StreamItem,
}

/// Effect of handling one delivery
#[derive(Debug)]
pub enum Applied {
    /// From a disposed stream; ignored
    Stale,
    Merged(MergeOutcome),
    Quarantined,
    /// Read failure; the stream is gone but the session is intact
    StreamError(SessionError),
    StreamEnded,
}

/// Result of a resume
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOutcome {
    pub status: SessionStatus,
    /// Local-only events kept on top of the remote log
    pub kept_local: usize,
    /// Remote events that failed to decode
    pub quarantined: usize,
    /// Whether a stream was attached
    pub streaming: bool,
}

struct StreamTask {
    generation: u64,
    cancel: CancellationToken,
}

pub struct ResumeController {
    api: Arc<dyn SessionApi>,
    reconciler: Reconciler,
    quarantine: VecDeque<Quarantined>,
    generation: u64,
    stream: Option<StreamTask>,
    deliveries: mpsc::UnboundedSender<StreamDelivery>,
}

impl ResumeController {
    /// Create a controller; stream items arrive on the returned receiver
    pub fn new(
        api: Arc<dyn SessionApi>,
        session_id: impl Into<String>,
        policy: RecoverablePolicy,
    ) -> (Self, mpsc::UnboundedReceiver<StreamDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                api,
                reconciler: Reconciler::with_policy(session_id, policy),
                quarantine: VecDeque::new(),
                generation: 0,
                stream: None,
                deliveries: tx,
            },
            rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.reconciler.session().session_id
    }

    pub fn session(&self) -> &Session {
        self.reconciler.session()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler {
        &mut self.reconciler
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &Quarantined> {
        self.quarantine.iter()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Fetch, rebase, and re-attach the stream when the session is still active
    pub async fn resume(&mut self) -> Result<ResumeOutcome> {
        let snapshot = self.api.get_session(self.session_id()).await?;

        let mut remote = Vec::with_capacity(snapshot.events.len());
        let mut quarantined = 0;
        for raw in snapshot.events {
            if let Some(event) = self.decode(raw) {
                remote.push(event);
            } else {
                quarantined += 1;
            }
        }

        let kept_local = self
            .reconciler
            .rebase(remote, snapshot.status, snapshot.title);

        tracing::info!(
            session_id = %self.session_id(),
            status = %snapshot.status,
            events = self.reconciler.events().len(),
            kept_local,
            quarantined,
            "Session resumed"
        );

        let streaming = if snapshot.status.is_active() {
            let after = self.reconciler.last_event_id().map(str::to_string);
            self.attach(ChatRequest::resume(after)).await?;
            true
        } else {
            self.dispose_stream();
            false
        };

        Ok(ResumeOutcome {
            status: snapshot.status,
            kept_local,
            quarantined,
            streaming,
        })
    }

    /// Send a user message, streaming the response
    pub async fn send_message(&mut self, message: impl Into<String>) -> Result<u64> {
        let after = self.reconciler.last_event_id().map(str::to_string);
        self.attach(ChatRequest::message(message, after)).await
    }

    /// Open a new stream, disposing the previous one first
    pub async fn attach(&mut self, request: ChatRequest) -> Result<u64> {
        self.dispose_stream();

        let stream = self.api.open_stream(self.session_id(), &request).await?;

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            stream,
            generation,
            cancel.clone(),
            self.deliveries.clone(),
        ));
        self.stream = Some(StreamTask { generation, cancel });

        tracing::debug!(session_id = %self.session_id(), generation, "Stream attached");
        Ok(generation)
    }

    /// Cancel the current stream; later deliveries from it are ignored
    pub fn dispose_stream(&mut self) {
        if let Some(task) = self.stream.take() {
            task.cancel.cancel();
            tracing::debug!(
                session_id = %self.session_id(),
                generation = task.generation,
                "Stream disposed"
            );
        }
        // a new generation even without a stream, so in-flight items go stale
        self.generation += 1;
    }

    /// Apply a delivery if it belongs to the current stream
    pub fn handle(&mut self, delivery: StreamDelivery) -> Applied {
        let current = self.stream.as_ref().map(|s| s.generation);
        if current != Some(delivery.generation) {
            return Applied::Stale;
        }

        match delivery.item {
            StreamItem::Event(raw) => {
                let Some(event) = self.decode(raw) else {
                    return Applied::Quarantined;
                };
                let outcome = self.reconciler.apply(event);
                if outcome.closes_stream {
                    self.dispose_stream();
                }
                Applied::Merged(outcome)
            }
            StreamItem::Error(e) => {
                tracing::warn!(session_id = %self.session_id(), error = %e, "Event stream failed");
                self.dispose_stream();
                Applied::StreamError(e)
            }
            StreamItem::Ended => {
                tracing::debug!(session_id = %self.session_id(), "Event stream ended");
                self.dispose_stream();
                Applied::StreamEnded
            }
        }
    }

    /// Merge an event that did not come from the stream (e.g. a local echo)
    pub fn apply_local(&mut self, event: SessionEvent) -> MergeOutcome {
        self.reconciler.apply(event)
    }

    fn decode(&mut self, raw: RawEvent) -> Option<SessionEvent> {
        match SessionEvent::decode(raw.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id(),
                    event = %raw.event,
                    error = %e,
                    "Event quarantined"
                );
                if self.quarantine.len() == QUARANTINE_LIMIT {
                    self.quarantine.pop_front();
                }
                self.quarantine.push_back(Quarantined {
                    raw,
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}

impl Drop for ResumeController {
    fn drop(&mut self) {
        if let Some(task) = self.stream.take() {
            task.cancel.cancel();
        }
    }
}

async fn pump(
    mut stream: Box<dyn EventStream>,
    generation: u64,
    cancel: CancellationToken,
    deliveries: mpsc::UnboundedSender<StreamDelivery>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Ok(Some(raw)) => StreamItem::Event(raw),
                Ok(None) => StreamItem::Ended,
                Err(e) => StreamItem::Error(e),
            },
        };
        let last = !matches!(item, StreamItem::Event(_));
        if deliveries.send(StreamDelivery { generation, item }).is_err() || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{ApiOp, Failure, MemorySessionApi};
    use crate::types::EventKind;
    use serde_json::json;

    fn msg(id: &str, text: &str) -> RawEvent {
        RawEvent::new(
            "message",
            json!({"role": "assistant", "message": text, "event_id": id}),
        )
    }

    async fn next_applied(
        controller: &mut ResumeController,
        rx: &mut mpsc::UnboundedReceiver<StreamDelivery>,
    ) -> Applied {
        loop {
            let delivery = rx.recv().await.unwrap();
            match controller.handle(delivery) {
                Applied::Stale => continue,
                applied => return applied,
            }
        }
    }

    #[tokio::test]
    async fn test_resume_keeps_local_events() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Waiting, vec![msg("A", "a")]).await;
        let (mut controller, _rx) =
            ResumeController::new(Arc::new(api.clone()), "s", RecoverablePolicy::default());

        controller.apply_local(SessionEvent::decode(msg("A", "a")).unwrap());
        controller.apply_local(SessionEvent::decode(msg("B", "b")).unwrap());

        let outcome = controller.resume().await.unwrap();
        assert_eq!(outcome.kept_local, 1);
        assert!(!outcome.streaming);
        let ids: Vec<_> = controller
            .session()
            .events
            .iter()
            .map(|e| e.event_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(controller.session().status, SessionStatus::Waiting);
        assert_eq!(api.calls(ApiOp::OpenStream).await, 0);
    }

    #[tokio::test]
    async fn test_active_session_streams_after_last_event() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![msg("e1", "one")]).await;
        let (mut controller, mut rx) =
            ResumeController::new(Arc::new(api.clone()), "s", RecoverablePolicy::default());

        let outcome = controller.resume().await.unwrap();
        assert!(outcome.streaming);
        assert_eq!(
            api.stream_requests().await[0].event_id.as_deref(),
            Some("e1")
        );

        api.emit("s", msg("e2", "two")).await;
        assert!(matches!(next_applied(&mut controller, &mut rx).await, Applied::Merged(_)));
        assert_eq!(controller.reconciler().last_event_id(), Some("e2"));

        api.emit("s", RawEvent::new("done", json!({"event_id": "e3"}))).await;
        match next_applied(&mut controller, &mut rx).await {
            Applied::Merged(outcome) => {
                assert!(outcome.closes_stream);
                assert_eq!(outcome.status, SessionStatus::Completed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!controller.is_streaming());
        assert_eq!(controller.session().events.last().unwrap().kind(), EventKind::Done);
    }

    #[tokio::test]
    async fn test_unknown_events_are_quarantined() {
        let api = MemorySessionApi::default();
        api.insert_session(
            "s",
            SessionStatus::Waiting,
            vec![
                RawEvent::new("heartbeat", json!({})),
                RawEvent::new("step", json!({"id": 7})),
                msg("e1", "ok"),
            ],
        )
        .await;
        let (mut controller, _rx) =
            ResumeController::new(Arc::new(api), "s", RecoverablePolicy::default());

        let outcome = controller.resume().await.unwrap();
        assert_eq!(outcome.quarantined, 2);
        assert_eq!(controller.session().events.len(), 1);
        let reasons: Vec<_> = controller.quarantined().map(|q| q.raw.event.clone()).collect();
        assert_eq!(reasons, vec!["heartbeat", "step"]);
    }

    #[tokio::test]
    async fn test_new_stream_makes_old_deliveries_stale() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![]).await;
        let (mut controller, mut rx) =
            ResumeController::new(Arc::new(api.clone()), "s", RecoverablePolicy::default());

        let first = controller.attach(ChatRequest::resume(None)).await.unwrap();
        let second = controller.attach(ChatRequest::resume(None)).await.unwrap();
        assert!(second > first);

        let stale = controller.handle(StreamDelivery {
            generation: first,
            item: StreamItem::Event(msg("x", "late")),
        });
        assert!(matches!(stale, Applied::Stale));
        assert!(controller.session().events.is_empty());

        api.emit("s", msg("e1", "fresh")).await;
        assert!(matches!(next_applied(&mut controller, &mut rx).await, Applied::Merged(_)));
        assert_eq!(controller.session().events.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_keeps_session() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![msg("e1", "one")]).await;
        let (mut controller, mut rx) =
            ResumeController::new(Arc::new(api.clone()), "s", RecoverablePolicy::default());
        controller.resume().await.unwrap();

        api.fail_streams("s", "connection reset").await;
        assert!(matches!(
            next_applied(&mut controller, &mut rx).await,
            Applied::StreamError(SessionError::Stream(_))
        ));
        assert!(!controller.is_streaming());
        assert_eq!(controller.session().events.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let api = MemorySessionApi::default();
        api.insert_session("s", SessionStatus::Running, vec![]).await;
        api.fail_next(ApiOp::GetSession, Failure::Status(500)).await;
        let (mut controller, _rx) =
            ResumeController::new(Arc::new(api), "s", RecoverablePolicy::default());

        assert!(controller.resume().await.unwrap_err().is_transient());
        assert!(!controller.is_streaming());
    }
}
