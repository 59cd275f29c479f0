//! Per-session actor
//!
//! One task per remote session owns the reconciler, the takeover lease, the
//! renewal scheduler, the interactive transport and the preview poller.
//! Callers drive it through a cloneable [`SessionHandle`]; every state change
//! fans out as a [`SessionUpdate`] on a broadcast channel. Sessions share no
//! mutable state, so [`SessionRegistry`] simply keeps one actor per id.

use crate::config::SessionConfig;
use crate::error::{ErrorClass, Result, SessionError};
use crate::lease::{LeaseProtocol, LeaseRenewer, LeaseValidator, StartOutcome};
use crate::preview::{PreviewPoller, PreviewTask};
use crate::provider::SessionApi;
use crate::reconcile::MergeChange;
use crate::renewal::{RenewalNotice, RenewalScheduler};
use crate::resume::{Applied, ResumeController, ResumeOutcome, StreamDelivery};
use crate::status::{can_start_takeover, transition, StatusTrigger};
use crate::transport::{
    CloseReason, DuplexConnector, TerminalSize, TransportEvent, TransportHandle, TransportTarget,
};
use crate::types::{
    ChatRequest, ControlAction, HandoffMode, RejectDecision, Session, SessionEvent, SessionStatus,
    ShellView, TakeoverLease, TakeoverScope,
};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Capacity of the update broadcast channel
pub const UPDATE_CAPACITY: usize = 256;

const COMMAND_BUFFER: usize = 64;

/// Notification from a session actor
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Session state after a change
    State(Arc<Session>),
    /// The event stream failed; the session is intact
    StreamError(String),
    LeaseGranted(TakeoverLease),
    LeaseRenewed { period: Duration },
    /// Control returned to the agent without an explicit end
    LeaseInvalidated { reason: String },
    TransportOpened { attempt: u32 },
    TransportOutput(Bytes),
    TransportReconnecting { attempt: u32, delay: Duration },
    TransportClosed(CloseReason),
    ShellPreview(ShellView),
    Warning(String),
    Disposed,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Resume(Reply<ResumeOutcome>),
    SendMessage { message: String, reply: Reply<()> },
    StartTakeover { scope: TakeoverScope, reply: Reply<StartOutcome> },
    EndTakeover { mode: HandoffMode, reply: Reply<SessionStatus> },
    RejectTakeover { decision: RejectDecision, reply: Reply<SessionStatus> },
    SetVisible(bool),
    ResizeTerminal(TerminalSize),
    SendInput { bytes: Bytes, reply: Reply<()> },
    WatchShell(Option<String>),
    Dispose(oneshot::Sender<()>),
}

/// Handle to a running session actor
///
/// Cloning shares the same actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    state: watch::Receiver<Arc<Session>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Start the actor for `session_id`
    pub fn spawn(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn DuplexConnector>,
        config: Arc<SessionConfig>,
        session_id: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(Arc::new(Session::new(session_id.clone())));
        let (visible, _) = watch::channel(true);
        let cancel = CancellationToken::new();

        let (resume, deliveries) =
            ResumeController::new(api.clone(), session_id.clone(), config.errors.policy());

        let actor = SessionActor {
            session_id: session_id.clone(),
            lease: LeaseProtocol::new(api.clone(), session_id.clone()),
            preview: PreviewPoller::new(api, session_id.clone(), &config.preview),
            config,
            connector,
            resume,
            deliveries,
            visible,
            renewal: None,
            transport: None,
            terminal_size: TerminalSize::default(),
            watched_shell: None,
            polling: None,
            updates: updates.clone(),
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(commands_rx));

        Self {
            session_id,
            commands: commands_tx,
            updates,
            state: state_rx,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receive every update published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Updates as a stream; a lagging consumer skips what it missed
    pub fn updates(&self) -> impl Stream<Item = SessionUpdate> + Send + 'static {
        let session_id = self.session_id.clone();
        BroadcastStream::new(self.updates.subscribe()).filter_map(move |item| match item {
            Ok(update) => Some(update),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %session_id, skipped, "Update consumer lagged");
                None
            }
        })
    }

    /// Latest published session state
    pub fn snapshot(&self) -> Arc<Session> {
        self.state.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fetch the authoritative session, rebase, and re-attach the stream
    pub async fn resume(&self) -> Result<ResumeOutcome> {
        self.request(Command::Resume).await
    }

    pub async fn send_message(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.request(|reply| Command::SendMessage { message, reply })
            .await
    }

    pub async fn start_takeover(&self, scope: TakeoverScope) -> Result<StartOutcome> {
        self.request(|reply| Command::StartTakeover { scope, reply })
            .await
    }

    pub async fn end_takeover(&self, mode: HandoffMode) -> Result<SessionStatus> {
        self.request(|reply| Command::EndTakeover { mode, reply })
            .await
    }

    pub async fn reject_takeover(&self, decision: RejectDecision) -> Result<SessionStatus> {
        self.request(|reply| Command::RejectTakeover { decision, reply })
            .await
    }

    /// Whether the consumer can currently observe the session
    pub async fn set_visible(&self, visible: bool) -> Result<()> {
        self.send(Command::SetVisible(visible)).await
    }

    pub async fn resize_terminal(&self, size: TerminalSize) -> Result<()> {
        self.send(Command::ResizeTerminal(size)).await
    }

    /// Forward terminal input; fails unless a shell transport is open
    pub async fn send_input(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let bytes = bytes.into();
        self.request(|reply| Command::SendInput { bytes, reply })
            .await
    }

    /// Poll a shell sub-session while the agent is running; `None` stops
    pub async fn watch_shell(&self, shell_session_id: Option<String>) -> Result<()> {
        self.send(Command::WatchShell(shell_session_id)).await
    }

    /// Stop the actor and everything it owns; idempotent
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Cancelled)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| SessionError::Cancelled)?
    }
}

struct Polling {
    shell_session_id: String,
    task: PreviewTask,
    views: mpsc::UnboundedReceiver<Result<ShellView>>,
}

struct SessionActor {
    session_id: String,
    config: Arc<SessionConfig>,
    connector: Arc<dyn DuplexConnector>,
    resume: ResumeController,
    deliveries: mpsc::UnboundedReceiver<StreamDelivery>,
    lease: LeaseProtocol,
    visible: watch::Sender<bool>,
    // each owned task comes with its own receiver; replacing the pair drops
    // whatever the old task still had queued
    renewal: Option<(RenewalScheduler, mpsc::UnboundedReceiver<RenewalNotice>)>,
    transport: Option<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>)>,
    terminal_size: TerminalSize,
    preview: PreviewPoller,
    watched_shell: Option<String>,
    polling: Option<Polling>,
    updates: broadcast::Sender<SessionUpdate>,
    state: watch::Sender<Arc<Session>>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!(session_id = %self.session_id, "Session actor started");

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Dispose(done)) => {
                        self.teardown();
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                delivery = self.deliveries.recv() => match delivery {
                    Some(delivery) => self.on_delivery(delivery).await,
                    None => break,
                },
                notice = recv_from(self.renewal.as_mut().map(|(_, rx)| rx)) => match notice {
                    Some(notice) => self.on_renewal(notice).await,
                    None => self.renewal = None,
                },
                event = recv_from(self.transport.as_mut().map(|(_, rx)| rx)) => match event {
                    Some(event) => self.on_transport(event).await,
                    None => self.transport = None,
                },
                view = recv_from(self.polling.as_mut().map(|p| &mut p.views)) => match view {
                    Some(Ok(view)) => self.publish(SessionUpdate::ShellPreview(view)),
                    Some(Err(e)) => self.publish(SessionUpdate::Warning(format!("shell preview failed: {}", e))),
                    None => self.polling = None,
                },
            }
        }

        self.teardown();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Resume(reply) => {
                let result = self.resume.resume().await;
                if result.is_ok() {
                    let announced = latest_announced_lease(self.resume.reconciler().events());
                    self.sync_takeover(announced).await;
                }
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::SendMessage { message, reply } => {
                let result = self.resume.send_message(message).await.map(|_| ());
                let _ = reply.send(result);
            }
            Command::StartTakeover { scope, reply } => {
                let result = self.start_takeover(scope).await;
                let _ = reply.send(result);
            }
            Command::EndTakeover { mode, reply } => {
                let result = self.end_takeover(mode).await;
                let _ = reply.send(result);
            }
            Command::RejectTakeover { decision, reply } => {
                let result = self.reject_takeover(decision).await;
                let _ = reply.send(result);
            }
            Command::SetVisible(visible) => {
                self.visible.send_replace(visible);
            }
            Command::ResizeTerminal(size) => {
                self.terminal_size = size;
                if let Some((transport, _)) = &self.transport {
                    transport.resize(size);
                }
            }
            Command::SendInput { bytes, reply } => {
                let transport = self.transport.as_ref().map(|(t, _)| t);
                let result = match transport {
                    Some(transport) => transport.send_input(bytes).await,
                    None => Err(SessionError::NoLease(self.session_id.clone())),
                };
                let _ = reply.send(result);
            }
            Command::WatchShell(shell_session_id) => {
                self.watched_shell = shell_session_id;
                self.sync_preview();
            }
            // handled by the run loop
            Command::Dispose(_) => {}
        }
    }

    async fn start_takeover(&mut self, scope: TakeoverScope) -> Result<StartOutcome> {
        let status = self.resume.reconciler().status();
        if !can_start_takeover(status) {
            return Err(SessionError::InvalidTransition {
                from: status,
                action: "start takeover",
            });
        }

        let already_active = status == SessionStatus::Takeover && self.renewal.is_some();
        let outcome = self.lease.start(scope).await?;
        self.resume
            .reconciler_mut()
            .transition(StatusTrigger::TakeoverStarted {
                granted: outcome.granted(),
            })?;

        if let Some(lease) = &outcome.lease {
            if !already_active {
                self.activate(lease.clone());
            }
        }
        self.publish_state();
        self.sync_preview();
        Ok(outcome)
    }

    async fn end_takeover(&mut self, mode: HandoffMode) -> Result<SessionStatus> {
        let status = self.resume.reconciler().status();
        transition(status, StatusTrigger::TakeoverEnded)?;

        self.stop_takeover_tasks(false);
        match self.lease.end(mode).await {
            Ok(response) => {
                self.resume.reconciler_mut().set_status(response.status);
                self.after_handback().await;
                Ok(response.status)
            }
            Err(e) => {
                // the local lease is gone either way
                let _ = self
                    .resume
                    .reconciler_mut()
                    .transition(StatusTrigger::LeaseInvalidated);
                self.publish_state();
                self.sync_preview();
                Err(e)
            }
        }
    }

    async fn reject_takeover(&mut self, decision: RejectDecision) -> Result<SessionStatus> {
        let status = self.resume.reconciler().status();
        transition(status, StatusTrigger::TakeoverRejected(decision))?;

        let response = self.lease.reject(decision).await?;
        self.resume.reconciler_mut().set_status(response.status);
        self.after_handback().await;
        Ok(response.status)
    }

    /// Control is back with the agent; make sure its events reach us
    async fn after_handback(&mut self) {
        if self.resume.reconciler().status().is_active() && !self.resume.is_streaming() {
            let after = self.resume.reconciler().last_event_id().map(str::to_string);
            if let Err(e) = self.resume.attach(ChatRequest::resume(after)).await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Stream re-attach failed");
                self.publish(SessionUpdate::StreamError(e.to_string()));
            }
        }
        self.publish_state();
        self.sync_preview();
    }

    async fn on_delivery(&mut self, delivery: StreamDelivery) {
        match self.resume.handle(delivery) {
            Applied::Stale | Applied::Quarantined | Applied::StreamEnded => {}
            Applied::StreamError(e) => self.publish(SessionUpdate::StreamError(e.to_string())),
            Applied::Merged(outcome) => {
                let announced = match outcome.change {
                    MergeChange::Appended(pos) | MergeChange::Replaced(pos) => self
                        .resume
                        .reconciler()
                        .events()
                        .get(pos)
                        .and_then(announced_lease),
                    _ => None,
                };
                if outcome.is_change() {
                    self.publish_state();
                }
                if announced.is_some() || outcome.previous_status != outcome.status {
                    self.sync_takeover(announced).await;
                    self.sync_preview();
                }
            }
        }
    }

    /// Align the owned lease machinery with the reconciled status
    async fn sync_takeover(&mut self, announced: Option<TakeoverLease>) {
        let status = self.resume.reconciler().status();
        if status == SessionStatus::Takeover {
            let held = self.lease.current().await;
            match announced {
                Some(lease) => {
                    let same = held.as_ref().map(|h| h.takeover_id == lease.takeover_id);
                    self.lease.observe(lease.clone()).await;
                    if same != Some(true) || self.renewal.is_none() {
                        self.activate(lease);
                    }
                }
                None => {
                    if let (Some(lease), true) = (held, self.renewal.is_none()) {
                        self.activate(lease);
                    }
                }
            }
        } else if self.renewal.is_some() || self.transport.is_some() {
            self.release(format!("session is {}", status)).await;
        }
    }

    fn activate(&mut self, lease: TakeoverLease) {
        self.stop_takeover_tasks(false);

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let renewer: Arc<dyn LeaseRenewer> = Arc::new(self.lease.clone());
        let scheduler = RenewalScheduler::spawn(
            renewer,
            lease.ttl(),
            self.config.renewal.clone(),
            self.visible.subscribe(),
            notices_tx,
        );
        self.renewal = Some((scheduler, notices_rx));

        if lease.scope == TakeoverScope::Shell {
            let validator: Arc<dyn LeaseValidator> = Arc::new(self.lease.clone());
            let target = TransportTarget {
                session_id: self.session_id.clone(),
                takeover_id: lease.takeover_id.clone(),
            };
            self.transport = Some(TransportHandle::spawn(
                self.connector.clone(),
                validator,
                target,
                self.terminal_size,
                self.config.transport.clone(),
            ));
        }

        tracing::info!(
            session_id = %self.session_id,
            takeover_id = %lease.takeover_id,
            scope = %lease.scope,
            "Takeover active"
        );
        self.stop_polling();
        self.publish(SessionUpdate::LeaseGranted(lease));
    }

    /// Stop renewal and close the transport
    fn stop_takeover_tasks(&mut self, lease_lost: bool) {
        if let Some((mut scheduler, _)) = self.renewal.take() {
            scheduler.stop();
        }
        if let Some((transport, _)) = self.transport.take() {
            if lease_lost {
                transport.invalidate();
            } else {
                transport.close();
            }
        }
    }

    /// The lease is gone; return control to the agent
    async fn release(&mut self, reason: String) {
        self.stop_takeover_tasks(true);
        self.lease.invalidate().await;
        let _ = self
            .resume
            .reconciler_mut()
            .transition(StatusTrigger::LeaseInvalidated);

        tracing::info!(session_id = %self.session_id, %reason, "Takeover released");
        self.publish(SessionUpdate::LeaseInvalidated { reason });
        self.publish_state();
        self.sync_preview();
    }

    async fn on_renewal(&mut self, notice: RenewalNotice) {
        match notice {
            RenewalNotice::Renewed { period } => {
                self.publish(SessionUpdate::LeaseRenewed { period });
            }
            RenewalNotice::Failed(e) => {
                self.publish(SessionUpdate::Warning(format!("lease renewal failed: {}", e)));
            }
            RenewalNotice::Stopped(e) => {
                self.renewal = None;
                let refused = matches!(e.class(), ErrorClass::Conflict | ErrorClass::Client);
                self.release(e.to_string()).await;
                if refused {
                    self.refresh().await;
                }
            }
        }
    }

    /// Re-read the session after the server contradicted local lease state
    async fn refresh(&mut self) {
        match self.resume.resume().await {
            Ok(outcome) => {
                tracing::info!(
                    session_id = %self.session_id,
                    status = %outcome.status,
                    "Session refreshed after lease loss"
                );
                let announced = latest_announced_lease(self.resume.reconciler().events());
                self.sync_takeover(announced).await;
                self.publish_state();
                self.sync_preview();
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Session refresh failed");
                self.publish(SessionUpdate::StreamError(e.to_string()));
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { attempt } => {
                self.publish(SessionUpdate::TransportOpened { attempt });
            }
            TransportEvent::Output(bytes) => {
                self.publish(SessionUpdate::TransportOutput(bytes));
            }
            TransportEvent::Warning(message) => {
                self.publish(SessionUpdate::Warning(message));
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.publish(SessionUpdate::TransportReconnecting { attempt, delay });
            }
            TransportEvent::Closed(reason) => {
                self.transport = None;
                self.publish(SessionUpdate::TransportClosed(reason));
                if reason.loses_lease() {
                    self.release(format!("transport closed: {:?}", reason)).await;
                }
            }
        }
    }

    fn sync_preview(&mut self) {
        let wanted = self
            .watched_shell
            .clone()
            .filter(|_| self.resume.reconciler().status() == SessionStatus::Running);

        match wanted {
            Some(shell_session_id) => {
                let running = self
                    .polling
                    .as_ref()
                    .is_some_and(|p| p.shell_session_id == shell_session_id);
                if !running {
                    let (tx, views) = mpsc::unbounded_channel();
                    let task = self.preview.poll(shell_session_id.clone(), tx);
                    self.polling = Some(Polling {
                        shell_session_id,
                        task,
                        views,
                    });
                }
            }
            None => self.stop_polling(),
        }
    }

    fn stop_polling(&mut self) {
        if let Some(mut polling) = self.polling.take() {
            polling.task.stop();
        }
    }

    fn teardown(&mut self) {
        self.stop_polling();
        self.stop_takeover_tasks(false);
        self.resume.dispose_stream();
        self.cancel.cancel();
        self.publish(SessionUpdate::Disposed);
        tracing::info!(session_id = %self.session_id, "Session disposed");
    }

    fn publish_state(&mut self) {
        let snapshot = Arc::new(self.resume.session().clone());
        self.state.send_replace(snapshot.clone());
        self.publish(SessionUpdate::State(snapshot));
    }

    fn publish(&self, update: SessionUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }
}

async fn recv_from<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Lease carried by a `control` event that grants or renews control
fn announced_lease(event: &SessionEvent) -> Option<TakeoverLease> {
    let SessionEvent::Control(control) = event else {
        return None;
    };
    if !matches!(control.action, ControlAction::Started | ControlAction::Renewed) {
        return None;
    }
    let lease = TakeoverLease {
        takeover_id: control.takeover_id.clone()?,
        scope: control.scope.unwrap_or(TakeoverScope::Shell),
        expires_at: control.expires_at?,
    };
    (!lease.is_expired_at(Utc::now())).then_some(lease)
}

/// Lease announced by the most recent `control` event of a log
fn latest_announced_lease(events: &[SessionEvent]) -> Option<TakeoverLease> {
    events
        .iter()
        .rev()
        .find(|e| matches!(e, SessionEvent::Control(_)))
        .and_then(announced_lease)
}

/// Independent session actors keyed by session id
pub struct SessionRegistry {
    api: Arc<dyn SessionApi>,
    connector: Arc<dyn DuplexConnector>,
    config: Arc<SessionConfig>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn DuplexConnector>,
        config: SessionConfig,
    ) -> Self {
        Self {
            api,
            connector,
            config: Arc::new(config),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Existing actor for `session_id`, or a new one
    pub async fn get_or_spawn(&self, session_id: &str) -> SessionHandle {
        if let Some(handle) = self.get(session_id).await {
            return handle;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_id).filter(|h| !h.is_disposed()) {
            return handle.clone();
        }
        let handle = SessionHandle::spawn(
            self.api.clone(),
            self.connector.clone(),
            self.config.clone(),
            session_id,
        );
        sessions.insert(session_id.to_string(), handle.clone());
        tracing::debug!(session_id, "Session registered");
        handle
    }

    /// Live actor for `session_id`
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .filter(|h| !h.is_disposed())
            .cloned()
    }

    /// Dispose and forget the actor for `session_id`
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(handle) => {
                handle.dispose().await;
                true
            }
            None => false,
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Dispose every actor
    pub async fn dispose_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.dispose().await;
        }
    }
}
