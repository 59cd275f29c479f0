//! Interactive transport adapter
//!
//! A reconnecting duplex channel carrying terminal input and output while a
//! shell lease is held. On every open the current terminal size is sent;
//! later size changes are debounced. Abnormal closes are retried on a fixed
//! back-off, and the lease is re-validated before each attempt.

pub mod frame;
pub mod memory;
pub mod websocket;

pub use frame::{ControlFrame, Frame, Inbound, StatusState, TerminalSize};
pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

use crate::config::TransportConfig;
use crate::error::{Result, SessionError};
use crate::lease::{LeaseValidator, LeaseValidity};
use async_trait::async_trait;
use bytes::Bytes;
use frame::{decode_inbound, CLOSE_NORMAL};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which interactive endpoint to attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    pub session_id: String,
    pub takeover_id: String,
}

/// An open duplex link; dropping `rx` without a close frame is an abnormal end
pub struct DuplexLink {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// Opens duplex links
#[async_trait]
pub trait DuplexConnector: Send + Sync {
    async fn connect(&self, target: &TransportTarget) -> Result<DuplexLink>;
}

/// Why the transport ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Server refused control (`status: forbidden`)
    Forbidden,
    /// Server reported the lease expired
    LeaseExpired,
    /// Server closed the session normally
    ServerClosed,
    /// Closed by the owner
    Cancelled,
    /// Lease found gone during re-validation, or invalidated by the owner
    Invalidated,
    /// Every back-off step failed
    RetriesExhausted,
}

impl CloseReason {
    /// Whether this close means control is no longer held
    pub fn loses_lease(&self) -> bool {
        matches!(
            self,
            CloseReason::Forbidden | CloseReason::LeaseExpired | CloseReason::Invalidated
        )
    }
}

/// Notifications from the transport task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened { attempt: u32 },
    Output(Bytes),
    /// Non-fatal server message
    Warning(String),
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

/// Owner side of a running transport
///
/// Dropping the handle closes the transport.
pub struct TransportHandle {
    input: mpsc::Sender<Bytes>,
    size: watch::Sender<TerminalSize>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Start the transport task
    pub fn spawn(
        connector: Arc<dyn DuplexConnector>,
        validator: Arc<dyn LeaseValidator>,
        target: TransportTarget,
        size: TerminalSize,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (input_tx, input_rx) = mpsc::channel(config.input_buffer.max(1));
        let (size_tx, size_rx) = watch::channel(size);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());

        let driver = Driver {
            connector,
            validator,
            target,
            config,
            input: input_rx,
            size: size_rx,
            events: events_tx,
            cancel: cancel.clone(),
            reason: reason.clone(),
        };
        let task = tokio::spawn(driver.run());

        (
            Self {
                input: input_tx,
                size: size_tx,
                cancel,
                reason,
                task,
            },
            events_rx,
        )
    }

    /// Forward input bytes verbatim
    pub async fn send_input(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.input
            .send(bytes.into())
            .await
            .map_err(|_| SessionError::Transport("transport closed".into()))
    }

    /// Record a new terminal size; sent after the debounce window
    pub fn resize(&self, size: TerminalSize) {
        self.size.send_if_modified(|current| {
            if *current == size {
                false
            } else {
                *current = size;
                true
            }
        });
    }

    /// Close the transport; idempotent
    pub fn close(&self) {
        self.close_with(CloseReason::Cancelled);
    }

    /// Close because the lease is gone
    pub fn invalidate(&self) {
        self.close_with(CloseReason::Invalidated);
    }

    fn close_with(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.task.is_finished()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        // the task sends a close frame and exits on its own
        self.cancel.cancel();
    }
}

enum LinkEnd {
    Abnormal,
    Closed(CloseReason),
}

struct Driver {
    connector: Arc<dyn DuplexConnector>,
    validator: Arc<dyn LeaseValidator>,
    target: TransportTarget,
    config: TransportConfig,
    input: mpsc::Receiver<Bytes>,
    size: watch::Receiver<TerminalSize>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Driver {
    async fn run(mut self) {
        let reason = self.drive().await;
        tracing::info!(
            session_id = %self.target.session_id,
            takeover_id = %self.target.takeover_id,
            ?reason,
            "Transport closed"
        );
        let _ = self.events.send(TransportEvent::Closed(reason));
    }

    fn cancel_reason(&self) -> CloseReason {
        self.reason.get().copied().unwrap_or(CloseReason::Cancelled)
    }

    async fn drive(&mut self) -> CloseReason {
        let backoff = self.config.backoff();
        let mut failures = 0usize;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancel_reason(),
                link = self.connector.connect(&self.target) => link,
            };

            match connected {
                Ok(link) => {
                    failures = 0;
                    let _ = self.events.send(TransportEvent::Opened { attempt });
                    match self.serve(link).await {
                        LinkEnd::Closed(reason) => return reason,
                        LinkEnd::Abnormal => {
                            tracing::warn!(
                                session_id = %self.target.session_id,
                                "Transport closed abnormally"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.target.session_id,
                        attempt,
                        error = %e,
                        "Transport connect failed"
                    );
                }
            }

            let Some(&delay) = backoff.get(failures) else {
                return CloseReason::RetriesExhausted;
            };
            failures += 1;

            let _ = self.events.send(TransportEvent::Reconnecting {
                attempt: failures as u32,
                delay,
            });
            tracing::info!(
                session_id = %self.target.session_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Transport reconnecting"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancel_reason(),
                _ = tokio::time::sleep(delay) => {}
            }

            let validity = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancel_reason(),
                v = self.validator.validate() => v,
            };
            if validity == LeaseValidity::Invalid {
                return CloseReason::Invalidated;
            }
        }
    }

    /// Pump one open link until it ends
    async fn serve(&mut self, mut link: DuplexLink) -> LinkEnd {
        let debounce = self.config.resize_debounce();
        let size = *self.size.borrow_and_update();
        if !self.send_resize(&link, size).await {
            return LinkEnd::Abnormal;
        }

        let mut resize_at: Option<Instant> = None;
        let mut size_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = link.tx.send(Frame::normal_close("client closed")).await;
                    return LinkEnd::Closed(self.cancel_reason());
                }
                frame = link.rx.recv() => {
                    let Some(frame) = frame else {
                        return LinkEnd::Abnormal;
                    };
                    match decode_inbound(frame) {
                        Inbound::Output(bytes) => {
                            let _ = self.events.send(TransportEvent::Output(bytes));
                        }
                        Inbound::Control(ControlFrame::Status { state }) => {
                            let reason = match state {
                                StatusState::Forbidden => CloseReason::Forbidden,
                                StatusState::LeaseExpired => CloseReason::LeaseExpired,
                                StatusState::Closed | StatusState::Unknown => CloseReason::ServerClosed,
                            };
                            let _ = link.tx.send(Frame::normal_close("status")).await;
                            return LinkEnd::Closed(reason);
                        }
                        Inbound::Control(ControlFrame::Error { message }) => {
                            tracing::warn!(session_id = %self.target.session_id, %message, "Transport warning");
                            let _ = self.events.send(TransportEvent::Warning(message));
                        }
                        Inbound::Control(ControlFrame::Resize { .. }) => {
                            tracing::debug!("Ignoring inbound resize frame");
                        }
                        Inbound::Close { code, reason } => {
                            tracing::debug!(code, %reason, "Transport close frame");
                            return if code == CLOSE_NORMAL {
                                LinkEnd::Closed(CloseReason::ServerClosed)
                            } else {
                                LinkEnd::Abnormal
                            };
                        }
                    }
                }
                input = self.input.recv() => {
                    let Some(bytes) = input else {
                        // owner dropped the handle
                        let _ = link.tx.send(Frame::normal_close("client closed")).await;
                        return LinkEnd::Closed(CloseReason::Cancelled);
                    };
                    if link.tx.send(Frame::Binary(bytes)).await.is_err() {
                        return LinkEnd::Abnormal;
                    }
                }
                changed = self.size.changed(), if size_open => {
                    if changed.is_err() {
                        size_open = false;
                    } else {
                        resize_at = Some(Instant::now() + debounce);
                    }
                }
                _ = tokio::time::sleep_until(resize_at.unwrap_or_else(Instant::now)), if resize_at.is_some() => {
                    resize_at = None;
                    let size = *self.size.borrow_and_update();
                    if !self.send_resize(&link, size).await {
                        return LinkEnd::Abnormal;
                    }
                }
            }
        }
    }

    async fn send_resize(&self, link: &DuplexLink, size: TerminalSize) -> bool {
        let frame = match ControlFrame::resize(size).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode resize frame");
                return true;
            }
        };
        tracing::debug!(cols = size.cols, rows = size.rows, "Resize sent");
        link.tx.send(frame).await.is_ok()
    }
}
