//! In-memory duplex connector
//!
//! Each successful `connect` hands the far end of a channel pair to the
//! owner of the connector, which then plays the server.

use super::frame::Frame;
use super::{DuplexConnector, DuplexLink, TransportTarget};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Server side of an in-memory link
pub struct MemoryPeer {
    pub target: TransportTarget,
    /// Frames to the client
    pub tx: mpsc::Sender<Frame>,
    /// Frames from the client
    pub rx: mpsc::Receiver<Frame>,
}

#[derive(Default)]
struct State {
    attempts: usize,
    fail_remaining: usize,
}

/// In-memory `DuplexConnector`
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    state: Arc<Mutex<State>>,
}

impl MemoryConnector {
    /// Create a connector and the receiver of its server-side peers
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                state: Arc::new(Mutex::new(State::default())),
            },
            rx,
        )
    }

    /// Refuse the next `n` connection attempts
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_remaining += n;
    }

    /// Connection attempts so far, failed ones included
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl DuplexConnector for MemoryConnector {
    async fn connect(&self, target: &TransportTarget) -> Result<DuplexLink> {
        {
            let mut state = self.state.lock().await;
            state.attempts += 1;
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(SessionError::Transport("connection refused".into()));
            }
        }

        let (client_tx, server_rx) = mpsc::channel(64);
        let (server_tx, client_rx) = mpsc::channel(64);
        self.peers
            .send(MemoryPeer {
                target: target.clone(),
                tx: server_tx,
                rx: server_rx,
            })
            .map_err(|_| SessionError::Transport("no peer listener".into()))?;

        Ok(DuplexLink {
            tx: client_tx,
            rx: client_rx,
        })
    }
}
