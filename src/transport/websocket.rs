//! WebSocket implementation of `DuplexConnector`

use super::frame::{Frame, CLOSE_NO_STATUS};
use super::{DuplexConnector, DuplexLink, TransportTarget};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const LINK_BUFFER: usize = 256;

/// Connects the interactive shell endpoint of a session over WebSocket
pub struct WebSocketConnector {
    ws_url: String,
    auth_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ws_url: config.resolved_ws_url(),
            auth_token: config.auth_token.clone(),
        }
    }

    /// Endpoint URL for a target
    pub fn url_for(&self, target: &TransportTarget) -> Result<url::Url> {
        let mut url = url::Url::parse(&format!(
            "{}/sessions/{}/takeover/shell",
            self.ws_url, target.session_id
        ))
        .map_err(|e| SessionError::Config(format!("invalid transport url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("takeover_id", &target.takeover_id);
        Ok(url)
    }
}

#[async_trait]
impl DuplexConnector for WebSocketConnector {
    async fn connect(&self, target: &TransportTarget) -> Result<DuplexLink> {
        let url = self.url_for(target)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Transport(format!("{}: {}", url, e)))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SessionError::Config(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SessionError::Transport(format!("{}: {}", url.path(), e)))?;

        tracing::info!(
            session_id = %target.session_id,
            takeover_id = %target.takeover_id,
            "Transport connected"
        );

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(LINK_BUFFER);

        // outbound pump; ends when the driver drops its sender or after a close
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let (message, closing) = match frame {
                    Frame::Binary(bytes) => (Message::Binary(bytes.to_vec()), false),
                    Frame::Text(text) => (Message::Text(text), false),
                    Frame::Close { code, reason } => (
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if ws_sender.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // inbound pump; dropping `in_tx` without a close frame signals an abnormal end
        tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                let frame = match message {
                    Ok(Message::Binary(data)) => Frame::Binary(Bytes::from(data)),
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Close(close)) => {
                        let (code, reason) = close
                            .map(|c| (u16::from(c.code), c.reason.into_owned()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        let _ = in_tx.send(Frame::Close { code, reason }).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "Transport read failed");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(DuplexLink {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
