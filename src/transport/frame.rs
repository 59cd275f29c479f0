//! Duplex wire frames
//!
//! Binary frames carry raw terminal bytes both ways. Text frames carry JSON
//! control messages tagged by `type`; inbound text that is not a control
//! message is treated as output.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Normal closure code; anything else counts as abnormal
pub const CLOSE_NORMAL: u16 = 1000;

/// Closure without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// One message on the duplex link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn normal_close(reason: impl Into<String>) -> Self {
        Frame::Close {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        }
    }
}

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Server verdict carried by a `status` control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Forbidden,
    LeaseExpired,
    Closed,
    #[serde(other)]
    Unknown,
}

/// JSON control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Outbound only
    Resize { cols: u16, rows: u16 },
    Status { state: StatusState },
    Error { message: String },
}

impl ControlFrame {
    pub fn resize(size: TerminalSize) -> Self {
        ControlFrame::Resize {
            cols: size.cols,
            rows: size.rows,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Output(Bytes),
    Control(ControlFrame),
    Close { code: u16, reason: String },
}

/// Classify an inbound frame
pub fn decode_inbound(frame: Frame) -> Inbound {
    match frame {
        Frame::Binary(bytes) => Inbound::Output(bytes),
        Frame::Text(text) => match serde_json::from_str::<ControlFrame>(&text) {
            Ok(control) => Inbound::Control(control),
            Err(_) => Inbound::Output(Bytes::from(text)),
        },
        Frame::Close { code, reason } => Inbound::Close { code, reason },
    }
}
