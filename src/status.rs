//! Session status state machine
//!
//! ```text
//! pending ──► running ──► waiting | completed
//!               │  ▲
//!               ▼  │
//!      takeover_pending ──► takeover
//! ```
//!
//! Streamed events move the session between running, waiting and completed.
//! Takeover operations move it through the controlled sub-path. Lease expiry
//! or conflict always returns control to the agent.

use crate::error::{Result, SessionError};
use crate::types::{ControlAction, EventKind, RejectDecision, SessionStatus};

/// Something that may change a session's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTrigger {
    /// A streamed, non-control event was merged
    Event(EventKind),
    /// The server announced a takeover lifecycle change
    Control(ControlAction),
    /// Local start request answered; `granted` when a lease was issued
    TakeoverStarted { granted: bool },
    /// Local end request succeeded
    TakeoverEnded,
    /// Pending request rejected with the caller's decision
    TakeoverRejected(RejectDecision),
    /// Lease expired, superseded, or renewal failed fatally
    LeaseInvalidated,
}

/// Compute the status that follows `trigger` when the session is `from`
///
/// Operator actions that are not valid from `from` fail with
/// `SessionError::InvalidTransition`; server-originated triggers never fail.
pub fn transition(from: SessionStatus, trigger: StatusTrigger) -> Result<SessionStatus> {
    use SessionStatus::*;

    let next = match trigger {
        StatusTrigger::Event(kind) => on_event(from, kind),
        StatusTrigger::Control(action) => on_control(from, action),
        StatusTrigger::TakeoverStarted { granted } => match from {
            Running | Waiting | TakeoverPending => {
                if granted {
                    Takeover
                } else {
                    TakeoverPending
                }
            }
            // repeated start while already in control is a no-op
            Takeover => Takeover,
            Pending | Completed => {
                return Err(SessionError::InvalidTransition {
                    from,
                    action: "start takeover",
                })
            }
        },
        StatusTrigger::TakeoverEnded => match from {
            Takeover => Running,
            _ => {
                return Err(SessionError::InvalidTransition {
                    from,
                    action: "end takeover",
                })
            }
        },
        StatusTrigger::TakeoverRejected(decision) => match from {
            TakeoverPending => match decision {
                RejectDecision::Continue => Running,
                RejectDecision::Terminate => Completed,
            },
            _ => {
                return Err(SessionError::InvalidTransition {
                    from,
                    action: "reject takeover",
                })
            }
        },
        StatusTrigger::LeaseInvalidated => {
            if from.is_controlled() {
                Running
            } else {
                from
            }
        }
    };
    Ok(next)
}

/// Whether the operator may request a takeover from `from`
pub fn can_start_takeover(from: SessionStatus) -> bool {
    transition(from, StatusTrigger::TakeoverStarted { granted: false }).is_ok()
}

fn on_event(from: SessionStatus, kind: EventKind) -> SessionStatus {
    use SessionStatus::*;

    match kind {
        EventKind::Done | EventKind::Error => Completed,
        // the agent going idle is what a pending takeover waits for
        EventKind::Wait if from.is_controlled() => from,
        EventKind::Wait => Waiting,
        // not scoped to this session's timeline
        EventKind::SessionsList => from,
        EventKind::Control => from,
        _ if from.is_controlled() => from,
        _ => Running,
    }
}

fn on_control(from: SessionStatus, action: ControlAction) -> SessionStatus {
    use SessionStatus::*;

    match action {
        ControlAction::Requested => match from {
            Completed | Pending => from,
            Takeover => Takeover,
            _ => TakeoverPending,
        },
        ControlAction::Started => Takeover,
        ControlAction::Renewed => from,
        ControlAction::Ended | ControlAction::Rejected | ControlAction::Expired => {
            if from.is_controlled() {
                Running
            } else {
                from
            }
        }
    }
}
