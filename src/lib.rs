//! # a3s-session
//!
//! Client-side state for remote agent sessions in the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-session` keeps a local, reconciled copy of a remote agent session fed
//! by a server-sent event stream, lets a human operator take over the agent's
//! shell or browser under a renewable lease, and carries terminal traffic over
//! a reconnecting duplex transport while control is held.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_session::{HttpSessionApi, SessionConfig, SessionHandle, TakeoverScope, WebSocketConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_session::Result<()> {
//! let config = SessionConfig::from_env()?;
//! let api = Arc::new(HttpSessionApi::new(config.clone())?);
//! let connector = Arc::new(WebSocketConnector::new(&config));
//!
//! let session = SessionHandle::spawn(api, connector, Arc::new(config), "session-id");
//! session.resume().await?;
//!
//! let outcome = session.start_takeover(TakeoverScope::Shell).await?;
//! if outcome.granted() {
//!     session.send_input("ls -la\n").await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **http**: REST + server-sent events over `reqwest`
//! - **memory**: Scripted in-process server for tests and local tooling
//!
//! ## Architecture
//!
//! - **Reconciler**: idempotent, key-addressed merge of streamed events
//! - **ResumeController**: fetch, rebase, and re-attach after a disconnect
//! - **LeaseProtocol** / **RenewalScheduler**: takeover lease lifecycle
//! - **TransportHandle**: reconnecting duplex terminal channel
//! - **SessionHandle**: per-session actor tying everything together

pub mod config;
pub mod error;
pub mod lease;
pub mod preview;
pub mod projection;
pub mod provider;
pub mod reconcile;
pub mod renewal;
pub mod resume;
pub mod session;
pub mod status;
pub mod transport;
pub mod types;

// Re-export core types
pub use config::{ErrorConfig, PreviewConfig, RenewalConfig, SessionConfig, TransportConfig};
pub use error::{ErrorClass, Result, SessionError};
pub use lease::{LeaseProtocol, LeaseValidity, RenewOutcome, StartOutcome};
pub use preview::{PreviewOutcome, PreviewPoller};
pub use projection::{plan_progress, workbench_timeline, PlanProgress, SessionView, WorkbenchSnapshot, WorkbenchTimeline};
pub use provider::{EventStream, SessionApi};
pub use reconcile::{merge, merge_logs, MergeOutcome, Reconciler, RecoverablePolicy, SemanticKey};
pub use renewal::{RenewalNotice, RenewalScheduler};
pub use resume::{ResumeController, ResumeOutcome};
pub use session::{SessionHandle, SessionRegistry, SessionUpdate};
pub use status::StatusTrigger;
pub use transport::{CloseReason, DuplexConnector, TerminalSize, TransportEvent, TransportHandle};
pub use types::{
    EventKind, HandoffMode, RawEvent, RejectDecision, Session, SessionEvent, SessionSnapshot,
    SessionStatus, TakeoverLease, TakeoverScope,
};

// Re-export providers for convenience
pub use provider::http::{HttpClient, HttpSessionApi};
pub use provider::memory::{MemoryConfig, MemorySessionApi};
pub use transport::{MemoryConnector, WebSocketConnector};
