//! Stream reconciliation: merge typed events into one canonical session
//!
//! The event log holds the current snapshot per semantic slot, not raw
//! deltas. Each incoming event is keyed by [`SemanticKey`]; an event whose
//! key is already present replaces that entry in place, which makes merges
//! idempotent and safe to replay after a reconnect.
//!
//! The [`Reconciler`] keeps a key → position index next to the log so
//! replacement, step→plan patching, and resume merges never rescan the log.

use crate::status::{transition, StatusTrigger};
use crate::types::{ErrorEvent, MessageRole, Session, SessionEvent, SessionStatus, StepStatus};
use std::collections::HashMap;

/// Upstream failure phrases a legacy server emits for errors the agent retries
pub const DEFAULT_RECOVERABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "overloaded",
    "timed out",
    "temporarily unavailable",
    "connection reset",
    "retrying",
];

/// Identity used to decide replace-vs-append
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SemanticKey {
    /// Streamed message snapshots share their stream id
    Stream(String),
    /// Tool call lifecycle (`calling` → `called`)
    ToolCall(String),
    /// Plan step progress
    Step(String),
    /// Only the latest plan survives
    Plan,
    /// Server-assigned event id
    Event(String),
    /// Unkeyed event; unique per append
    Positional(u64),
}

impl SemanticKey {
    /// Derive the key of an event, `None` when it must be appended uniquely
    pub fn of(event: &SessionEvent) -> Option<SemanticKey> {
        match event {
            SessionEvent::Message(m) => m
                .stream_id
                .clone()
                .map(SemanticKey::Stream)
                .or_else(|| m.meta.event_id.clone().map(SemanticKey::Event)),
            SessionEvent::Tool(t) => Some(SemanticKey::ToolCall(t.tool_call_id.clone())),
            SessionEvent::Step(s) => Some(SemanticKey::Step(s.id.clone())),
            SessionEvent::Plan(_) => Some(SemanticKey::Plan),
            other => other.event_id().map(|id| SemanticKey::Event(id.to_string())),
        }
    }
}

/// Decides whether an error event is a retried-and-recovered upstream failure
#[derive(Debug, Clone)]
pub struct RecoverablePolicy {
    patterns: Vec<String>,
}

impl RecoverablePolicy {
    /// Fall back to case-insensitive substring matching when the flag is absent
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Only the explicit `recoverable` flag counts
    pub fn strict() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn is_recoverable(&self, error: &ErrorEvent) -> bool {
        if let Some(flag) = error.recoverable {
            return flag;
        }
        let text = error.error.to_lowercase();
        self.patterns.iter().any(|p| text.contains(p.as_str()))
    }
}

impl Default for RecoverablePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERABLE_PATTERNS)
    }
}

/// What a single merge did to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeChange {
    /// New slot at this position
    Appended(usize),
    /// Existing slot at this position now holds the incoming event
    Replaced(usize),
    /// Identical event already occupies the slot
    Unchanged(usize),
    /// Title metadata updated; the log is untouched
    TitleUpdated,
}

/// Result of [`Reconciler::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub change: MergeChange,
    /// Recovered error entries removed by this merge
    pub pruned: usize,
    /// A step event updated the matching step of the latest plan
    pub plan_patched: bool,
    pub previous_status: SessionStatus,
    pub status: SessionStatus,
    /// The live stream should close after this event
    pub closes_stream: bool,
}

impl MergeOutcome {
    /// Whether observers need to re-read the session
    pub fn is_change(&self) -> bool {
        !matches!(self.change, MergeChange::Unchanged(_))
            || self.pruned > 0
            || self.previous_status != self.status
    }
}

/// Owner of the canonical session; the only writer of its event log
#[derive(Debug, Clone)]
pub struct Reconciler {
    session: Session,
    /// Parallel to `session.events`
    keys: Vec<SemanticKey>,
    index: HashMap<SemanticKey, usize>,
    next_positional: u64,
    policy: RecoverablePolicy,
    last_event_id: Option<String>,
}

impl Reconciler {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_policy(session_id, RecoverablePolicy::default())
    }

    pub fn with_policy(session_id: impl Into<String>, policy: RecoverablePolicy) -> Self {
        Self {
            session: Session::new(session_id),
            keys: Vec::new(),
            index: HashMap::new(),
            next_positional: 0,
            policy,
            last_event_id: None,
        }
    }

    /// Build a reconciler by replaying an existing log in order
    pub fn from_events<I>(session_id: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = SessionEvent>,
    {
        let mut reconciler = Self::new(session_id);
        for event in events {
            reconciler.apply(event);
        }
        reconciler
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.session.events
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn title(&self) -> Option<&str> {
        self.session.title.as_deref()
    }

    pub fn policy(&self) -> &RecoverablePolicy {
        &self.policy
    }

    /// Id of the most recently merged event that carried one
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn position_of(&self, key: &SemanticKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn contains_key(&self, key: &SemanticKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Merge one streamed event and apply its status effect
    pub fn apply(&mut self, event: SessionEvent) -> MergeOutcome {
        let previous_status = self.session.status;
        let kind = event.kind();
        let trigger = match &event {
            SessionEvent::Control(c) => StatusTrigger::Control(c.action),
            _ => StatusTrigger::Event(kind),
        };

        let (change, pruned, plan_patched) = self.merge_event(event);

        // streamed triggers never fail
        self.session.status = transition(previous_status, trigger).unwrap_or(previous_status);

        let outcome = MergeOutcome {
            change,
            pruned,
            plan_patched,
            previous_status,
            status: self.session.status,
            closes_stream: kind.is_terminal(),
        };

        tracing::debug!(
            session_id = %self.session.session_id,
            event = %kind,
            change = ?outcome.change,
            pruned = outcome.pruned,
            status = %outcome.status,
            "Event merged"
        );

        outcome
    }

    /// Apply a status trigger that originates from a local operation
    pub fn transition(&mut self, trigger: StatusTrigger) -> crate::Result<SessionStatus> {
        let next = transition(self.session.status, trigger)?;
        if next != self.session.status {
            tracing::info!(
                session_id = %self.session.session_id,
                from = %self.session.status,
                to = %next,
                trigger = ?trigger,
                "Session status changed"
            );
        }
        self.session.status = next;
        Ok(next)
    }

    /// Adopt a status asserted by the server
    pub fn set_status(&mut self, status: SessionStatus) {
        self.session.status = status;
    }

    pub fn set_title(&mut self, title: Option<String>) {
        self.session.title = title;
    }

    /// Replace the log with an authoritative remote log, keeping local-only events
    ///
    /// The remote log is replayed first in its own order; each local event
    /// whose slot the remote does not know is then merged on top by key.
    /// Remote status and title win.
    pub fn rebase(
        &mut self,
        remote: Vec<SessionEvent>,
        status: SessionStatus,
        title: Option<String>,
    ) -> usize {
        let local = std::mem::take(&mut self.session.events);
        let session_id = self.session.session_id.clone();

        let mut rebased = Self::with_policy(session_id, self.policy.clone());
        for event in remote {
            rebased.merge_event(event);
        }
        let kept = rebased.merge_local(local);

        rebased.session.status = status;
        rebased.session.title = title
            .or_else(|| rebased.session.title.take())
            .or_else(|| self.session.title.take());
        if rebased.last_event_id.is_none() {
            rebased.last_event_id = self.last_event_id.take();
        }
        *self = rebased;
        kept
    }

    /// Merge local-only events on top of the current log, returning how many were kept
    fn merge_local(&mut self, local: Vec<SessionEvent>) -> usize {
        let mut kept = 0;
        for event in local {
            let known = match SemanticKey::of(&event) {
                Some(key) => self.index.contains_key(&key),
                None => self.session.events.contains(&event),
            };
            if !known {
                self.merge_event(event);
                kept += 1;
            }
        }
        kept
    }

    /// Log-only merge: slot replacement, title, step→plan sync, pruning
    fn merge_event(&mut self, event: SessionEvent) -> (MergeChange, usize, bool) {
        let event_id = event.event_id().map(str::to_string);

        if let SessionEvent::Title(title) = event {
            self.session.title = Some(title.title);
            if event_id.is_some() {
                self.last_event_id = event_id;
            }
            return (MergeChange::TitleUpdated, 0, false);
        }

        let key = SemanticKey::of(&event).unwrap_or_else(|| {
            self.next_positional += 1;
            SemanticKey::Positional(self.next_positional)
        });

        let step = match &event {
            SessionEvent::Step(step) => Some((step.id.clone(), step.description.clone(), step.status)),
            _ => None,
        };

        let change = match self.index.get(&key).copied() {
            Some(pos) if self.session.events[pos] == event => MergeChange::Unchanged(pos),
            Some(pos) => {
                self.session.events[pos] = event;
                MergeChange::Replaced(pos)
            }
            None => {
                let pos = self.session.events.len();
                self.session.events.push(event);
                self.keys.push(key.clone());
                self.index.insert(key, pos);
                MergeChange::Appended(pos)
            }
        };

        // a replayed duplicate must not move the resume position backwards
        if event_id.is_some() && !matches!(change, MergeChange::Unchanged(_)) {
            self.last_event_id = event_id;
        }

        let plan_patched = match step {
            Some((id, description, status)) => self.patch_plan(&id, &description, status),
            None => false,
        };

        let pruned = if matches!(change, MergeChange::Unchanged(_)) {
            0
        } else {
            self.prune_recovered()
        };

        (change, pruned, plan_patched)
    }

    /// Update the matching step of the latest plan in place
    fn patch_plan(&mut self, step_id: &str, description: &str, status: StepStatus) -> bool {
        let Some(pos) = self.index.get(&SemanticKey::Plan).copied() else {
            return false;
        };
        let SessionEvent::Plan(plan) = &mut self.session.events[pos] else {
            return false;
        };
        let Some(step) = plan.steps.iter_mut().find(|s| s.id == step_id) else {
            return false;
        };
        if step.status == status && step.description == description {
            return false;
        }
        step.status = status;
        if !description.is_empty() {
            step.description = description.to_string();
        }
        true
    }

    /// Remove recoverable errors that are followed by real progress
    fn prune_recovered(&mut self) -> usize {
        let mut progress_after = false;
        let mut doomed = Vec::new();

        for (pos, event) in self.session.events.iter().enumerate().rev() {
            match event {
                SessionEvent::Error(err) => {
                    if progress_after && self.policy.is_recoverable(err) {
                        doomed.push(pos);
                    }
                }
                other if is_progress(other) => progress_after = true,
                _ => {}
            }
        }

        if doomed.is_empty() {
            return 0;
        }

        // descending, so earlier positions stay valid
        for pos in &doomed {
            self.session.events.remove(*pos);
            self.keys.remove(*pos);
        }
        self.index = self
            .keys
            .iter()
            .enumerate()
            .map(|(pos, key)| (key.clone(), pos))
            .collect();

        tracing::debug!(
            session_id = %self.session.session_id,
            count = doomed.len(),
            "Pruned recovered errors"
        );
        doomed.len()
    }
}

/// Whether an event shows the agent made real progress
fn is_progress(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Message(m) => m.role == MessageRole::Assistant,
        SessionEvent::Plan(_)
        | SessionEvent::Step(_)
        | SessionEvent::Tool(_)
        | SessionEvent::Control(_) => true,
        SessionEvent::Title(_)
        | SessionEvent::Wait(_)
        | SessionEvent::Done(_)
        | SessionEvent::Error(_)
        | SessionEvent::SessionsList(_) => false,
    }
}

/// Merge one event into a log, returning the new log
pub fn merge(log: Vec<SessionEvent>, event: SessionEvent) -> Vec<SessionEvent> {
    let mut reconciler = Reconciler::from_events("", log);
    reconciler.apply(event);
    reconciler.into_session().events
}

/// Merge an authoritative remote log with a locally built one
///
/// Remote order comes first; local events with slots unknown to the remote
/// are applied on top, so nothing already rendered is lost or duplicated.
pub fn merge_logs(remote: Vec<SessionEvent>, local: Vec<SessionEvent>) -> Vec<SessionEvent> {
    let mut reconciler = Reconciler::from_events("", remote);
    reconciler.merge_local(local);
    reconciler.into_session().events
}
