//! Read-only projections over the canonical event log
//!
//! Pure functions, recomputed whenever the session changes.

use crate::types::{
    ConsoleRecord, PlanStep, Session, SessionEvent, SessionStatus, StepStatus, ToolEvent,
};
use chrono::{DateTime, Utc};

/// Completion state of the latest plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanProgress {
    pub steps: Vec<PlanStep>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl PlanProgress {
    /// First step that has not finished yet
    pub fn current(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| !s.status.is_finished())
    }

    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Progress of the most recent plan in the log
pub fn plan_progress(events: &[SessionEvent]) -> Option<PlanProgress> {
    let plan = events.iter().rev().find_map(|e| match e {
        SessionEvent::Plan(p) => Some(p),
        _ => None,
    })?;

    let completed = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let failed = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .count();

    Some(PlanProgress {
        steps: plan.steps.clone(),
        completed,
        failed,
        total: plan.steps.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkbenchMode {
    Shell,
    Browser,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPayload {
    Console(Vec<ConsoleRecord>),
    Screenshot(String),
}

/// Environment state observed by one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct WorkbenchSnapshot {
    pub timestamp: DateTime<Utc>,
    pub mode: WorkbenchMode,
    pub tool_call_id: String,
    pub shell_session_id: Option<String>,
    pub command: Option<String>,
    pub url: Option<String>,
    pub payload: SnapshotPayload,
}

impl WorkbenchSnapshot {
    /// Snapshot for a tool event that changed the observable environment
    pub fn from_tool(tool: &ToolEvent, timestamp: DateTime<Utc>) -> Option<Self> {
        let (mode, payload) = if let Some(shot) = tool.screenshot() {
            (WorkbenchMode::Browser, SnapshotPayload::Screenshot(shot.to_string()))
        } else {
            let console = tool.console();
            if console.is_empty() {
                return None;
            }
            (WorkbenchMode::Shell, SnapshotPayload::Console(console))
        };

        Some(Self {
            timestamp,
            mode,
            tool_call_id: tool.tool_call_id.clone(),
            shell_session_id: tool.shell_session_id().map(str::to_string),
            command: tool.command().map(str::to_string),
            url: tool.url().map(str::to_string),
            payload,
        })
    }
}

/// Snapshots ordered by timestamp
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkbenchTimeline {
    snapshots: Vec<WorkbenchSnapshot>,
}

impl WorkbenchTimeline {
    pub fn snapshots(&self) -> &[WorkbenchSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&WorkbenchSnapshot> {
        self.snapshots.last()
    }

    /// Value of the workbench at or before `at`
    pub fn at_or_before(&self, at: DateTime<Utc>) -> Option<&WorkbenchSnapshot> {
        let idx = self.snapshots.partition_point(|s| s.timestamp <= at);
        idx.checked_sub(1).map(|i| &self.snapshots[i])
    }

    pub fn latest_for_shell(&self, shell_session_id: &str) -> Option<&WorkbenchSnapshot> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.shell_session_id.as_deref() == Some(shell_session_id))
    }
}

/// Build the workbench timeline from the log
///
/// Events without `created_at` inherit the previous snapshot's time so log
/// order is preserved.
pub fn workbench_timeline(events: &[SessionEvent]) -> WorkbenchTimeline {
    let mut last = DateTime::<Utc>::default();
    let mut snapshots: Vec<WorkbenchSnapshot> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Tool(tool) => {
                let ts = tool.meta.created_at.unwrap_or(last);
                last = ts;
                WorkbenchSnapshot::from_tool(tool, ts)
            }
            _ => None,
        })
        .collect();
    // stable: equal timestamps keep log order
    snapshots.sort_by_key(|s| s.timestamp);
    WorkbenchTimeline { snapshots }
}

/// Everything a presentation layer needs after a change
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub event_count: usize,
    pub plan: Option<PlanProgress>,
    pub workbench: WorkbenchTimeline,
}

impl SessionView {
    pub fn project(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            title: session.title.clone(),
            event_count: session.events.len(),
            plan: plan_progress(&session.events),
            workbench: workbench_timeline(&session.events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Reconciler;
    use crate::types::*;
    use serde_json::json;

    fn shell_tool(id: &str, secs: Option<i64>, output: &str) -> SessionEvent {
        SessionEvent::Tool(ToolEvent {
            tool_call_id: id.to_string(),
            name: "shell".into(),
            function: "shell_exec".into(),
            args: json!({"id": "sh-1", "command": "make"}),
            content: Some(json!({"console": [{"ps1": "$", "command": "make", "output": output}]})),
            status: ToolStatus::Called,
            meta: EventMeta {
                event_id: None,
                created_at: secs.and_then(|s| DateTime::from_timestamp(s, 0)),
            },
        })
    }

    fn browser_tool(id: &str, secs: i64) -> SessionEvent {
        SessionEvent::Tool(ToolEvent {
            tool_call_id: id.to_string(),
            name: "browser".into(),
            function: "browser_navigate".into(),
            args: json!({"url": "https://example.com"}),
            content: Some(json!({"screenshot": "shot-1.png"})),
            status: ToolStatus::Called,
            meta: EventMeta {
                event_id: None,
                created_at: DateTime::from_timestamp(secs, 0),
            },
        })
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_plan_progress_reflects_step_sync() {
        let mut r = Reconciler::new("s");
        r.apply(SessionEvent::Plan(PlanEvent {
            steps: vec![PlanStep {
                id: "s1".into(),
                description: "Clone repo".into(),
                status: StepStatus::Pending,
            }],
            meta: EventMeta::default(),
        }));
        r.apply(SessionEvent::Step(StepEvent {
            id: "s1".into(),
            description: "Clone repo".into(),
            status: StepStatus::Completed,
            meta: EventMeta::default(),
        }));

        let progress = plan_progress(r.events()).unwrap();
        assert_eq!(progress.step("s1").unwrap().status, StepStatus::Completed);
        assert_eq!(progress.completed, 1);
        assert!(progress.is_finished());
        assert!(progress.current().is_none());
    }

    #[test]
    fn test_no_plan_no_progress() {
        assert!(plan_progress(&[]).is_none());
    }

    #[test]
    fn test_workbench_snapshots_at_or_before() {
        let events = vec![
            shell_tool("t1", Some(100), "one"),
            browser_tool("t2", 200),
            shell_tool("t3", Some(300), "three"),
        ];
        let timeline = workbench_timeline(&events);

        assert_eq!(timeline.len(), 3);
        assert!(timeline.at_or_before(ts(99)).is_none());
        assert_eq!(timeline.at_or_before(ts(100)).unwrap().tool_call_id, "t1");
        let mid = timeline.at_or_before(ts(250)).unwrap();
        assert_eq!(mid.mode, WorkbenchMode::Browser);
        assert_eq!(mid.url.as_deref(), Some("https://example.com"));
        assert_eq!(timeline.at_or_before(ts(1000)).unwrap().tool_call_id, "t3");
        assert_eq!(timeline.latest_for_shell("sh-1").unwrap().tool_call_id, "t3");
    }

    #[test]
    fn test_tools_without_observable_state_are_skipped() {
        let calling = SessionEvent::Tool(ToolEvent {
            tool_call_id: "t0".into(),
            name: "file".into(),
            function: "file_read".into(),
            args: json!({"file": "/tmp/a"}),
            content: None,
            status: ToolStatus::Calling,
            meta: EventMeta::default(),
        });
        assert!(workbench_timeline(&[calling]).is_empty());
    }

    #[test]
    fn test_missing_timestamps_keep_log_order() {
        let events = vec![
            shell_tool("t1", Some(100), "a"),
            shell_tool("t2", None, "b"),
        ];
        let timeline = workbench_timeline(&events);
        assert_eq!(timeline.snapshots()[1].tool_call_id, "t2");
        assert_eq!(timeline.snapshots()[1].timestamp, ts(100));
    }

    #[test]
    fn test_session_view_projection() {
        let mut session = Session::new("abc");
        session.status = SessionStatus::Running;
        session.events.push(shell_tool("t1", Some(5), "ok"));

        let view = SessionView::project(&session);
        assert_eq!(view.session_id, "abc");
        assert_eq!(view.event_count, 1);
        assert!(view.plan.is_none());
        assert_eq!(view.workbench.len(), 1);
    }
}
