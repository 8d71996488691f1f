//! Per-task execution state and the run report.
//!
//! [`StatusBoard`] is the only shared mutable state of a run. The orchestrator
//! writes it; anything else (the final report, the signal path) only reads.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::RwLock;
use tracing::warn;

use crate::utils::format::section;
use crate::utils::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl TaskState {
    fn rank(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::InProgress => 1,
            TaskState::Success | TaskState::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::InProgress => "IN PROGRESS",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub message: String,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl TaskStatus {
    fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            message: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Failed without ever starting.
    fn rejected(message: String) -> Self {
        Self {
            state: TaskState::Failed,
            message,
            started_at: None,
            finished_at: Some(Local::now()),
        }
    }
}

/// Outcome of a post-task maintenance step such as pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceResult {
    pub name: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunClassification {
    Success,
    PartialSuccess,
    Failed,
}

impl RunClassification {
    /// All tasks succeeded, some succeeded, or none did.
    pub fn from_states<I: IntoIterator<Item = TaskState>>(states: I) -> Self {
        let (mut total, mut succeeded) = (0usize, 0usize);
        for state in states {
            total += 1;
            if state == TaskState::Success {
                succeeded += 1;
            }
        }

        if succeeded == total {
            RunClassification::Success
        } else if succeeded > 0 {
            RunClassification::PartialSuccess
        } else {
            RunClassification::Failed
        }
    }
}

impl fmt::Display for RunClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunClassification::Success => "SUCCESS",
            RunClassification::PartialSuccess => "PARTIAL SUCCESS",
            RunClassification::Failed => "FAILED",
        })
    }
}

#[derive(Default)]
struct BoardInner {
    tasks: Vec<(String, TaskStatus)>,
    maintenance: Vec<MaintenanceResult>,
}

/// Ordered task-name -> status map, safe to share across concurrent tasks.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<BoardInner>>,
}

impl StatusBoard {
    /// Every name starts out pending, in declaration order. A name that was
    /// already declared gets its own entry, failed on the spot; status
    /// updates by name always reach the first declaration.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tasks: Vec<(String, TaskStatus)> = Vec::new();
        for name in names {
            let name = name.into();
            let status = if tasks.iter().any(|(n, _)| *n == name) {
                warn!(task = %name, "duplicate task name; later declaration will not run");
                TaskStatus::rejected(OrchestratorError::DuplicateTask(name.clone()).to_string())
            } else {
                TaskStatus::pending()
            };
            tasks.push((name, status));
        }

        Self {
            inner: Arc::new(RwLock::new(BoardInner {
                tasks,
                maintenance: Vec::new(),
            })),
        }
    }

    pub async fn mark_in_progress(&self, name: &str, message: impl Into<String>) -> bool {
        self.transition(name, TaskState::InProgress, message.into()).await
    }

    pub async fn mark_success(&self, name: &str, message: impl Into<String>) -> bool {
        self.transition(name, TaskState::Success, message.into()).await
    }

    pub async fn mark_failed(&self, name: &str, message: impl Into<String>) -> bool {
        self.transition(name, TaskState::Failed, message.into()).await
    }

    /// Apply a forward-only state change: pending -> in progress -> success or
    /// failed. Returns false (and leaves the entry untouched) for unknown names
    /// and for any other move.
    async fn transition(&self, name: &str, next: TaskState, message: String) -> bool {
        let mut inner = self.inner.write().await;
        let Some((_, status)) = inner.tasks.iter_mut().find(|(n, _)| n == name) else {
            warn!(task = name, "status update for unknown task");
            return false;
        };

        if next.rank() != status.state.rank() + 1 {
            warn!(
                task = name,
                from = %status.state,
                to = %next,
                "ignoring non-monotonic status transition"
            );
            return false;
        }

        let now = Local::now();
        if next == TaskState::InProgress {
            status.started_at = Some(now);
        }
        if next.is_terminal() {
            status.finished_at = Some(now);
        }
        status.state = next;
        status.message = message;
        true
    }

    pub async fn record_maintenance(
        &self,
        name: impl Into<String>,
        success: bool,
        message: impl Into<String>,
    ) {
        self.inner.write().await.maintenance.push(MaintenanceResult {
            name: name.into(),
            success,
            message: message.into(),
        });
    }

    pub async fn get(&self, name: &str) -> Option<TaskStatus> {
        self.inner
            .read()
            .await
            .tasks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }

    pub async fn entries(&self) -> Vec<(String, TaskStatus)> {
        self.inner.read().await.tasks.clone()
    }

    pub async fn classification(&self) -> RunClassification {
        RunClassification::from_states(self.inner.read().await.tasks.iter().map(|(_, s)| s.state))
    }

    /// Read-only copy of the current state, safe to take at any time.
    pub async fn report(&self, elapsed: Duration) -> StatusReport {
        let inner = self.inner.read().await;
        StatusReport {
            entries: inner.tasks.clone(),
            maintenance: inner.maintenance.clone(),
            classification: RunClassification::from_states(
                inner.tasks.iter().map(|(_, s)| s.state),
            ),
            elapsed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub entries: Vec<(String, TaskStatus)>,
    pub maintenance: Vec<MaintenanceResult>,
    pub classification: RunClassification,
    pub elapsed: Duration,
}

impl StatusReport {
    pub fn all_succeeded(&self) -> bool {
        self.classification == RunClassification::Success
    }

    /// True when some tasks never reached a terminal state.
    pub fn is_incomplete(&self) -> bool {
        self.entries.iter().any(|(_, s)| !s.state.is_terminal())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", section("Status Report"))?;
        for (name, status) in &self.entries {
            write!(f, "[{}] {}: {}", status.state.label(), name, status.state)?;
            if !status.message.is_empty() {
                write!(f, " - {}", status.message)?;
            }
            writeln!(f)?;
        }

        if !self.maintenance.is_empty() {
            writeln!(f, "{}", section("Maintenance"))?;
            for item in &self.maintenance {
                let label = if item.success { "SUCCESS" } else { "FAILED" };
                writeln!(f, "[{label}] {}: {}", item.name, item.message)?;
            }
        }

        if self.is_incomplete() {
            writeln!(f, "Run interrupted before all tasks finished.")?;
        }
        write!(
            f,
            "Run completed with {} (took {:.1} seconds)",
            self.classification,
            self.elapsed.as_secs_f64()
        )
    }
}
