//! Per-run state handed to every component.

use std::collections::HashSet;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::orchestrator::Task;
use crate::repository::RetentionWindow;
use crate::status::{StatusBoard, StatusReport};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Prune repositories touched by backup tasks with this window after the run.
    pub retention: Option<RetentionWindow>,
    pub unlock_before_restore: bool,
    /// Warn when a restore target has less free space than this.
    pub min_free_space_gb: Option<u64>,
    /// Distinct repositories processed at once. Tasks on the same repository
    /// always run one after another.
    pub max_concurrent_repositories: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retention: None,
            unlock_before_restore: false,
            min_free_space_gb: None,
            max_concurrent_repositories: 1,
        }
    }
}

/// Everything one run owns: the engine adapter, the task list, the status
/// board, and the cancellation token. Created at run start, dropped at exit.
pub struct RunContext {
    engine: Engine,
    tasks: Vec<Task>,
    status: StatusBoard,
    options: RunOptions,
    cancel: CancellationToken,
    started: Instant,
}

impl RunContext {
    /// Tasks are kept in declaration order. When a name repeats, only its
    /// first declaration runs; later ones are reported as failed.
    pub fn new(
        engine: Engine,
        tasks: Vec<Task>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        let status = StatusBoard::new(tasks.iter().map(|t| t.name.clone()));

        let mut seen = HashSet::new();
        let tasks = tasks
            .into_iter()
            .filter(|task| seen.insert(task.name.clone()))
            .collect();

        Self {
            engine,
            tasks,
            status,
            options,
            cancel,
            started: Instant::now(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn report(&self) -> StatusReport {
        self.status.report(self.started.elapsed()).await
    }
}
