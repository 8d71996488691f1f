//! Task orchestration: drives every task through init-check, operation, and
//! status update, then applies retention to the repositories that were
//! backed up.
//!
//! Per-task failures never escape this module; they become failed entries on
//! the status board so a full report is always produced.

pub mod task;

use std::path::PathBuf;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::engine::EngineOp;
use crate::preflight;
use crate::process::ProcessError;
use crate::repository::{Repository, RepositoryManager, RetentionWindow};
use crate::snapshot::SnapshotResolver;
use crate::status::StatusReport;
use crate::utils::format::{section, truncate};
use crate::utils::{OrchestratorError, Result};

pub use task::{Operation, Task};

/// Longest error excerpt kept in a status message. Full text goes to the log.
const MAX_MESSAGE_CHARS: usize = 500;

/// Run every task in the context and return the final report.
pub async fn run_all(ctx: &RunContext) -> StatusReport {
    let groups = group_by_repository(ctx.tasks());
    let limit = ctx.options().max_concurrent_repositories.max(1);
    info!(
        tasks = ctx.tasks().len(),
        repositories = groups.len(),
        concurrency = limit,
        "starting run"
    );

    stream::iter(groups)
        .map(|group| run_group(ctx, group))
        .buffer_unordered(limit)
        .collect::<Vec<()>>()
        .await;

    if let Some(retention) = &ctx.options().retention {
        if ctx.is_cancelled() || ctx.report().await.is_incomplete() {
            warn!("run interrupted; skipping retention policy");
        } else {
            let backed_up: Vec<&Repository> = ctx
                .tasks()
                .iter()
                .filter(|t| t.operation == Operation::Backup)
                .map(|t| &t.repository)
                .collect();
            prune_repositories(ctx, &backed_up, retention).await;
        }
    }

    ctx.report().await
}

/// Apply the retention window to each distinct repository. Outcomes are
/// recorded as maintenance results and never change task states.
pub async fn prune_repositories(
    ctx: &RunContext,
    repositories: &[&Repository],
    retention: &RetentionWindow,
) {
    if repositories.is_empty() {
        return;
    }

    info!("\n{}", section("Cleaning Up Old Snapshots (Retention Policy)"));
    let manager = RepositoryManager::new(ctx.engine());
    let mut seen: Vec<&str> = Vec::new();

    for repo in repositories {
        if seen.contains(&repo.location.as_str()) {
            continue;
        }
        seen.push(&repo.location);

        let name = format!("prune {}", repo.name);
        match manager.prune(repo, retention).await {
            Ok(_) => {
                info!(repo = %repo.name, keep_within = %retention, "retention policy applied");
                ctx.status()
                    .record_maintenance(name, true, format!("kept snapshots within {retention}"))
                    .await;
            }
            Err(err) => {
                error!(repo = %repo.name, error = %err, "prune failed");
                ctx.status()
                    .record_maintenance(name, false, truncate(&err.to_string(), MAX_MESSAGE_CHARS))
                    .await;
            }
        }
    }
}

/// Tasks grouped by repository location, preserving first-appearance order.
fn group_by_repository(tasks: &[Task]) -> Vec<Vec<&Task>> {
    let mut groups: Vec<Vec<&Task>> = Vec::new();
    for task in tasks {
        match groups
            .iter_mut()
            .find(|g| g[0].repository.location == task.repository.location)
        {
            Some(group) => group.push(task),
            None => groups.push(vec![task]),
        }
    }
    groups
}

async fn run_group(ctx: &RunContext, group: Vec<&Task>) {
    for task in group {
        if ctx.is_cancelled() {
            warn!(task = %task.name, "run cancelled; leaving task pending");
            continue;
        }
        run_task(ctx, task).await;
    }
}

async fn run_task(ctx: &RunContext, task: &Task) {
    info!(
        "\n{}",
        section(&format!("{} {} ({})", task.operation.title(), task.name, task.repository.name))
    );

    let status = ctx.status();
    status
        .mark_in_progress(&task.name, format!("{} in progress...", task.operation.title()))
        .await;

    let started = Instant::now();
    let result = execute_task(ctx, task).await;
    let secs = started.elapsed().as_secs_f64();

    match result {
        Ok(note) => {
            let message = format!("{} completed in {secs:.1} seconds{note}", task.operation.title());
            info!(task = %task.name, "{message}");
            status.mark_success(&task.name, message).await;
        }
        Err(OrchestratorError::Process(ProcessError::Cancelled)) => {
            // Interrupted, not failed: the report shows it as still in progress.
            warn!(task = %task.name, "task interrupted by shutdown");
        }
        Err(err) => {
            error!(task = %task.name, error = %err, "task failed");
            let message = format!(
                "{} failed after {secs:.1} seconds: {}",
                task.operation.title(),
                truncate(&err.to_string(), MAX_MESSAGE_CHARS)
            );
            status.mark_failed(&task.name, message).await;
        }
    }
}

async fn execute_task(ctx: &RunContext, task: &Task) -> Result<String> {
    RepositoryManager::new(ctx.engine())
        .ensure_initialized(&task.repository)
        .await?;

    match task.operation {
        Operation::Backup => backup(ctx, task).await,
        Operation::Restore => restore(ctx, task).await,
    }
}

async fn backup(ctx: &RunContext, task: &Task) -> Result<String> {
    let mut args = vec![task.local_path.display().to_string()];
    for pattern in &task.excludes {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }

    let output = ctx
        .engine()
        .call(&task.repository, EngineOp::Backup, &args)
        .await?;

    Ok(saved_snapshot_id(&output.stdout)
        .map(|id| format!(" (snapshot {id})"))
        .unwrap_or_default())
}

async fn restore(ctx: &RunContext, task: &Task) -> Result<String> {
    let repo = &task.repository;

    if ctx.options().unlock_before_restore {
        RepositoryManager::new(ctx.engine()).force_unlock(repo).await;
    }

    let snapshot = SnapshotResolver::new(ctx.engine())
        .latest(repo)
        .await?
        .ok_or_else(|| OrchestratorError::NoSnapshot(repo.name.clone()))?;

    tokio::fs::create_dir_all(&task.local_path).await?;

    if let Some(min_gb) = ctx.options().min_free_space_gb {
        preflight::check_free_space(&task.local_path, min_gb);
    }

    let args = vec![
        snapshot.short().to_string(),
        "--target".to_string(),
        task.local_path.display().to_string(),
    ];
    ctx.engine().call(repo, EngineOp::Restore, &args).await?;

    let mut note = format!(" (snapshot {} from {})", snapshot.short(), snapshot.display_time());
    let missing = missing_verify_paths(task);
    if !missing.is_empty() {
        let listed = missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        warn!(task = %task.name, missing = %listed, "expected paths missing after restore");
        note.push_str(&format!("; warning: missing after restore: {listed}"));
    }

    Ok(note)
}

/// Verification paths absent under the restore target. The engine restores
/// absolute paths beneath the target, so `/etc/fstab` is checked at
/// `<target>/etc/fstab`.
fn missing_verify_paths(task: &Task) -> Vec<PathBuf> {
    task.verify_paths
        .iter()
        .filter(|path| {
            let relative = path.strip_prefix("/").unwrap_or(path);
            !task.local_path.join(relative).exists()
        })
        .cloned()
        .collect()
}

/// Pull the id out of the engine's "snapshot <id> saved" summary line.
fn saved_snapshot_id(stdout: &str) -> Option<&str> {
    stdout.lines().rev().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("snapshot"), Some(id), Some("saved")) => Some(id),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::engine::Engine;
    use crate::process::testing::ScriptedRunner;
    use crate::retry::RetryPolicy;
    use crate::status::{RunClassification, TaskState};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const MISSING: &str = "Fatal: unable to open config file: Stat: 404 Not Found";

    fn context(runner: Arc<ScriptedRunner>, tasks: Vec<Task>, options: RunOptions) -> RunContext {
        let engine = Engine::new(
            runner,
            "restic",
            Duration::from_secs(60),
            RetryPolicy::new(3, Duration::ZERO),
        );
        RunContext::new(engine, tasks, options, CancellationToken::new())
    }

    fn repo(name: &str) -> Repository {
        Repository::new(name, format!("b2:bucket:host/{name}"), "pw")
    }

    #[test]
    fn test_group_by_repository_preserves_order() {
        let tasks = vec![
            Task::backup("a", repo("system"), "/"),
            Task::backup("b", repo("vm"), "/var/lib/libvirt"),
            Task::backup("c", repo("system"), "/home"),
        ];
        let groups = group_by_repository(&tasks);

        let names: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|t| t.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a", "c"], vec!["b"]]);
    }

    #[test]
    fn test_saved_snapshot_id() {
        let out = "Files: 10 new\nAdded to the repository: 1 KiB\nsnapshot 9f3c2a1b saved\n";
        assert_eq!(saved_snapshot_id(out), Some("9f3c2a1b"));
        assert_eq!(saved_snapshot_id("nothing here"), None);
    }

    #[tokio::test]
    async fn test_backup_on_uninitialized_repository() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("snapshots", vec![ScriptedRunner::fail(MISSING)])
                .on("init", vec![ScriptedRunner::ok("created restic repository")])
                .on("backup", vec![ScriptedRunner::ok("snapshot 1a2b3c4d saved")]),
        );
        let ctx = context(
            runner.clone(),
            vec![Task::backup("system", repo("system"), "/data")],
            RunOptions::default(),
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.classification, RunClassification::Success);
        let status = ctx.status().get("system").await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert!(status.message.contains("1a2b3c4d"));
        assert_eq!(runner.count("init"), 1);
    }

    #[tokio::test]
    async fn test_excludes_are_separate_ordered_arguments() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let task = Task::backup("system", repo("system"), "/")
            .with_excludes(["/proc/*", "*.iso", "/home/*/.cache/*"]);
        let ctx = context(runner.clone(), vec![task], RunOptions::default());

        run_all(&ctx).await;

        let call = runner
            .calls()
            .into_iter()
            .find(|c| c.args.contains(&"backup".to_string()))
            .unwrap();
        let tail: Vec<&str> = call
            .args
            .iter()
            .skip_while(|a| *a != "backup")
            .map(String::as_str)
            .collect();
        assert_eq!(
            tail,
            vec![
                "backup", "/", "--exclude", "/proc/*", "--exclude", "*.iso", "--exclude",
                "/home/*/.cache/*"
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_without_snapshots_fails() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            runner.clone(),
            vec![Task::restore("vm", repo("vm"), dir.path().join("vm"))],
            RunOptions::default(),
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.classification, RunClassification::Failed);
        let status = ctx.status().get("vm").await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.message.contains("no snapshot"));
        assert_eq!(runner.count("restore"), 0);
    }

    #[tokio::test]
    async fn test_restore_uses_latest_snapshot_and_creates_target() {
        let listing = r#"[
            {"id":"old0000000","short_id":"old00000","time":"2024-01-01T00:00:00Z"},
            {"id":"new0000000","short_id":"new00000","time":"2024-02-01T00:00:00Z"}
        ]"#;
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok(listing)]));
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("plex");
        let ctx = context(
            runner.clone(),
            vec![Task::restore("plex", repo("plex"), &target)],
            RunOptions::default(),
        );

        run_all(&ctx).await;

        assert!(target.is_dir());
        let call = runner
            .calls()
            .into_iter()
            .find(|c| c.args.contains(&"restore".to_string()))
            .unwrap();
        let tail: Vec<String> = call.args.iter().skip_while(|a| *a != "restore").cloned().collect();
        assert_eq!(
            tail,
            vec![
                "restore".to_string(),
                "new00000".to_string(),
                "--target".to_string(),
                target.display().to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_reports_missing_verify_paths() {
        let listing = r#"[{"id":"abcdef0123","short_id":"abcdef01","time":"2024-01-01T00:00:00Z"}]"#;
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok(listing)]));
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/fstab"), "").unwrap();

        let task = Task::restore("system", repo("system"), dir.path())
            .with_verify_paths(["/etc/fstab", "/etc/passwd"]);
        let ctx = context(runner, vec![task], RunOptions::default());

        run_all(&ctx).await;

        let status = ctx.status().get("system").await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert!(status.message.contains("/etc/passwd"));
        assert!(!status.message.contains("/etc/fstab"));
    }

    #[tokio::test]
    async fn test_partial_success_keeps_going() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("snapshots", vec![ScriptedRunner::ok("[]")])
                .on_repo(
                    "b2:bucket:host/vm",
                    "backup",
                    vec![ScriptedRunner::fail("Fatal: unable to save snapshot: permission denied")],
                ),
        );
        let ctx = context(
            runner,
            vec![
                Task::backup("system", repo("system"), "/"),
                Task::backup("vm", repo("vm"), "/var/lib/libvirt"),
                Task::backup("plex", repo("plex"), "/var/lib/plexmediaserver"),
            ],
            RunOptions::default(),
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.classification, RunClassification::PartialSuccess);
        assert_eq!(report.entries.len(), 3);
        let states: Vec<TaskState> = report.entries.iter().map(|(_, s)| s.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Success, TaskState::Failed, TaskState::Success]
        );
        assert!(report.entries[1].1.message.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_init_failure_fails_task_only() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_repo("b2:bucket:host/vm", "snapshots", vec![ScriptedRunner::fail(MISSING)])
                .on_repo(
                    "b2:bucket:host/vm",
                    "init",
                    vec![ScriptedRunner::fail("Fatal: create repository failed: 403 Forbidden")],
                )
                .on("snapshots", vec![ScriptedRunner::ok("[]")]),
        );
        let ctx = context(
            runner.clone(),
            vec![
                Task::backup("vm", repo("vm"), "/var/lib/libvirt"),
                Task::backup("system", repo("system"), "/"),
            ],
            RunOptions::default(),
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.entries[0].1.state, TaskState::Failed);
        assert!(report.entries[0].1.message.contains("403"));
        assert_eq!(report.entries[1].1.state, TaskState::Success);
        assert_eq!(runner.count("backup"), 1);
    }

    #[tokio::test]
    async fn test_backup_recovers_after_three_transient_failures() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("snapshots", vec![ScriptedRunner::ok("[]")])
                .on(
                    "backup",
                    vec![
                        ScriptedRunner::fail("connection reset by peer"),
                        ScriptedRunner::fail("connection reset by peer"),
                        ScriptedRunner::fail("connection reset by peer"),
                        ScriptedRunner::ok("snapshot 0badcafe saved"),
                    ],
                ),
        );
        let ctx = context(
            runner.clone(),
            vec![Task::backup("system", repo("system"), "/data")],
            RunOptions::default(),
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.classification, RunClassification::Success);
        assert_eq!(runner.count("backup"), 4);
    }

    #[tokio::test]
    async fn test_prune_runs_once_per_backed_up_repository() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let options = RunOptions {
            retention: Some(RetentionWindow::days(7).unwrap()),
            ..RunOptions::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            runner.clone(),
            vec![
                Task::backup("root", repo("system"), "/"),
                Task::backup("home", repo("system"), "/home"),
                Task::restore("vm", repo("vm"), dir.path()),
            ],
            options,
        );

        let report = run_all(&ctx).await;

        assert_eq!(runner.count("forget"), 1);
        assert_eq!(report.maintenance.len(), 1);
        assert!(report.maintenance[0].success);
    }

    #[tokio::test]
    async fn test_prune_failure_does_not_flip_backup() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("snapshots", vec![ScriptedRunner::ok("[]")])
                .on("forget", vec![ScriptedRunner::fail("Fatal: repository is already locked")]),
        );
        let options = RunOptions {
            retention: Some(RetentionWindow::days(7).unwrap()),
            ..RunOptions::default()
        };
        let ctx = context(
            runner,
            vec![Task::backup("system", repo("system"), "/")],
            options,
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.classification, RunClassification::Success);
        assert!(!report.maintenance[0].success);
        assert!(report.maintenance[0].message.contains("locked"));
    }

    #[tokio::test]
    async fn test_unlock_before_restore() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let options = RunOptions {
            unlock_before_restore: true,
            ..RunOptions::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            runner.clone(),
            vec![Task::restore("vm", repo("vm"), dir.path())],
            options,
        );

        run_all(&ctx).await;

        assert_eq!(runner.count("unlock"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_repositories_report_in_declaration_order() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let options = RunOptions {
            max_concurrent_repositories: 3,
            ..RunOptions::default()
        };
        let ctx = context(
            runner,
            vec![
                Task::backup("system", repo("system"), "/"),
                Task::backup("vm", repo("vm"), "/var/lib/libvirt"),
                Task::backup("plex", repo("plex"), "/var/lib/plexmediaserver"),
            ],
            options,
        );

        let report = run_all(&ctx).await;

        let names: Vec<&str> = report.entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["system", "vm", "plex"]);
        assert_eq!(report.classification, RunClassification::Success);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_tasks_unfinished() {
        let runner = Arc::new(ScriptedRunner::new().on("snapshots", vec![ScriptedRunner::ok("[]")]));
        let engine = Engine::new(runner.clone(), "restic", Duration::from_secs(5), RetryPolicy::none());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = RunContext::new(
            engine,
            vec![Task::backup("system", repo("system"), "/")],
            RunOptions {
                retention: Some(RetentionWindow::days(7).unwrap()),
                ..RunOptions::default()
            },
            cancel,
        );

        let report = run_all(&ctx).await;

        assert_eq!(report.entries[0].1.state, TaskState::Pending);
        assert!(report.is_incomplete());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_task_stays_in_progress() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("snapshots", vec![ScriptedRunner::ok("[]")])
                .on("backup", vec![Err(ProcessError::Cancelled)]),
        );
        let ctx = context(
            runner.clone(),
            vec![Task::backup("system", repo("system"), "/")],
            RunOptions {
                retention: Some(RetentionWindow::days(7).unwrap()),
                ..RunOptions::default()
            },
        );

        let report = run_all(&ctx).await;

        let status = &report.entries[0].1;
        assert_eq!(status.state, TaskState::InProgress);
        assert!(status.finished_at.is_none());
        assert!(report.is_incomplete());
        assert_eq!(runner.count("backup"), 1);
        assert_eq!(runner.count("forget"), 0);
        assert!(report.maintenance.is_empty());
    }
}
