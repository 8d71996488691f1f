//! Unified Backup - Main entry point
//!
//! Runs the configured backup and restore tasks against restic repositories
//! and prints a status report.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use unified_backup::orchestrator::{self, Operation};
use unified_backup::preflight;
use unified_backup::process::ProcessRunner;
use unified_backup::shutdown::{drain_on_shutdown, Outcome, ShutdownCoordinator};
use unified_backup::snapshot::{select_latest, SnapshotResolver};
use unified_backup::utils::{format::section, logger};
use unified_backup::{Config, Engine, Repository, RepositoryManager, RunContext};

/// How long an interrupted command may take to wind down its current engine call.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/unified-backup/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured task, then apply the retention policy
    Run,
    /// Run only backup tasks, then apply the retention policy
    Backup,
    /// Restore the latest snapshot for every restore task
    Restore,
    /// Forget and prune snapshots outside the retention window
    Prune {
        #[arg(short, long)]
        repository: Option<String>,
    },
    /// Remove stale locks
    Unlock {
        #[arg(short, long)]
        repository: Option<String>,
    },
    /// List snapshots and show the latest one
    Snapshots {
        #[arg(short, long)]
        repository: String,
    },
    /// Show repository statistics
    Stats {
        #[arg(short, long)]
        repository: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Secrets may live in a local .env file.
    let _ = dotenvy::dotenv();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = logger::init(log_level, config.log.file.as_deref()) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    info!("Starting unified-backup v{}", env!("CARGO_PKG_VERSION"));

    match execute(args.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<ExitCode> {
    let shutdown = ShutdownCoordinator::new();
    let runner = Arc::new(ProcessRunner::new(shutdown.token()));
    let engine = Engine::new(
        runner,
        config.engine.binary.clone(),
        config.command_timeout(),
        config.retry_policy(),
    );

    preflight::check(&engine, &config.engine.binary, config.run.require_root).await?;
    let repositories = config.repositories()?;

    match command {
        Command::Run => run_tasks(&config, engine, &repositories, None, &shutdown).await,
        Command::Backup => {
            run_tasks(&config, engine, &repositories, Some(Operation::Backup), &shutdown).await
        }
        Command::Restore => {
            run_tasks(&config, engine, &repositories, Some(Operation::Restore), &shutdown).await
        }
        Command::Prune { repository } => {
            let selected = select(&repositories, repository.as_deref())?;
            let retention = config.retention_window()?;
            until_signal(&shutdown, async {
                let manager = RepositoryManager::new(&engine);
                let mut failed = false;
                for repo in selected {
                    match manager.prune(repo, &retention).await {
                        Ok(_) => println!("[SUCCESS] {}: kept snapshots within {retention}", repo.name),
                        Err(e) => {
                            failed = true;
                            println!("[FAILED] {}: {e}", repo.name);
                        }
                    }
                }
                Ok(exit_status(!failed))
            })
            .await
        }
        Command::Unlock { repository } => {
            let selected = select(&repositories, repository.as_deref())?;
            until_signal(&shutdown, async {
                let manager = RepositoryManager::new(&engine);
                let mut failed = false;
                for repo in selected {
                    if manager.force_unlock(repo).await {
                        println!("[SUCCESS] {}: unlocked", repo.name);
                    } else {
                        failed = true;
                        println!("[FAILED] {}: could not unlock", repo.name);
                    }
                }
                Ok(exit_status(!failed))
            })
            .await
        }
        Command::Snapshots { repository } => {
            let selected = select(&repositories, Some(repository.as_str()))?;
            until_signal(&shutdown, async {
                let repo = selected[0];
                let snapshots = SnapshotResolver::new(&engine).list(repo).await?;
                for s in &snapshots {
                    println!("{}  {}  {}", s.short(), s.display_time(), s.paths.join(", "));
                }
                match select_latest(&snapshots) {
                    Some(latest) => println!("latest: {} ({})", latest.short(), latest.display_time()),
                    None => println!("no snapshots found in repository '{}'", repo.name),
                }
                Ok(ExitCode::SUCCESS)
            })
            .await
        }
        Command::Stats { repository } => {
            let selected = select(&repositories, repository.as_deref())?;
            until_signal(&shutdown, async {
                let manager = RepositoryManager::new(&engine);
                let mut failed = false;
                for repo in selected {
                    match manager.stats(repo).await {
                        Ok(stats) => println!("{}: {stats}", repo.name),
                        Err(e) => {
                            failed = true;
                            println!("{}: unavailable ({e})", repo.name);
                        }
                    }
                }
                Ok(exit_status(!failed))
            })
            .await
        }
    }
}

async fn run_tasks(
    config: &Config,
    engine: Engine,
    repositories: &[Repository],
    only: Option<Operation>,
    shutdown: &ShutdownCoordinator,
) -> Result<ExitCode> {
    let mut tasks = config.tasks(repositories)?;
    if let Some(op) = only {
        tasks.retain(|t| t.operation == op);
    }
    if tasks.is_empty() {
        warn!("No matching tasks configured; nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = RunContext::new(engine, tasks, config.run_options()?, shutdown.token());

    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    info!("UNIFIED RUN STARTED AT {now}");

    let outcome = drain_on_shutdown(
        orchestrator::run_all(&ctx),
        shutdown.wait_for_signal(),
        DRAIN_TIMEOUT,
    )
    .await;

    let (report, signal) = match outcome {
        Outcome::Completed(report) => (report, None),
        Outcome::Interrupted { signal, output } => {
            // Without a drained report, render whatever status was settled.
            let report = match output {
                Some(report) => report,
                None => ctx.report().await,
            };
            (report, Some(signal))
        }
    };

    println!("{report}");

    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    info!(
        "UNIFIED RUN COMPLETED WITH {} AT {now} (took {:.1} seconds)",
        report.classification,
        report.elapsed.as_secs_f64()
    );

    Ok(match signal {
        Some(signal) => ExitCode::from(signal.exit_code()),
        None => exit_status(report.all_succeeded()),
    })
}

/// Run a maintenance command. On a shutdown signal the running engine call
/// is terminated gracefully and the signal's exit code is returned.
async fn until_signal<F>(shutdown: &ShutdownCoordinator, work: F) -> Result<ExitCode>
where
    F: Future<Output = Result<ExitCode>>,
{
    match drain_on_shutdown(work, shutdown.wait_for_signal(), DRAIN_TIMEOUT).await {
        Outcome::Completed(result) => result,
        Outcome::Interrupted { signal, .. } => {
            warn!("{}", section("Interrupted"));
            Ok(ExitCode::from(signal.exit_code()))
        }
    }
}

fn select<'a>(repositories: &'a [Repository], name: Option<&str>) -> Result<Vec<&'a Repository>> {
    match name {
        None => Ok(repositories.iter().collect()),
        Some(name) => match repositories.iter().find(|r| r.name == name) {
            Some(repo) => Ok(vec![repo]),
            None => bail!("unknown repository '{name}'"),
        },
    }
}

fn exit_status(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
