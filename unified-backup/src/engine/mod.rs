//! Adapter for the external backup engine's command-line protocol.
//!
//! Every engine call goes through [`Engine::call`], which builds the
//! invocation (credentials travel only in the environment), applies the retry
//! policy, and folds "failures" that really mean success into `Ok`.

pub mod classify;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::process::{CommandRunner, Invocation, ProcessError, ProcessOutput};
use crate::repository::Repository;
use crate::retry::{self, RetryPolicy};
use classify::Classification;

/// Engine subcommands the orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Init,
    Snapshots,
    Backup,
    Restore,
    Unlock,
    Forget,
    Stats,
}

impl EngineOp {
    pub fn subcommand(&self) -> &'static str {
        match self {
            EngineOp::Init => "init",
            EngineOp::Snapshots => "snapshots",
            EngineOp::Backup => "backup",
            EngineOp::Restore => "restore",
            EngineOp::Unlock => "unlock",
            EngineOp::Forget => "forget",
            EngineOp::Stats => "stats",
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `<binary> --repo <location> <subcommand> <args...>` with the repository
    /// secrets as environment overlay.
    pub fn invocation(&self, repo: &Repository, op: EngineOp, args: &[String]) -> Invocation {
        Invocation::new(&self.binary, self.timeout)
            .arg("--repo")
            .arg(&repo.location)
            .arg(op.subcommand())
            .args(args.iter().cloned())
            .envs(repo.environment())
    }

    /// Run one engine operation against `repo` under the retry policy.
    pub async fn call(
        &self,
        repo: &Repository,
        op: EngineOp,
        args: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        let invocation = self.invocation(repo, op, args);
        info!(repo = %repo.name, cmd = %invocation.command_line(), "running engine command");

        let result = retry::execute(
            &self.retry,
            || self.runner.run(&invocation),
            |err: &ProcessError| {
                classify::classify(op, &err.text()) == Classification::Transient
            },
        )
        .await;

        match result {
            Err(err) if classify::classify(op, &err.text()) == Classification::Success => {
                info!(repo = %repo.name, op = op.subcommand(), "engine reported desired state already in place");
                Ok(err.into_output())
            }
            other => other,
        }
    }

    /// Query the engine version. Not tied to a repository and never retried.
    pub async fn version(&self) -> Result<String, ProcessError> {
        let invocation = Invocation::new(&self.binary, self.timeout).arg("version");
        let output = self.runner.run(&invocation).await?;
        Ok(output.stdout.trim().to_string())
    }
}
