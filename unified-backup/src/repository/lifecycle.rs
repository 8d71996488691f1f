//! Idempotent repository lifecycle operations.

use std::fmt;

use serde::Deserialize;
use tracing::{error, info, warn};

use super::{Repository, RetentionWindow};
use crate::engine::{classify, Engine, EngineOp};
use crate::process::ProcessOutput;
use crate::snapshot::{Snapshot, SnapshotResolver};
use crate::utils::format::format_size;
use crate::utils::Result;

/// Lifecycle operations on repositories, borrowing the run's engine.
pub struct RepositoryManager<'a> {
    engine: &'a Engine,
}

/// Subset of the engine's `stats --json` output.
#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    total_file_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryStats {
    pub snapshot_count: usize,
    pub latest: Option<Snapshot>,
    pub total_size: u64,
    pub total_file_count: u64,
}

impl fmt::Display for RepositoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let latest = self
            .latest
            .as_ref()
            .map(|s| format!("{} ({})", s.short(), s.display_time()))
            .unwrap_or_else(|| "never".to_string());
        write!(
            f,
            "snapshots: {}, latest: {}, files: {}, size: {}",
            self.snapshot_count,
            latest,
            self.total_file_count,
            format_size(self.total_size)
        )
    }
}

impl<'a> RepositoryManager<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Lightweight listing; a failure whose text proves the repository exists
    /// still counts as initialized so it is never re-initialized.
    pub async fn is_initialized(&self, repo: &Repository) -> bool {
        info!(repo = %repo.name, "checking repository");
        let args = ["--no-lock".to_string(), "--json".to_string()];

        match self.engine.call(repo, EngineOp::Snapshots, &args).await {
            Ok(_) => {
                info!(repo = %repo.name, "repository is initialized");
                true
            }
            Err(err) if classify::indicates_existing_repository(&err.text()) => {
                info!(repo = %repo.name, "repository is initialized but reported access issues");
                true
            }
            Err(err) => {
                info!(repo = %repo.name, reason = %err, "repository is not initialized");
                false
            }
        }
    }

    pub async fn ensure_initialized(&self, repo: &Repository) -> Result<()> {
        if self.is_initialized(repo).await {
            return Ok(());
        }

        info!(repo = %repo.name, location = %repo.location, "initializing repository");
        self.engine.call(repo, EngineOp::Init, &[]).await?;
        Ok(())
    }

    /// Remove all locks. Returns false for a repository that does not exist.
    pub async fn force_unlock(&self, repo: &Repository) -> bool {
        warn!(repo = %repo.name, "forcing unlock of repository");

        if !self.is_initialized(repo).await {
            warn!(repo = %repo.name, "repository is not initialized; cannot unlock");
            return false;
        }

        match self
            .engine
            .call(repo, EngineOp::Unlock, &["--remove-all".to_string()])
            .await
        {
            Ok(_) => {
                info!(repo = %repo.name, "repository unlocked");
                true
            }
            Err(err) => {
                error!(repo = %repo.name, error = %err, "failed to unlock repository");
                false
            }
        }
    }

    /// Forget snapshots older than `retention` and compact storage.
    pub async fn prune(
        &self,
        repo: &Repository,
        retention: &RetentionWindow,
    ) -> Result<ProcessOutput> {
        self.ensure_initialized(repo).await?;

        info!(repo = %repo.name, keep_within = %retention, "applying retention policy");
        let args = [
            "--prune".to_string(),
            "--keep-within".to_string(),
            retention.to_string(),
        ];
        Ok(self.engine.call(repo, EngineOp::Forget, &args).await?)
    }

    pub async fn stats(&self, repo: &Repository) -> Result<RepositoryStats> {
        let snapshots = SnapshotResolver::new(self.engine).list(repo).await?;
        let latest = crate::snapshot::select_latest(&snapshots).cloned();

        let output = self
            .engine
            .call(repo, EngineOp::Stats, &["--json".to_string()])
            .await?;
        let raw: RawStats = if output.stdout.trim().is_empty() {
            RawStats::default()
        } else {
            serde_json::from_str(&output.stdout)?
        };

        Ok(RepositoryStats {
            snapshot_count: snapshots.len(),
            latest,
            total_size: raw.total_size,
            total_file_count: raw.total_file_count,
        })
    }
}
