//! Snapshot listing and latest-snapshot resolution.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use tracing::info;

use crate::engine::{Engine, EngineOp};
use crate::repository::Repository;
use crate::utils::Result;

/// One record of the engine's `snapshots --json` listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub time: DateTime<FixedOffset>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Snapshot {
    /// Short identifier, falling back to the first eight characters of the id.
    pub fn short(&self) -> &str {
        match &self.short_id {
            Some(short) if !short.is_empty() => short.as_str(),
            _ => self.id.get(..8).unwrap_or(&self.id),
        }
    }

    pub fn display_time(&self) -> String {
        self.time.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Most recent snapshot by timestamp. Equal timestamps resolve to the
/// lexically greatest id, so the answer is stable for unchanged input.
pub fn select_latest(snapshots: &[Snapshot]) -> Option<&Snapshot> {
    snapshots
        .iter()
        .max_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)))
}

pub struct SnapshotResolver<'a> {
    engine: &'a Engine,
}

impl<'a> SnapshotResolver<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub async fn list(&self, repo: &Repository) -> Result<Vec<Snapshot>> {
        let output = self
            .engine
            .call(repo, EngineOp::Snapshots, &["--json".to_string()])
            .await?;
        parse_listing(&output.stdout)
    }

    /// `Ok(None)` for an empty repository; that is a valid state, not an error.
    pub async fn latest(&self, repo: &Repository) -> Result<Option<Snapshot>> {
        let snapshots = self.list(repo).await?;
        let latest = select_latest(&snapshots).cloned();

        match &latest {
            Some(s) => info!(
                repo = %repo.name,
                snapshot = s.short(),
                time = %s.display_time(),
                "resolved latest snapshot"
            ),
            None => info!(repo = %repo.name, "repository has no snapshots"),
        }

        Ok(latest)
    }
}

fn parse_listing(stdout: &str) -> Result<Vec<Snapshot>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<Snapshot>> = serde_json::from_str(stdout)?;
    Ok(parsed.unwrap_or_default())
}
