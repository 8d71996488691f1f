use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn title(&self) -> &'static str {
        match self {
            Operation::Backup => "Backup",
            Operation::Restore => "Restore",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        })
    }
}

/// One backup or restore binding a repository to a local path.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub repository: Repository,
    /// Backup source, or restore target.
    pub local_path: PathBuf,
    /// Literal path globs handed to the engine in order. Backup only.
    pub excludes: Vec<String>,
    pub operation: Operation,
    /// Absolute paths expected to exist under the target after a restore.
    pub verify_paths: Vec<PathBuf>,
}

impl Task {
    pub fn backup(
        name: impl Into<String>,
        repository: Repository,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self::new(name, repository, source, Operation::Backup)
    }

    pub fn restore(
        name: impl Into<String>,
        repository: Repository,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self::new(name, repository, target, Operation::Restore)
    }

    fn new(
        name: impl Into<String>,
        repository: Repository,
        local_path: impl Into<PathBuf>,
        operation: Operation,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            local_path: local_path.into(),
            excludes: Vec::new(),
            operation,
            verify_paths: Vec::new(),
        }
    }

    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verify_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.verify_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}
