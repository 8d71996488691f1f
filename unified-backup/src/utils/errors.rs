//! Custom error types for the orchestrator.

use thiserror::Error;

use crate::engine::classify;
use crate::process::ProcessError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Fatal precondition: {0}")]
    FatalPrecondition(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Engine output could not be parsed: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    #[error("no snapshots found in repository '{0}'")]
    NoSnapshot(String),

    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("Task '{task}' references unknown repository '{repository}'")]
    UnknownRepository { task: String, repository: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error taxonomy used to decide whether a failure aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Aborts the whole run before any task executes.
    FatalPrecondition,
    /// Network or service trouble; retried before it ever surfaces.
    TransientExternal,
    /// Engine rejected the call outright (auth, corruption, bad arguments).
    PermanentExternal,
    /// Orchestration-level problem such as a missing snapshot.
    LogicError,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::FatalPrecondition(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::UnknownRepository { .. } => ErrorKind::FatalPrecondition,
            OrchestratorError::Process(err) if classify::is_transient(&err.text()) => {
                ErrorKind::TransientExternal
            }
            OrchestratorError::Process(_)
            | OrchestratorError::MalformedOutput(_)
            | OrchestratorError::Io(_) => ErrorKind::PermanentExternal,
            OrchestratorError::NoSnapshot(_) | OrchestratorError::DuplicateTask(_) => {
                ErrorKind::LogicError
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalPrecondition
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let transient = OrchestratorError::Process(ProcessError::Exit {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Fatal: connection reset by peer".to_string(),
        });
        assert_eq!(transient.kind(), ErrorKind::TransientExternal);

        let permanent = OrchestratorError::Process(ProcessError::Exit {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Fatal: wrong password or no key found".to_string(),
        });
        assert_eq!(permanent.kind(), ErrorKind::PermanentExternal);

        assert_eq!(
            OrchestratorError::NoSnapshot("vm".into()).kind(),
            ErrorKind::LogicError
        );
        assert!(OrchestratorError::FatalPrecondition("not root".into()).is_fatal());
    }

    #[test]
    fn test_no_snapshot_message() {
        let err = OrchestratorError::NoSnapshot("vm".into());
        assert!(err.to_string().contains("no snapshot"));
    }
}
