//! External command execution.
//!
//! Everything above this layer talks to a [`CommandRunner`] instead of spawning
//! processes directly:
//! - [`runner::ProcessRunner`] is the production implementation built on
//!   `tokio::process`, with timeout and cancellation support.
//! - `testing::ScriptedRunner` (tests and the `testing` feature) replays canned
//!   engine output and records every invocation, so orchestration logic can be
//!   tested without a real engine.

pub mod runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

pub use runner::ProcessRunner;

/// A fully described external command.
#[derive(Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Overlay on top of the inherited environment. Values may be secrets.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Treat a nonzero exit status as [`ProcessError::Exit`].
    pub check: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout,
            check: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    /// Command line suitable for logs. Never includes the environment.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("check", &self.check)
            .finish()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("command exited with status {exit_code}: {}", stderr.trim())]
    Exit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("timeout: command did not finish within {}s", timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("command cancelled by shutdown request")]
    Cancelled,
}

impl ProcessError {
    /// Combined text used for error classification: stderr first, then stdout.
    pub fn text(&self) -> String {
        match self {
            ProcessError::Exit { stdout, stderr, .. } => {
                if stdout.trim().is_empty() {
                    stderr.clone()
                } else {
                    format!("{stderr}\n{stdout}")
                }
            }
            other => other.to_string(),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Rebuild the process output carried by an exit failure.
    pub fn into_output(self) -> ProcessOutput {
        match self {
            ProcessError::Exit {
                exit_code,
                stdout,
                stderr,
            } => ProcessOutput {
                exit_code,
                stdout,
                stderr,
            },
            other => ProcessOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: other.to_string(),
            },
        }
    }
}

/// Trait abstracting how external commands are executed.
///
/// Implementations must capture both output streams in full and must not
/// retry; retry policy lives in [`crate::retry`].
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<ProcessOutput, ProcessError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_env_values() {
        let mut env = BTreeMap::new();
        env.insert("RESTIC_PASSWORD".to_string(), "hunter2".to_string());
        let inv = Invocation::new("restic", Duration::from_secs(1))
            .arg("snapshots")
            .envs(env);

        let rendered = format!("{inv:?}");
        assert!(rendered.contains("RESTIC_PASSWORD"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(inv.command_line(), "restic snapshots");
    }

    #[test]
    fn test_error_text_combines_streams() {
        let err = ProcessError::Exit {
            exit_code: 1,
            stdout: "partial output".into(),
            stderr: "Fatal: unexpected EOF".into(),
        };
        let text = err.text();
        assert!(text.starts_with("Fatal: unexpected EOF"));
        assert!(text.contains("partial output"));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_timeout_text_mentions_timeout() {
        let err = ProcessError::Timeout {
            timeout: Duration::from_secs(30),
        };
        assert!(err.text().contains("timeout"));
    }
}
