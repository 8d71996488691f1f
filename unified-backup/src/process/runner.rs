//! Production command runner built on `tokio::process`.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandRunner, Invocation, ProcessError, ProcessOutput};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Spawns one child process per call.
///
/// When the cancellation token fires, the running child gets SIGTERM and a
/// grace period to exit on its own before it is killed.
#[derive(Clone)]
pub struct ProcessRunner {
    cancel: CancellationToken,
    grace_period: Duration,
}

enum Finished {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, ProcessError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        debug!(cmd = %invocation.command_line(), "spawning process");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        // Drain both pipes concurrently so a chatty child never blocks on a full buffer.
        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let finished = tokio::select! {
            res = tokio::time::timeout(invocation.timeout, child.wait()) => match res {
                Ok(status) => Finished::Exited(status),
                Err(_) => Finished::TimedOut,
            },
            _ = self.cancel.cancelled() => Finished::Cancelled,
        };

        let status = match finished {
            Finished::Exited(status) => status.map_err(|e| ProcessError::Spawn {
                program: invocation.program.clone(),
                message: format!("waiting for process: {e}"),
            })?,
            Finished::TimedOut => {
                warn!(
                    cmd = %invocation.command_line(),
                    timeout_secs = invocation.timeout.as_secs(),
                    "command timed out; terminating"
                );
                self.terminate(&mut child).await;
                stdout.abort();
                stderr.abort();
                return Err(ProcessError::Timeout {
                    timeout: invocation.timeout,
                });
            }
            Finished::Cancelled => {
                info!(cmd = %invocation.command_line(), "cancellation requested; terminating child process");
                self.terminate(&mut child).await;
                stdout.abort();
                stderr.abort();
                return Err(ProcessError::Cancelled);
            }
        };

        let stdout = join_output(stdout).await;
        let stderr = join_output(stderr).await;
        let exit_code = status.code().unwrap_or(-1);

        debug!(cmd = %invocation.command_line(), exit_code, "process exited");
        if !stdout.is_empty() {
            debug!("stdout:\n{}", stdout.trim_end());
        }
        if !stderr.is_empty() {
            debug!("stderr:\n{}", stderr.trim_end());
        }

        if invocation.check && !status.success() {
            return Err(ProcessError::Exit {
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(self.grace_period, child.wait())
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    warn!(pid, "child ignored SIGTERM; killing");
                }
                Err(e) => warn!(pid, error = %e, "failed to send SIGTERM"),
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill child process");
        }
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<ProcessOutput, ProcessError>> {
        Box::pin(self.execute(invocation))
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            warn!(error = %e, "failed to read child output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn join_output(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> Invocation {
        Invocation::new("sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let runner = ProcessRunner::new(CancellationToken::new());
        let inv = sh("echo out; echo err >&2", Duration::from_secs(10));

        let output = runner.run(&inv).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_env_overlay_is_visible_to_child() {
        let runner = ProcessRunner::new(CancellationToken::new());
        let mut env = std::collections::BTreeMap::new();
        env.insert("UB_TEST_VALUE".to_string(), "overlay".to_string());
        let inv = sh("printf %s \"$UB_TEST_VALUE\"", Duration::from_secs(10)).envs(env);

        let output = runner.run(&inv).await.unwrap();
        assert_eq!(output.stdout, "overlay");
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_check() {
        let runner = ProcessRunner::new(CancellationToken::new());
        let inv = sh("echo boom >&2; exit 3", Duration::from_secs(10));

        match runner.run(&inv).await {
            Err(ProcessError::Exit {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_check() {
        let runner = ProcessRunner::new(CancellationToken::new());
        let inv = sh("exit 2", Duration::from_secs(10)).unchecked();

        let output = runner.run(&inv).await.unwrap();
        assert_eq!(output.exit_code, 2);
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner =
            ProcessRunner::new(CancellationToken::new()).with_grace_period(Duration::from_millis(100));
        let inv = sh("sleep 5", Duration::from_millis(100));

        let err = runner.run(&inv).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child() {
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new(cancel.clone()).with_grace_period(Duration::from_millis(100));
        let inv = sh("sleep 5", Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = runner.run(&inv).await.unwrap_err();
        assert_eq!(err, ProcessError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = ProcessRunner::new(CancellationToken::new());
        let inv = Invocation::new("definitely-not-a-real-binary-ub", Duration::from_secs(1));

        let err = runner.run(&inv).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
