//! Signal handling for SIGINT, SIGTERM and SIGHUP.
//!
//! A signal cancels the run's token: the running engine call is asked to
//! terminate, no further tasks start, and the caller renders whatever partial
//! status exists before exiting with `128 + signal number`.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ShutdownSignal {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
            ShutdownSignal::Hangup => 129,
        }
    }
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by the process runner and the orchestrator.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for a shutdown signal, then cancel the token.
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        let hangup = async {
            signal::unix::signal(signal::unix::SignalKind::hangup())
                .expect("Failed to install SIGHUP handler")
                .recv()
                .await;
        };

        let received = tokio::select! {
            _ = ctrl_c => ShutdownSignal::Interrupt,
            _ = terminate => ShutdownSignal::Terminate,
            _ = hangup => ShutdownSignal::Hangup,
        };

        info!(signal = ?received, "received shutdown signal, cancelling run");
        self.token.cancel();
        received
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// How work raced against a shutdown trigger ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T, S> {
    Completed(T),
    /// `output` is `None` when the work did not wind down within the drain window.
    Interrupted { signal: S, output: Option<T> },
}

/// Drive `work` until it finishes or `shutdown` fires. After a shutdown the
/// work keeps being polled for up to `drain` so a running child process gets
/// its SIGTERM and grace period instead of being killed when dropped.
pub async fn drain_on_shutdown<F, S>(
    work: F,
    shutdown: S,
    drain: Duration,
) -> Outcome<F::Output, S::Output>
where
    F: Future,
    S: Future,
{
    tokio::pin!(work);

    tokio::select! {
        output = &mut work => Outcome::Completed(output),
        signal = shutdown => {
            let output = tokio::time::timeout(drain, &mut work).await.ok();
            if output.is_none() {
                warn!(drain_secs = drain.as_secs_f64(), "work did not stop within the drain window");
            }
            Outcome::Interrupted { signal, output }
        }
    }
}
