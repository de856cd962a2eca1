//! Command and group execution.

pub mod command;
pub mod group;
pub mod output;
pub mod schedule;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;

pub use command::{execute, ExecContext};
pub use group::{GroupOutcome, GroupRunner, GroupStatus, RunError, RunOutcome};

/// Grace between SIGTERM and SIGKILL on timeout, cancellation or overflow.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Warning cadence for commands running without a deadline.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Why a command did not complete normally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecFailure {
    #[error("failed to spawn: {0}")]
    Spawn(String),

    #[error("timed out after {0} s")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("output exceeded the {0}-byte limit")]
    OutputOverflow(u64),

    #[error("output I/O error: {0}")]
    OutputIo(String),

    #[error("killed by signal {0}")]
    Signal(i32),

    #[error("{0}")]
    Privilege(String),

    #[error("risk policy: {0}")]
    RiskPolicy(String),
}

impl ExecFailure {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "exec_spawn_failed",
            Self::Timeout(_) => "exec_timeout",
            Self::Cancelled => "exec_cancelled",
            Self::OutputOverflow(_) => "output_overflow",
            Self::OutputIo(_) => "output_io_error",
            Self::Signal(_) => "exec_signal",
            Self::Privilege(_) => "privilege_escalation_failed",
            Self::RiskPolicy(_) => "risk_policy_violation",
        }
    }
}

/// Outcome of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub name: String,
    pub group: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub privileged: bool,
    pub error: Option<ExecFailure>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// Taxonomy tag for the failure, if any.
    pub fn failure_tag(&self) -> Option<&'static str> {
        match &self.error {
            Some(e) => Some(e.tag()),
            None if self.exit_code == Some(0) => None,
            None if self.privileged => Some("privileged_command_failure"),
            None => Some("command_failed"),
        }
    }
}

/// Cooperative cancellation, fanned out from one handle to any number of
/// token clones.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// SIGTERM, bounded wait, then SIGKILL. Safe to call on an already-dead pid.
pub(crate) async fn terminate(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid);
    let _ = kill(target, Signal::SIGTERM);

    let start = std::time::Instant::now();
    while start.elapsed() < TERM_GRACE {
        if kill(target, None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = kill(target, Signal::SIGKILL);
}
