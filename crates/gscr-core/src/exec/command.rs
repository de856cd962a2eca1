//! Single-command execution.
//!
//! The executor never returns early with the child still running: every
//! path through here either never spawned, or has waited for the process to
//! terminate. Elevation, when requested, is entered after the risk gate and
//! left before the result is handed back, success or not.

use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::{Child, Command};

use super::output::{self, CaptureError, Captured};
use super::{terminate, CancelToken, CommandResult, ExecFailure, WATCHDOG_INTERVAL};
use crate::config::spec::RiskLevel;
use crate::expand::runtime::RuntimeCommand;
use crate::logging::{Level, Logger, Record};
use crate::privilege::{self, PrivilegeManager};

pub struct ExecContext<'a> {
    pub privilege: &'a PrivilegeManager,
    pub logger: &'a Logger,
    pub cancel: CancelToken,
}

/// Run one expanded command to completion and report what happened. Policy
/// refusals, spawn failures and abnormal terminations are all embedded in
/// the result; the group layer decides control flow.
pub async fn execute(ctx: &ExecContext<'_>, cmd: &RuntimeCommand) -> CommandResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    let finish = |stdout: String, stderr: String, exit_code: Option<i32>, error: Option<ExecFailure>| {
        CommandResult {
            name: cmd.name.clone(),
            group: cmd.group.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms: clock.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            timeout_secs: cmd.effective_timeout,
            privileged: cmd.is_privileged(),
            error,
        }
    };

    if let Err(e) = privilege::check_risk(&cmd.name, cmd.risk, cmd.max_risk_level) {
        return finish(String::new(), String::new(), None, Some(ExecFailure::RiskPolicy(e.to_string())));
    }
    if cmd.is_privileged() && cmd.risk < RiskLevel::High {
        let refusal = privilege::PrivilegeError::PrivilegedRiskTooLow {
            command: cmd.name.clone(),
            risk: cmd.risk.as_str(),
        };
        return finish(
            String::new(),
            String::new(),
            None,
            Some(ExecFailure::RiskPolicy(refusal.to_string())),
        );
    }

    let _elevation = if cmd.is_privileged() {
        match ctx
            .privilege
            .elevate(
                &cmd.name,
                cmd.run_as_user.as_deref(),
                cmd.run_as_group.as_deref(),
                std::path::Path::new(&cmd.program),
            )
            .await
        {
            Ok(guard) => Some(guard),
            Err(e) => {
                return finish(
                    String::new(),
                    String::new(),
                    None,
                    Some(ExecFailure::Privilege(e.to_string())),
                );
            }
        }
    } else {
        None
    };

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .env_clear()
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.workdir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return finish(
                String::new(),
                String::new(),
                None,
                Some(ExecFailure::Spawn(e.to_string())),
            );
        }
    };
    let pid = child.id().map(|p| p as i32).unwrap_or(-1);
    tracing::debug!(command = %cmd.name, group = %cmd.group, pid, "spawned");

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let limit = cmd.output_size_limit;

    let stdout_task = tokio::spawn(capture_stdout(
        stdout_pipe,
        cmd.output.as_ref().map(|p| p.as_path().to_path_buf()),
        limit,
        pid,
    ));
    let stderr_task = tokio::spawn(async move {
        match stderr_pipe {
            Some(pipe) => {
                let captured = output::drain_limited(pipe, limit).await;
                if matches!(captured.error, Some(CaptureError::Overflow { .. })) {
                    terminate(pid).await;
                }
                captured
            }
            None => Captured {
                bytes: Vec::new(),
                error: None,
            },
        }
    });

    let watchdog = if cmd.effective_timeout == 0 {
        Some(spawn_watchdog(ctx.logger.clone(), cmd, pid))
    } else {
        None
    };

    let (status, mut failure) = wait_for_exit(&mut child, cmd.effective_timeout, &ctx.cancel, pid).await;

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    let (stdout, stdout_err) = join_capture(stdout_task).await;
    let (stderr, stderr_err) = join_capture(stderr_task).await;
    if failure.is_none() {
        failure = capture_failure(stdout_err).or_else(|| capture_failure(stderr_err));
    }

    let exit_code = status.and_then(|s| s.code());
    if failure.is_none() && exit_code.is_none() {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.and_then(|s| s.signal()) {
            failure = Some(ExecFailure::Signal(sig));
        }
    }

    finish(stdout, stderr, exit_code, failure)
}

async fn capture_stdout(
    pipe: Option<tokio::process::ChildStdout>,
    output_file: Option<std::path::PathBuf>,
    limit: u64,
    pid: i32,
) -> Captured {
    let Some(pipe) = pipe else {
        return Captured {
            bytes: Vec::new(),
            error: None,
        };
    };
    let captured = match output_file {
        Some(path) => {
            let file = {
                let mut opts = tokio::fs::OpenOptions::new();
                opts.create(true).write(true).truncate(true).mode(0o600);
                opts.open(&path).await
            };
            match file {
                Ok(file) => output::drain_to_file(pipe, file, limit).await,
                Err(e) => Captured {
                    bytes: Vec::new(),
                    error: Some(CaptureError::Io(e)),
                },
            }
        }
        None => output::drain_limited(pipe, limit).await,
    };
    if captured.error.is_some() {
        // Overflow or a dead output file: stop the producer.
        terminate(pid).await;
    }
    captured
}

fn spawn_watchdog(
    logger: Logger,
    cmd: &RuntimeCommand,
    pid: i32,
) -> tokio::task::JoinHandle<()> {
    let name = cmd.name.clone();
    let group = cmd.group.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + WATCHDOG_INTERVAL,
            WATCHDOG_INTERVAL,
        );
        loop {
            ticks.tick().await;
            let elapsed_s = started.elapsed().as_secs();
            tracing::warn!(command = %name, group = %group, pid, elapsed_s, "command still running without a timeout");
            logger.log(
                Record::new(Level::Warn, "command still running without a timeout")
                    .attr("command", name.as_str())
                    .attr("group", group.as_str())
                    .attr("pid", pid as i64)
                    .attr("elapsed_s", elapsed_s),
            );
        }
    })
}

async fn wait_for_exit(
    child: &mut Child,
    timeout_secs: u64,
    cancel: &CancelToken,
    pid: i32,
) -> (Option<std::process::ExitStatus>, Option<ExecFailure>) {
    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let waited = if timeout_secs > 0 {
        tokio::select! {
            res = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()) => match res {
                Ok(inner) => Waited::Exited(inner),
                Err(_) => Waited::TimedOut,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        }
    } else {
        tokio::select! {
            res = child.wait() => Waited::Exited(res),
            _ = cancel.cancelled() => Waited::Cancelled,
        }
    };

    match waited {
        Waited::Exited(Ok(status)) => (Some(status), None),
        Waited::Exited(Err(e)) => (None, Some(ExecFailure::Spawn(format!("wait failed: {e}")))),
        Waited::TimedOut => {
            terminate(pid).await;
            let status = child.wait().await.ok();
            (status, Some(ExecFailure::Timeout(timeout_secs)))
        }
        Waited::Cancelled => {
            terminate(pid).await;
            let status = child.wait().await.ok();
            (status, Some(ExecFailure::Cancelled))
        }
    }
}

async fn join_capture(task: tokio::task::JoinHandle<Captured>) -> (String, Option<CaptureError>) {
    match task.await {
        Ok(captured) => captured.into_lossy_string(),
        Err(_) => (String::new(), None),
    }
}

fn capture_failure(err: Option<CaptureError>) -> Option<ExecFailure> {
    match err {
        Some(CaptureError::Overflow { limit }) => Some(ExecFailure::OutputOverflow(limit)),
        Some(CaptureError::Io(e)) => Some(ExecFailure::OutputIo(e.to_string())),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::timeout::{Timeout, TimeoutLevel, TimeoutResolution};
    use std::collections::BTreeMap;

    fn runtime_command(program: &str, args: &[&str]) -> RuntimeCommand {
        RuntimeCommand {
            name: "test".to_string(),
            group: "g".to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            workdir: None,
            output: None,
            timeout: Timeout::Unset,
            effective_timeout: 60,
            timeout_resolution: TimeoutResolution {
                seconds: 60,
                level: TimeoutLevel::Default,
                command_name: "test".to_string(),
                group_name: "g".to_string(),
            },
            risk: RiskLevel::Low,
            max_risk_level: RiskLevel::Low,
            run_as_user: None,
            run_as_group: None,
            output_size_limit: 1024 * 1024,
        }
    }

    fn context<'a>(
        privilege: &'a PrivilegeManager,
        logger: &'a Logger,
        cancel: CancelToken,
    ) -> ExecContext<'a> {
        ExecContext {
            privilege,
            logger,
            cancel,
        }
    }

    #[tokio::test]
    async fn echo_succeeds_with_captured_stdout() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let cmd = runtime_command("/bin/echo", &["hello"]);
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.exit_code, Some(0));
        assert!(result.succeeded());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let cmd = runtime_command("/bin/sh", &["-c", "exit 3"]);
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.succeeded());
        assert_eq!(result.failure_tag(), Some("command_failed"));
    }

    #[tokio::test]
    async fn spawn_failure_is_embedded() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let cmd = runtime_command("/nonexistent/binary", &[]);
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.failure_tag(), Some("exec_spawn_failed"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let mut cmd = runtime_command("/bin/sleep", &["30"]);
        cmd.effective_timeout = 1;
        let started = Instant::now();
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.failure_tag(), Some("exec_timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_terminates_unlimited_command() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let mut cmd = runtime_command("/bin/sleep", &["30"]);
        cmd.effective_timeout = 0;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.failure_tag(), Some("exec_cancelled"));
    }

    #[tokio::test]
    async fn output_overflow_kills_and_reports_partial() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let mut cmd = runtime_command("/bin/sh", &["-c", "yes overflow | head -c 100000; sleep 30"]);
        cmd.effective_timeout = 30;
        cmd.output_size_limit = 512;
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.failure_tag(), Some("output_overflow"));
        assert_eq!(result.stdout.len(), 512);
    }

    #[tokio::test]
    async fn risk_above_maximum_refused_without_spawn() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let mut cmd = runtime_command("/bin/echo", &["never"]);
        cmd.risk = RiskLevel::High;
        cmd.max_risk_level = RiskLevel::Low;
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.failure_tag(), Some("risk_policy_violation"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn env_is_exactly_the_merged_map() {
        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let mut cmd = runtime_command("/bin/sh", &["-c", "echo \"$ONLY_VAR:$HOME\""]);
        cmd.env.insert("ONLY_VAR".to_string(), "present".to_string());
        let result = execute(&ctx, &cmd).await;
        assert_eq!(result.stdout.trim(), "present:");
    }

    #[tokio::test]
    async fn stdout_streams_to_output_file() {
        use crate::safety::path::{PathValidator, ValidateOptions};

        let privilege = PrivilegeManager::new();
        let logger = Logger::disabled();
        let (_handle, cancel) = super::super::cancel_pair();
        let ctx = context(&privilege, &logger, cancel);

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("captured.txt");
        let validated =
            PathValidator::validate(out_path.to_str().unwrap(), &ValidateOptions::default())
                .unwrap();

        let mut cmd = runtime_command("/bin/echo", &["to-file"]);
        cmd.output = Some(validated);
        let result = execute(&ctx, &cmd).await;
        assert!(result.succeeded());
        assert_eq!(
            std::fs::read_to_string(&out_path).unwrap().trim(),
            "to-file"
        );
        // Mirrored for the summary as well.
        assert_eq!(result.stdout.trim(), "to-file");
    }
}
