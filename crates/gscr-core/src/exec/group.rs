//! Group execution and the per-group summary record.
//!
//! Groups run sequentially in the deterministic schedule order. Within a
//! group, commands run in declaration order and the first failure stops the
//! group; later groups still run, and the process exit code reflects any
//! failure. One summary record is emitted per attempted group, after its
//! last command has fully terminated.

use std::time::Instant;

use thiserror::Error;

use super::command::{execute, ExecContext};
use super::schedule::{self, ScheduleError};
use super::{CancelToken, CommandResult, ExecFailure};
use crate::config::spec::{ConfigSpec, GroupSpec};
use crate::expand::runtime::{self, ExpandError, RuntimeGlobal};
use crate::logging::results::CommandResults;
use crate::logging::{Level, Logger, Record};
use crate::privilege::PrivilegeManager;
use crate::safety::hash::{Verifier, VerifyError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Success,
    Error,
    Cancelled,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct GroupOutcome {
    pub name: String,
    pub status: GroupStatus,
    pub results: Vec<CommandResult>,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub groups: Vec<GroupOutcome>,
}

impl RunOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.groups
            .iter()
            .all(|g| g.status == GroupStatus::Success)
    }
}

pub struct GroupRunner<'a> {
    pub spec: &'a ConfigSpec,
    pub global: &'a RuntimeGlobal,
    pub verifier: &'a Verifier,
    pub privilege: &'a PrivilegeManager,
    pub logger: &'a Logger,
    pub run_id: String,
    pub cancel: CancelToken,
    pub dry_run: bool,
}

impl GroupRunner<'_> {
    /// Run (or, in dry-run mode, plan) every group in schedule order.
    pub async fn run_all(&self) -> Result<RunOutcome, RunError> {
        let order = schedule::order_groups(&self.spec.groups)?;
        let mut outcome = RunOutcome::default();
        for idx in order {
            let group = &self.spec.groups[idx];
            if self.dry_run {
                self.plan_group(group)?;
                continue;
            }
            if self.cancel.is_cancelled() {
                tracing::warn!(group = %group.name, "run cancelled before group started");
                break;
            }
            outcome.groups.push(self.run_group(group).await);
        }
        Ok(outcome)
    }

    /// Execute one group to its first failure, then emit the summary.
    pub async fn run_group(&self, spec: &GroupSpec) -> GroupOutcome {
        let clock = Instant::now();
        let mut results: Vec<CommandResult> = Vec::new();

        let group = match runtime::expand_group(self.global, spec) {
            Ok(group) => group,
            Err(e) => {
                return self.fail_group(spec, clock, results, "group expansion failed", e.tag(), &e);
            }
        };

        for file in &group.verify_files {
            if let Err(e) = self.verifier.verify_file(file) {
                return self.fail_group(
                    spec,
                    clock,
                    results,
                    "group file verification failed",
                    "config_verification_failed",
                    &e,
                );
            }
        }

        let ctx = ExecContext {
            privilege: self.privilege,
            logger: self.logger,
            cancel: self.cancel.clone(),
        };

        let mut status = GroupStatus::Success;
        for command in &spec.commands {
            if self.cancel.is_cancelled() {
                status = GroupStatus::Cancelled;
                break;
            }
            let runtime_cmd =
                match runtime::expand_command(&self.spec.templates, self.global, &group, command) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        return self.fail_group(
                            spec,
                            clock,
                            results,
                            "command expansion failed",
                            e.tag(),
                            &e,
                        );
                    }
                };

            let result = execute(&ctx, &runtime_cmd).await;
            let failed = !result.succeeded();
            let cancelled = matches!(result.error, Some(ExecFailure::Cancelled));
            if let Some(tag) = result.failure_tag() {
                tracing::error!(
                    command = %result.name,
                    group = %spec.name,
                    tag,
                    exit_code = ?result.exit_code,
                    "command failed"
                );
            }
            results.push(result);
            if failed {
                status = if cancelled {
                    GroupStatus::Cancelled
                } else {
                    GroupStatus::Error
                };
                break;
            }
        }

        let outcome = GroupOutcome {
            name: spec.name.clone(),
            status,
            results,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        self.emit_summary(&outcome);
        outcome
    }

    /// Dry run: expand and verify exactly as a real run would, emit one plan
    /// record per command, spawn nothing.
    fn plan_group(&self, spec: &GroupSpec) -> Result<(), RunError> {
        let group = runtime::expand_group(self.global, spec)?;
        for file in &group.verify_files {
            self.verifier.verify_file(file)?;
        }
        for command in &spec.commands {
            let runtime_cmd =
                runtime::expand_command(&self.spec.templates, self.global, &group, command)?;
            self.logger.log(
                Record::new(Level::Info, "dry-run: planned command")
                    .attr("group", spec.name.as_str())
                    .attr("command", runtime_cmd.command_line())
                    .attr(
                        "working_directory",
                        runtime_cmd.workdir.as_deref().unwrap_or("."),
                    )
                    .attr("timeout", runtime_cmd.effective_timeout)
                    .attr(
                        "timeout_level",
                        runtime_cmd.timeout_resolution.level.as_str(),
                    ),
            );
        }
        Ok(())
    }

    fn fail_group(
        &self,
        spec: &GroupSpec,
        clock: Instant,
        results: Vec<CommandResult>,
        message: &str,
        tag: &str,
        error: &dyn std::fmt::Display,
    ) -> GroupOutcome {
        tracing::error!(group = %spec.name, tag, error = %error, "{message}");
        self.logger.log(
            Record::new(Level::Error, message)
                .attr("group", spec.name.as_str())
                .attr("tag", tag)
                .attr("error", error.to_string()),
        );
        let outcome = GroupOutcome {
            name: spec.name.clone(),
            status: GroupStatus::Error,
            results,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        self.emit_summary(&outcome);
        outcome
    }

    /// One record per group, INFO on success and ERROR otherwise, emitted
    /// only after every command in the group has fully terminated.
    fn emit_summary(&self, outcome: &GroupOutcome) {
        let level = match outcome.status {
            GroupStatus::Success => Level::Info,
            GroupStatus::Error | GroupStatus::Cancelled => Level::Error,
        };
        self.logger.log(
            Record::new(level, "command group summary")
                .attr("group", outcome.name.as_str())
                .attr("status", outcome.status.as_str())
                .attr("duration_ms", outcome.duration_ms)
                .attr("run_id", self.run_id.as_str())
                .attr("slack_notify", true)
                .attr("message_type", "command_group_summary")
                .attr("commands", CommandResults(&outcome.results).to_value()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::envfilter::EnvSnapshot;
    use crate::exec::cancel_pair;
    use crate::expand::runtime::expand_global;
    use crate::logging::{LogHandler, Value};
    use std::sync::{Arc, Mutex};

    /// Collects every record for assertions.
    struct Sink(Mutex<Vec<Record>>);

    impl LogHandler for Sink {
        fn enabled(&self, _level: Level) -> bool {
            true
        }
        fn handle(&self, record: &Record) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn harness(cfg: &str) -> (ConfigSpec, RuntimeGlobal, Arc<Sink>, Logger) {
        let spec = load_config(cfg).unwrap();
        let global = expand_global(&spec, EnvSnapshot::from_entries([])).unwrap();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let logger = Logger::new(vec![sink.clone()]);
        (spec, global, sink, logger)
    }

    fn summaries(sink: &Sink) -> Vec<Record> {
        sink.0
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.message == "command group summary")
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn group_runs_to_completion_and_summarizes() {
        let (spec, global, sink, logger) = harness(
            r#"
            [[groups]]
            name = "greet"
            [[groups.commands]]
            name = "one"
            cmd = "/bin/echo"
            args = ["first"]
            [[groups.commands]]
            name = "two"
            cmd = "/bin/echo"
            args = ["second"]
            "#,
        );
        let verifier = Verifier::disabled();
        let privilege = PrivilegeManager::new();
        let (_handle, cancel) = cancel_pair();
        let runner = GroupRunner {
            spec: &spec,
            global: &global,
            verifier: &verifier,
            privilege: &privilege,
            logger: &logger,
            run_id: "run-1".to_string(),
            cancel,
            dry_run: false,
        };

        let outcome = runner.run_all().await.unwrap();
        assert!(outcome.all_succeeded());
        assert_eq!(outcome.groups[0].results.len(), 2);

        let summary = &summaries(&sink)[0];
        assert_eq!(summary.level, Level::Info);
        assert_eq!(summary.get("status"), Some(&Value::str("success")));
        assert_eq!(summary.get("run_id"), Some(&Value::str("run-1")));
        assert_eq!(
            summary.get("message_type"),
            Some(&Value::str("command_group_summary"))
        );
        let commands = summary.get("commands").unwrap().to_json();
        assert_eq!(commands["total_count"], 2);
        assert_eq!(commands["cmd_1"]["name"], "two");
    }

    #[tokio::test]
    async fn first_failure_stops_the_group() {
        let (spec, global, sink, logger) = harness(
            r#"
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "fails"
            cmd = "/bin/sh"
            args = ["-c", "exit 7"]
            [[groups.commands]]
            name = "never-runs"
            cmd = "/bin/echo"
            args = ["unreachable"]
            "#,
        );
        let verifier = Verifier::disabled();
        let privilege = PrivilegeManager::new();
        let (_handle, cancel) = cancel_pair();
        let runner = GroupRunner {
            spec: &spec,
            global: &global,
            verifier: &verifier,
            privilege: &privilege,
            logger: &logger,
            run_id: "run-2".to_string(),
            cancel,
            dry_run: false,
        };

        let outcome = runner.run_all().await.unwrap();
        assert!(!outcome.all_succeeded());
        assert_eq!(outcome.groups[0].status, GroupStatus::Error);
        assert_eq!(outcome.groups[0].results.len(), 1);
        assert_eq!(outcome.groups[0].results[0].exit_code, Some(7));

        let summary = &summaries(&sink)[0];
        assert_eq!(summary.level, Level::Error);
        assert_eq!(summary.get("status"), Some(&Value::str("error")));
    }

    #[tokio::test]
    async fn later_groups_still_run_after_a_failure() {
        let (spec, global, sink, logger) = harness(
            r#"
            [[groups]]
            name = "bad"
            [[groups.commands]]
            name = "fails"
            cmd = "/bin/false"
            [[groups]]
            name = "good"
            [[groups.commands]]
            name = "ok"
            cmd = "/bin/true"
            "#,
        );
        let verifier = Verifier::disabled();
        let privilege = PrivilegeManager::new();
        let (_handle, cancel) = cancel_pair();
        let runner = GroupRunner {
            spec: &spec,
            global: &global,
            verifier: &verifier,
            privilege: &privilege,
            logger: &logger,
            run_id: "run-3".to_string(),
            cancel,
            dry_run: false,
        };

        let outcome = runner.run_all().await.unwrap();
        assert_eq!(outcome.groups.len(), 2);
        assert_eq!(outcome.groups[0].status, GroupStatus::Error);
        assert_eq!(outcome.groups[1].status, GroupStatus::Success);
        assert_eq!(summaries(&sink).len(), 2);
    }

    #[tokio::test]
    async fn expansion_failure_fails_the_group_before_spawning() {
        let (spec, global, sink, logger) = harness(
            r#"
            [global]
            env_allowed = ["PATH"]

            [[groups]]
            name = "locked"
            env_allowed = []
            [[groups.commands]]
            name = "wants-path"
            cmd = "/bin/true"
            env_import = ["PATH"]
            "#,
        );
        let verifier = Verifier::disabled();
        let privilege = PrivilegeManager::new();
        let (_handle, cancel) = cancel_pair();
        let runner = GroupRunner {
            spec: &spec,
            global: &global,
            verifier: &verifier,
            privilege: &privilege,
            logger: &logger,
            run_id: "run-4".to_string(),
            cancel,
            dry_run: false,
        };

        let outcome = runner.run_all().await.unwrap();
        assert_eq!(outcome.groups[0].status, GroupStatus::Error);
        assert!(outcome.groups[0].results.is_empty());

        let records = sink.0.lock().unwrap();
        let failure = records
            .iter()
            .find(|r| r.message == "command expansion failed")
            .unwrap();
        assert_eq!(
            failure.get("tag"),
            Some(&Value::str("env_import_not_allowed"))
        );
    }

    #[tokio::test]
    async fn dry_run_plans_without_spawning() {
        let (spec, global, sink, logger) = harness(
            r#"
            [global]
            timeout = 0

            [[groups]]
            name = "plan-me"
            [[groups.commands]]
            name = "sleepy"
            cmd = "/bin/sleep"
            args = ["5"]
            "#,
        );
        let verifier = Verifier::disabled();
        let privilege = PrivilegeManager::new();
        let (_handle, cancel) = cancel_pair();
        let runner = GroupRunner {
            spec: &spec,
            global: &global,
            verifier: &verifier,
            privilege: &privilege,
            logger: &logger,
            run_id: "run-5".to_string(),
            cancel,
            dry_run: true,
        };

        let started = Instant::now();
        let outcome = runner.run_all().await.unwrap();
        assert!(started.elapsed().as_secs() < 2, "nothing was executed");
        assert!(outcome.groups.is_empty());

        {
            let records = sink.0.lock().unwrap();
            let plan = records
                .iter()
                .find(|r| r.message == "dry-run: planned command")
                .unwrap();
            assert_eq!(plan.get("command"), Some(&Value::str("/bin/sleep 5")));
            assert_eq!(plan.get("timeout"), Some(&Value::Uint(0)));
            assert_eq!(plan.get("timeout_level"), Some(&Value::str("global")));
        }
        assert!(summaries(&sink).is_empty());
    }
}
