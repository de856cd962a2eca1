//! Pre-execution pipeline.
//!
//! Strict linear order; any failure aborts with a `[CRITICAL]` stderr line
//! and a distinct exit code. No value read from a configured file may
//! influence a step that runs before that file's own verification — the
//! hash directory in particular is resolved purely from startup inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use gscr_core::config::{self, ConfigSpec};
use gscr_core::envfilter::EnvSnapshot;
use gscr_core::exec::{cancel_pair, CancelToken, GroupRunner};
use gscr_core::expand::runtime::{expand_global, RuntimeGlobal};
use gscr_core::logging::redact::{Redactor, RedactingHandler};
use gscr_core::logging::{JsonLineHandler, Level, Logger, Record};
use gscr_core::notify::{Notifier, SlackConfig};
use gscr_core::privilege::PrivilegeManager;
use gscr_core::safety::hash::{resolve_hash_dir, Verifier};
use gscr_core::RunnerError;

use crate::cli::Cli;
use crate::envfile;
use crate::exit_codes;

pub async fn run(cli: Cli) -> i32 {
    match pipeline(cli).await {
        Ok(code) => code,
        Err(err) => {
            critical(&err);
            exit_codes::for_error(&err)
        }
    }
}

fn critical(err: &RunnerError) {
    eprintln!("[CRITICAL] {}: {}: {err}", err.component(), err.tag());
    tracing::error!(component = err.component(), tag = err.tag(), error = %err, "pre-execution failure");
}

async fn pipeline(cli: Cli) -> Result<i32, RunnerError> {
    // Webhook discovery happens before anything else configurable so a
    // misconfigured notification setup cannot be masked by a later failure.
    let slack = SlackConfig::from_env()?;

    // Hash directory and verifier come only from startup inputs.
    let verifier = if cli.disable_verification {
        tracing::warn!("hash verification disabled");
        Verifier::disabled()
    } else {
        let hash_dir = resolve_hash_dir(cli.hash_directory.as_deref())?;
        Verifier::new(hash_dir)
    };

    // Config file: verify, then read.
    let config_path = verifier.verify_file(&cli.config)?;
    let text = std::fs::read_to_string(config_path.as_path()).map_err(|e| {
        RunnerError::Verify(gscr_core::safety::hash::VerifyError::Io {
            path: config_path.to_string(),
            source: e,
        })
    })?;
    let spec = config::load_config(&text)?;

    // Optional env file: verification failure is a warning, not an abort;
    // the file is simply not loaded.
    let env_file_entries = load_env_file(&verifier, cli.env_file.as_deref());

    // The single read of the process environment, overlaid with the trusted
    // env-file entries.
    let mut snapshot: BTreeMap<String, String> = std::env::vars().collect();
    snapshot.extend(env_file_entries);
    let global = expand_global(&spec, EnvSnapshot::from_entries(snapshot))?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let (logger, notifier) = setup_logging(&cli, &spec, &global, &slack, &run_id)?;

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel_handle.cancel();
        }
    });

    let code = execute(&cli, &spec, &global, &verifier, &logger, run_id, cancel).await?;

    if let Some(notifier) = notifier {
        notifier.shutdown().await;
    }
    Ok(code)
}

fn load_env_file(verifier: &Verifier, path: Option<&str>) -> BTreeMap<String, String> {
    let Some(path) = path else {
        return BTreeMap::new();
    };
    let verified = match verifier.verify_file(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("warning: env file not loaded: {e}");
            tracing::warn!(path = %path, error = %e, "env file verification failed; not loaded");
            return BTreeMap::new();
        }
    };
    let text = match std::fs::read_to_string(verified.as_path()) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "env file unreadable; not loaded");
            return BTreeMap::new();
        }
    };
    match envfile::parse(&text) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "env file malformed; not loaded");
            BTreeMap::new()
        }
    }
}

fn setup_logging(
    cli: &Cli,
    _spec: &ConfigSpec,
    global: &RuntimeGlobal,
    slack: &SlackConfig,
    run_id: &str,
) -> Result<(Logger, Option<Notifier>), RunnerError> {
    let min_level = match cli.log_level.as_deref() {
        Some(raw) => Level::parse(raw).ok_or_else(|| {
            RunnerError::LoggingSetup(format!("invalid --log-level `{raw}`"))
        })?,
        None => global.log_level,
    };

    let line_handler = match cli.log_dir.as_deref() {
        Some(dir) => {
            let path = std::path::Path::new(dir).join(format!("gscr_{run_id}.log"));
            JsonLineHandler::file(&path, min_level).map_err(|e| {
                RunnerError::LoggingSetup(format!(
                    "cannot open log file {}: {e}",
                    path.display()
                ))
            })?
        }
        None => JsonLineHandler::stdout(min_level),
    };

    let mut inner: Vec<Arc<dyn gscr_core::logging::LogHandler>> = vec![Arc::new(line_handler)];
    let notifier = if slack.is_enabled() {
        let notifier = Notifier::spawn();
        inner.extend(notifier.handlers(slack));
        Some(notifier)
    } else {
        None
    };

    let redacting = RedactingHandler::new(Redactor::new(), inner);
    Ok((Logger::new(vec![Arc::new(redacting)]), notifier))
}

async fn execute(
    cli: &Cli,
    spec: &ConfigSpec,
    global: &RuntimeGlobal,
    verifier: &Verifier,
    logger: &Logger,
    run_id: String,
    cancel: CancelToken,
) -> Result<i32, RunnerError> {
    // Global-level verify_files run before any group.
    for file in &global.verify_files {
        verifier.verify_file(file)?;
    }

    let privilege = PrivilegeManager::new();
    let runner = GroupRunner {
        spec,
        global,
        verifier,
        privilege: &privilege,
        logger,
        run_id: run_id.clone(),
        cancel,
        dry_run: cli.dry_run,
    };

    logger.log(
        Record::new(Level::Debug, "run starting")
            .attr("run_id", run_id.as_str())
            .attr("groups", spec.groups.len() as u64)
            .attr("dry_run", cli.dry_run),
    );

    let outcome = runner.run_all().await.map_err(RunnerError::from)?;
    if cli.dry_run {
        return Ok(exit_codes::EXIT_SUCCESS);
    }
    if outcome.all_succeeded() {
        Ok(exit_codes::EXIT_SUCCESS)
    } else {
        Ok(exit_codes::EXIT_COMMAND_FAILURE)
    }
}
