//! Crate-level error umbrella.
//!
//! Every pre-execution failure funnels into [`RunnerError`]; the CLI maps
//! the component and tag onto its `[CRITICAL]` stderr line and exit code.
//! Per-command runtime failures never appear here — they live inside
//! command results and stop only their group.

use thiserror::Error;

use crate::config::ConfigError;
use crate::envfilter::EnvFilterError;
use crate::exec::schedule::ScheduleError;
use crate::exec::RunError;
use crate::expand::runtime::ExpandError;
use crate::notify::NotifyError;
use crate::privilege::PrivilegeError;
use crate::safety::hash::{HashDirError, VerifyError};
use crate::safety::path::PathError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("hash directory: {0}")]
    HashDir(#[from] HashDirError),

    #[error("verification: {0}")]
    Verify(#[from] VerifyError),

    #[error("path validation: {0}")]
    Path(#[from] PathError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("expansion: {0}")]
    Expand(#[from] ExpandError),

    #[error("environment: {0}")]
    Env(#[from] EnvFilterError),

    #[error("privilege: {0}")]
    Privilege(#[from] PrivilegeError),

    #[error("scheduling: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("notification: {0}")]
    Notify(#[from] NotifyError),

    #[error("logging setup: {0}")]
    LoggingSetup(String),
}

impl RunnerError {
    /// Stable machine-readable failure tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::HashDir(_) => "hash_directory_validation",
            Self::Verify(_) => "config_verification_failed",
            Self::Path(_) => "path_validation_failed",
            Self::Config(e) => e.tag(),
            Self::Expand(e) => e.tag(),
            Self::Env(e) => e.tag(),
            Self::Privilege(e) => e.tag(),
            Self::Schedule(e) => e.tag(),
            Self::Notify(e) => e.tag(),
            Self::LoggingSetup(_) => "logging_setup_failed",
        }
    }

    /// Component name for the `[CRITICAL]` stderr prefix.
    pub fn component(&self) -> &'static str {
        match self {
            Self::HashDir(_) | Self::Verify(_) => "verification",
            Self::Path(_) => "validation",
            Self::Config(_) => "config",
            Self::Expand(_) | Self::Env(_) => "expansion",
            Self::Privilege(_) => "privilege",
            Self::Schedule(_) => "scheduler",
            Self::Notify(_) => "notify",
            Self::LoggingSetup(_) => "logging",
        }
    }
}

impl From<RunError> for RunnerError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Schedule(e) => Self::Schedule(e),
            RunError::Expand(e) => Self::Expand(e),
            RunError::Verify(e) => Self::Verify(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::path::{PathValidator, ValidateOptions};

    #[test]
    fn tags_and_components_are_stable() {
        let path_err = PathValidator::validate("", &ValidateOptions::default()).unwrap_err();
        let err = RunnerError::from(path_err);
        assert_eq!(err.tag(), "path_validation_failed");
        assert_eq!(err.component(), "validation");

        let cfg_err = crate::config::load_config("not toml [").unwrap_err();
        let err = RunnerError::from(cfg_err);
        assert_eq!(err.tag(), "config_parse_failed");
        assert_eq!(err.component(), "config");
    }
}
