//! Stable exit codes.
//!
//! Pre-execution failures get distinct codes so wrappers can tell a
//! tampered config from a missing hash directory without parsing stderr.

use gscr_core::RunnerError;

/// Every group ran and every command exited zero.
pub const EXIT_SUCCESS: i32 = 0;

/// At least one command failed (or a group was cancelled).
pub const EXIT_COMMAND_FAILURE: i32 = 1;

/// Configuration rejected: parse error, schema violation, bad template or
/// variable reference, scheduling error.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Hash verification failed for the config file.
pub const EXIT_VERIFICATION_FAILURE: i32 = 3;

/// The hash directory failed its ownership/permission policy.
pub const EXIT_HASH_DIR_ERROR: i32 = 4;

/// The audit log pipeline could not be configured.
pub const EXIT_LOGGING_ERROR: i32 = 5;

/// Map a pre-execution error onto its exit code.
pub fn for_error(err: &RunnerError) -> i32 {
    match err {
        RunnerError::HashDir(_) => EXIT_HASH_DIR_ERROR,
        RunnerError::Verify(_) => EXIT_VERIFICATION_FAILURE,
        RunnerError::LoggingSetup(_) => EXIT_LOGGING_ERROR,
        _ => EXIT_CONFIG_ERROR,
    }
}
