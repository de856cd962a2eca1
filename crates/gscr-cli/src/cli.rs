//! Command-line surface of the runner.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "gscr",
    version,
    about = "Safe command runner with pre-execution integrity verification"
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH")]
    pub config: String,

    /// Optional KEY=value environment file, hash-verified before loading.
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<String>,

    /// Hash manifest directory; overrides GSCR_HASH_DIRECTORY and the
    /// compile-time default.
    #[arg(long, value_name = "PATH")]
    pub hash_directory: Option<String>,

    /// Skip hash verification entirely. Paths are still validated.
    #[arg(long, env = "GSCR_DISABLE_VERIFICATION")]
    pub disable_verification: bool,

    /// Log level: debug, info, warn or error. Defaults to the config's
    /// log_level, then info.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Write the audit log to a file in this directory instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub log_dir: Option<String>,

    /// Print the planned commands and exit without spawning anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses() {
        let cli = Cli::try_parse_from(["gscr", "--config", "/etc/gscr/run.toml"]).unwrap();
        assert_eq!(cli.config, "/etc/gscr/run.toml");
        assert!(!cli.dry_run);
        assert!(!cli.disable_verification);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["gscr"]).is_err());
    }

    #[test]
    fn all_flags_parse() {
        let cli = Cli::try_parse_from([
            "gscr",
            "--config",
            "/c.toml",
            "--env-file",
            "/e.env",
            "--hash-directory",
            "/hashes",
            "--disable-verification",
            "--log-level",
            "debug",
            "--log-dir",
            "/var/log/gscr",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.env_file.as_deref(), Some("/e.env"));
        assert_eq!(cli.hash_directory.as_deref(), Some("/hashes"));
        assert!(cli.disable_verification);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.dry_run);
    }
}
