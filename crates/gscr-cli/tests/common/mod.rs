//! Shared fixture for end-to-end runner tests: a private hash directory, a
//! workspace for configs, and pre-wired `gscr`/`gscr-record` commands.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

pub struct Fixture {
    _tmp: TempDir,
    pub hash_dir: PathBuf,
    pub work: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let hash_dir = tmp.path().join("hashes");
        fs::create_dir(&hash_dir).unwrap();
        let work = tmp.path().join("work");
        fs::create_dir(&work).unwrap();
        Self {
            _tmp: tmp,
            hash_dir,
            work,
        }
    }

    pub fn write_config(&self, text: &str) -> PathBuf {
        let path = self.work.join("config.toml");
        fs::write(&path, text).unwrap();
        path
    }

    pub fn write_file(&self, name: &str, text: &str) -> PathBuf {
        let path = self.work.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    /// Record a file's hash with the real recording binary.
    pub fn record(&self, path: &Path) {
        let mut cmd = Command::cargo_bin("gscr-record").unwrap();
        cmd.arg("--hash-directory")
            .arg(&self.hash_dir)
            .arg("--file")
            .arg(path)
            .arg("--force");
        cmd.assert().success();
    }

    /// A `gscr` invocation with webhook variables scrubbed and the hash
    /// directory pointed at this fixture.
    pub fn gscr(&self) -> Command {
        let mut cmd = Command::cargo_bin("gscr").unwrap();
        cmd.env_remove("GSCR_SLACK_WEBHOOK_URL")
            .env_remove("GSCR_SLACK_WEBHOOK_URL_SUCCESS")
            .env_remove("GSCR_SLACK_WEBHOOK_URL_ERROR")
            .env_remove("GSCR_DISABLE_VERIFICATION")
            .env("GSCR_HASH_DIRECTORY", &self.hash_dir);
        cmd
    }
}
