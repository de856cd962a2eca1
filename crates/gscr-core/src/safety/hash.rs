//! Hash-directory resolution and file integrity verification.
//!
//! The hash directory is resolved from values known at startup (CLI argument,
//! `GSCR_HASH_DIRECTORY`, compile-time default) so a tampered configuration
//! can never redirect where its own hashes are read from. Manifest entries
//! are one file per recorded target, keyed by the SHA-256 of the target's
//! canonical absolute path.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::path::{PathError, PathValidator, ValidateOptions, ValidatedPath};

/// Compile-time default location of the hash manifest.
pub const DEFAULT_HASH_DIR: &str = "/usr/local/etc/gscr/hashes";

/// Environment override, below the CLI argument in precedence.
pub const HASH_DIR_ENV: &str = "GSCR_HASH_DIRECTORY";

const MANIFEST_SUFFIX: &str = ".hash";
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HashDirError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("hash directory `{path}` is not a directory")]
    NotDirectory { path: String },

    #[error("hash directory ancestor `{path}` is a symlink")]
    SymlinkAncestor { path: String },

    #[error("hash directory `{path}` owned by uid {uid}; must be owned by root or the invoking user")]
    BadOwner { path: String, uid: u32 },

    #[error("hash directory `{path}` mode {mode:03o} permits group or world write")]
    BadMode { path: String, mode: u32 },

    #[error("failed to inspect hash directory `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("no hash recorded for `{path}` (expected manifest entry `{key}`)")]
    MissingRecord { path: String, key: String },

    #[error("hash mismatch for `{path}`: recorded {expected}, computed {actual}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("hash already recorded for `{path}`; pass --force to overwrite")]
    RecordExists { path: String },

    #[error("I/O error while hashing `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve the hash directory: CLI argument beats `GSCR_HASH_DIRECTORY`
/// beats the compile-time default, then the policy checks run on the winner.
pub fn resolve_hash_dir(cli: Option<&str>) -> Result<ValidatedPath, HashDirError> {
    let raw = match cli {
        Some(p) => p.to_string(),
        None => std::env::var(HASH_DIR_ENV).unwrap_or_else(|_| DEFAULT_HASH_DIR.to_string()),
    };
    validate_hash_dir(&raw)
}

/// Policy: absolute, no symlink on any ancestor, owned by root or the
/// invoking user, and not group- or world-writable.
pub fn validate_hash_dir(raw: &str) -> Result<ValidatedPath, HashDirError> {
    let validated = PathValidator::validate(
        raw,
        &ValidateOptions {
            require_exists: true,
            ..Default::default()
        },
    )?;

    // Walk the path as given: canonicalization already followed symlinks, so
    // the policy check must look at the original components.
    let mut walked = PathBuf::from("/");
    for comp in Path::new(raw).components() {
        use std::path::Component;
        match comp {
            Component::RootDir => {}
            Component::Normal(part) => {
                walked.push(part);
                let meta = fs::symlink_metadata(&walked).map_err(|e| HashDirError::Io {
                    path: walked.display().to_string(),
                    source: e,
                })?;
                if meta.file_type().is_symlink() {
                    return Err(HashDirError::SymlinkAncestor {
                        path: walked.display().to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    let meta = fs::metadata(validated.as_path()).map_err(|e| HashDirError::Io {
        path: validated.to_string(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(HashDirError::NotDirectory {
            path: validated.to_string(),
        });
    }
    let owner = meta.uid();
    if owner != 0 && owner != nix::unistd::geteuid().as_raw() {
        return Err(HashDirError::BadOwner {
            path: validated.to_string(),
            uid: owner,
        });
    }
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o022 != 0 {
        return Err(HashDirError::BadMode {
            path: validated.to_string(),
            mode,
        });
    }

    Ok(validated)
}

/// Verifies files against the recorded manifest, or records new entries.
#[derive(Debug)]
pub struct Verifier {
    hash_dir: Option<ValidatedPath>,
}

impl Verifier {
    pub fn new(hash_dir: ValidatedPath) -> Self {
        Self {
            hash_dir: Some(hash_dir),
        }
    }

    /// Verification disabled: paths are still validated, hashes are not
    /// consulted.
    pub fn disabled() -> Self {
        Self { hash_dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.hash_dir.is_some()
    }

    /// Manifest key for a validated target path.
    pub fn manifest_key(target: &ValidatedPath) -> String {
        sha256_hex(target.as_path().as_os_str().as_encoded_bytes())
    }

    fn manifest_path(&self, dir: &ValidatedPath, target: &ValidatedPath) -> PathBuf {
        dir.join(format!("{}{MANIFEST_SUFFIX}", Self::manifest_key(target)))
    }

    /// Validate `raw`, then compare its content hash against the recorded
    /// one. With verification disabled only the path validation runs.
    pub fn verify_file(&self, raw: &str) -> Result<ValidatedPath, VerifyError> {
        let target = PathValidator::validate(raw, &ValidateOptions::readable_file())?;
        let Some(dir) = &self.hash_dir else {
            tracing::debug!(path = %target, "verification disabled, skipping hash check");
            return Ok(target);
        };

        let entry = self.manifest_path(dir, &target);
        let recorded = match fs::read_to_string(&entry) {
            Ok(text) => text.trim().to_ascii_lowercase(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VerifyError::MissingRecord {
                    path: target.to_string(),
                    key: Self::manifest_key(&target),
                });
            }
            Err(e) => {
                return Err(VerifyError::Io {
                    path: entry.display().to_string(),
                    source: e,
                });
            }
        };

        let actual = hash_file(target.as_path()).map_err(|e| VerifyError::Io {
            path: target.to_string(),
            source: e,
        })?;
        if actual != recorded {
            return Err(VerifyError::Mismatch {
                path: target.to_string(),
                expected: recorded,
                actual,
            });
        }
        tracing::debug!(path = %target, "hash verified");
        Ok(target)
    }

    /// Record (or with `force` re-record) the hash of `raw` in the manifest.
    /// Used by the out-of-band recording utility, never by the runner itself.
    pub fn record_file(&self, raw: &str, force: bool) -> Result<PathBuf, VerifyError> {
        let target = PathValidator::validate(raw, &ValidateOptions::readable_file())?;
        let dir = self
            .hash_dir
            .as_ref()
            .expect("record_file requires a hash directory");

        let entry = self.manifest_path(dir, &target);
        if entry.exists() && !force {
            return Err(VerifyError::RecordExists {
                path: target.to_string(),
            });
        }
        let digest = hash_file(target.as_path()).map_err(|e| VerifyError::Io {
            path: target.to_string(),
            source: e,
        })?;
        fs::write(&entry, format!("{digest}\n")).map_err(|e| VerifyError::Io {
            path: entry.display().to_string(),
            source: e,
        })?;
        let mut perms = fs::metadata(&entry)
            .map_err(|e| VerifyError::Io {
                path: entry.display().to_string(),
                source: e,
            })?
            .permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&entry, perms).map_err(|e| VerifyError::Io {
            path: entry.display().to_string(),
            source: e,
        })?;
        Ok(entry)
    }
}
