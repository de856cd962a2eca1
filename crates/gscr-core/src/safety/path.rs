//! Path validation.
//!
//! Everything the runner touches on disk goes through [`PathValidator`]
//! first. The returned [`ValidatedPath`] is only constructible here, so a
//! function taking one can rely on the checks having run: absolute, lexically
//! clean, symlinks resolved within a bounded depth, and any requested
//! existence or access checks satisfied.

use std::fmt;
use std::io;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Upper bound on symlink hops while resolving a path.
pub const MAX_SYMLINK_DEPTH: u8 = 8;

/// Default maximum accepted path length in bytes.
pub const DEFAULT_MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathReason {
    Empty,
    TooLong,
    InvalidChars,
    NotAbsolute,
    RelElements,
    SymlinkLoop,
    NotExists,
    NotRegular,
    NotReadable,
    NotWritable,
    NotExecutable,
    PermissionDenied,
}

impl PathReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::InvalidChars => "invalid_chars",
            Self::NotAbsolute => "not_absolute",
            Self::RelElements => "rel_elements",
            Self::SymlinkLoop => "symlink_loop",
            Self::NotExists => "not_exists",
            Self::NotRegular => "not_regular",
            Self::NotReadable => "not_readable",
            Self::NotWritable => "not_writable",
            Self::NotExecutable => "not_executable",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for PathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{reason}: {path}")]
pub struct PathError {
    pub path: String,
    pub reason: PathReason,
    #[source]
    pub source: Option<io::Error>,
}

impl PathError {
    fn new(path: impl Into<String>, reason: PathReason) -> Self {
        Self {
            path: path.into(),
            reason,
            source: None,
        }
    }

    fn with_source(path: impl Into<String>, reason: PathReason, source: io::Error) -> Self {
        Self {
            path: path.into(),
            reason,
            source: Some(source),
        }
    }
}

/// Which checks to run beyond the structural ones (always on).
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    pub require_exists: bool,
    pub require_regular: bool,
    pub require_readable: bool,
    pub require_writable: bool,
    pub require_executable: bool,
    pub max_length: Option<usize>,
}

impl ValidateOptions {
    /// Existing regular file, readable by the effective user.
    pub fn readable_file() -> Self {
        Self {
            require_exists: true,
            require_regular: true,
            require_readable: true,
            ..Self::default()
        }
    }

    /// Existing regular file that must also be executable.
    pub fn executable_file() -> Self {
        Self {
            require_exists: true,
            require_regular: true,
            require_executable: true,
            ..Self::default()
        }
    }
}

/// Proof token: the wrapped path passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatedPath(PathBuf);

impl ValidatedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl Deref for ValidatedPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PathValidator;

impl PathValidator {
    pub fn validate(raw: &str, opts: &ValidateOptions) -> Result<ValidatedPath, PathError> {
        if raw.is_empty() {
            return Err(PathError::new(raw, PathReason::Empty));
        }
        let max_len = opts.max_length.unwrap_or(DEFAULT_MAX_PATH_LEN);
        if raw.len() > max_len {
            return Err(PathError::new(raw, PathReason::TooLong));
        }
        if raw.contains('\0') {
            return Err(PathError::new(raw.replace('\0', "\\0"), PathReason::InvalidChars));
        }
        if !raw.starts_with('/') {
            return Err(PathError::new(raw, PathReason::NotAbsolute));
        }
        Self::check_clean(raw)?;

        let resolved = resolve_symlinks(Path::new(raw), MAX_SYMLINK_DEPTH)
            .map_err(|mut e| {
                // Report the caller's path, not an intermediate target.
                e.path = raw.to_string();
                e
            })?;

        Self::apply_checks(raw, &resolved, opts)?;
        Ok(ValidatedPath(resolved))
    }

    /// Rebuild from components and compare; `.`/`..` segments, doubled or
    /// trailing separators all show up as a mismatch.
    fn check_clean(raw: &str) -> Result<(), PathError> {
        let mut rebuilt = PathBuf::from("/");
        for comp in Path::new(raw).components() {
            match comp {
                Component::RootDir => {}
                Component::Normal(part) => rebuilt.push(part),
                Component::CurDir | Component::ParentDir => {
                    return Err(PathError::new(raw, PathReason::RelElements));
                }
                Component::Prefix(_) => {
                    return Err(PathError::new(raw, PathReason::InvalidChars));
                }
            }
        }
        if rebuilt.as_os_str() != Path::new(raw).as_os_str() {
            return Err(PathError::new(raw, PathReason::RelElements));
        }
        Ok(())
    }

    fn apply_checks(raw: &str, resolved: &Path, opts: &ValidateOptions) -> Result<(), PathError> {
        let meta = match std::fs::metadata(resolved) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if opts.require_exists {
                    return Err(PathError::with_source(raw, PathReason::NotExists, e));
                }
                None
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(PathError::with_source(raw, PathReason::PermissionDenied, e));
            }
            Err(e) => return Err(PathError::with_source(raw, PathReason::PermissionDenied, e)),
        };

        let Some(meta) = meta else {
            return Ok(());
        };

        if opts.require_regular && !meta.is_file() {
            return Err(PathError::new(raw, PathReason::NotRegular));
        }

        #[cfg(unix)]
        {
            use nix::fcntl::AtFlags;
            use nix::unistd::{faccessat, AccessFlags};

            let probes = [
                (opts.require_readable, AccessFlags::R_OK, PathReason::NotReadable),
                (opts.require_writable, AccessFlags::W_OK, PathReason::NotWritable),
                (
                    opts.require_executable,
                    AccessFlags::X_OK,
                    PathReason::NotExecutable,
                ),
            ];
            for (wanted, flag, reason) in probes {
                if !wanted {
                    continue;
                }
                faccessat(None, resolved, flag, AtFlags::AT_EACCESS)
                    .map_err(|_| PathError::new(raw, reason))?;
            }
        }

        Ok(())
    }
}

/// Follow symlinks at the leaf, bounded by `depth` hops; a missing leaf is
/// resolved through its parent so the token still points at a stable target.
fn resolve_symlinks(path: &Path, depth: u8) -> Result<PathBuf, PathError> {
    if depth == 0 {
        return Err(PathError::new(
            path.display().to_string(),
            PathReason::SymlinkLoop,
        ));
    }
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = std::fs::read_link(path).map_err(|e| {
                PathError::with_source(path.display().to_string(), PathReason::SymlinkLoop, e)
            })?;
            let joined = if target.is_absolute() {
                target
            } else {
                path.parent().unwrap_or(Path::new("/")).join(target)
            };
            resolve_symlinks(&joined, depth - 1)
        }
        Ok(_) => canonicalize(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = path.parent().ok_or_else(|| {
                PathError::new(path.display().to_string(), PathReason::NotExists)
            })?;
            let name = path.file_name().ok_or_else(|| {
                PathError::new(path.display().to_string(), PathReason::NotExists)
            })?;
            let resolved_parent = resolve_symlinks(parent, depth - 1)?;
            Ok(resolved_parent.join(name))
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(PathError::with_source(
            path.display().to_string(),
            PathReason::PermissionDenied,
            e,
        )),
        Err(e) => Err(PathError::with_source(
            path.display().to_string(),
            PathReason::NotExists,
            e,
        )),
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, PathError> {
    std::fs::canonicalize(path).map_err(|e| {
        let reason = if e.raw_os_error() == Some(libc::ELOOP) {
            PathReason::SymlinkLoop
        } else if e.kind() == io::ErrorKind::PermissionDenied {
            PathReason::PermissionDenied
        } else {
            PathReason::NotExists
        };
        PathError::with_source(path.display().to_string(), reason, e)
    })
}
