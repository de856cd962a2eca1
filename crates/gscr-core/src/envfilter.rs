//! Environment allowlist filtering.
//!
//! The process environment is captured once during bootstrap; everything
//! after that works against the snapshot. `env_vars` overlays are trusted
//! (they come from the integrity-verified config); only `env_import` is
//! gated, because its values come from the untrusted process environment.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// Immutable snapshot of the process environment, read exactly once.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot(BTreeMap<String, String>);

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self(std::env::vars().collect())
    }

    /// Test seam: build a snapshot from explicit entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a group arrived at its effective allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritanceMode {
    /// `env_allowed` absent: the global allowlist applies.
    Inherit,
    /// Non-empty `env_allowed`: exactly that set.
    Explicit,
    /// `env_allowed = []`: no imports at all.
    Reject,
}

impl InheritanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Explicit => "explicit",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvFilterError {
    #[error(
        "environment variable `{name}` is not in the effective allowlist of group `{group}` (mode {mode})"
    )]
    ImportNotAllowed {
        name: String,
        group: String,
        mode: &'static str,
    },
}

impl EnvFilterError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ImportNotAllowed { .. } => "env_import_not_allowed",
        }
    }
}

/// Effective allowlist for a group, per the three-state `env_allowed`.
pub fn effective_allowlist(
    global: &[String],
    group: Option<&[String]>,
) -> (BTreeSet<String>, InheritanceMode) {
    match group {
        None => (
            global.iter().cloned().collect(),
            InheritanceMode::Inherit,
        ),
        Some([]) => (BTreeSet::new(), InheritanceMode::Reject),
        Some(explicit) => (
            explicit.iter().cloned().collect(),
            InheritanceMode::Explicit,
        ),
    }
}

/// Pull `names` out of the snapshot, refusing anything outside the
/// allowlist. Names present in the allowlist but absent from the snapshot
/// are skipped.
pub fn import(
    names: &[String],
    allowlist: &BTreeSet<String>,
    mode: InheritanceMode,
    group: &str,
    snapshot: &EnvSnapshot,
) -> Result<BTreeMap<String, String>, EnvFilterError> {
    let mut imported = BTreeMap::new();
    for name in names {
        if !allowlist.contains(name) {
            return Err(EnvFilterError::ImportNotAllowed {
                name: name.clone(),
                group: group.to_string(),
                mode: mode.as_str(),
            });
        }
        match snapshot.get(name) {
            Some(value) => {
                imported.insert(name.clone(), value.to_string());
            }
            None => {
                tracing::debug!(name = %name, group = %group, "allowlisted variable absent from environment");
            }
        }
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> EnvSnapshot {
        EnvSnapshot::from_entries([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("SECRET".to_string(), "shh".to_string()),
        ])
    }

    fn global() -> Vec<String> {
        vec!["PATH".to_string(), "HOME".to_string()]
    }

    #[test]
    fn absent_inherits_global() {
        let (set, mode) = effective_allowlist(&global(), None);
        assert_eq!(mode, InheritanceMode::Inherit);
        assert!(set.contains("PATH"));
        assert!(set.contains("HOME"));
    }

    #[test]
    fn empty_rejects_everything() {
        let (set, mode) = effective_allowlist(&global(), Some(&[]));
        assert_eq!(mode, InheritanceMode::Reject);
        assert!(set.is_empty());

        let err = import(
            &["PATH".to_string()],
            &set,
            mode,
            "locked-down",
            &snapshot(),
        )
        .unwrap_err();
        assert_eq!(err.tag(), "env_import_not_allowed");
    }

    #[test]
    fn explicit_uses_exactly_that_set() {
        let explicit = vec!["PATH".to_string()];
        let (set, mode) = effective_allowlist(&global(), Some(&explicit));
        assert_eq!(mode, InheritanceMode::Explicit);
        assert!(set.contains("PATH"));
        assert!(!set.contains("HOME"));
    }

    #[test]
    fn import_respects_allowlist_and_skips_missing() {
        let (set, mode) = effective_allowlist(&global(), None);
        let imported = import(
            &["PATH".to_string(), "HOME".to_string()],
            &set,
            mode,
            "g",
            &snapshot(),
        )
        .unwrap();
        assert_eq!(imported["PATH"], "/usr/bin");
        assert_eq!(imported.len(), 2);

        let err = import(&["SECRET".to_string()], &set, mode, "g", &snapshot()).unwrap_err();
        assert!(matches!(err, EnvFilterError::ImportNotAllowed { .. }));
    }

    #[test]
    fn missing_from_snapshot_is_not_an_error() {
        let allow: BTreeSet<String> = ["ABSENT".to_string()].into();
        let imported = import(
            &["ABSENT".to_string()],
            &allow,
            InheritanceMode::Explicit,
            "g",
            &snapshot(),
        )
        .unwrap();
        assert!(imported.is_empty());
    }
}
