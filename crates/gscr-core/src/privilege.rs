//! Risk policy and scoped privilege elevation.
//!
//! Elevation brackets exactly one command invocation. The guard restores the
//! original effective uid/gid and supplementary groups on drop, and aborts
//! the process if restoration fails: continuing with mixed credentials is
//! worse than dying. A process-wide lock serializes elevation, so at most
//! one command holds elevated credentials at a time.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{getgroups, setegid, seteuid, setgroups, Gid, Group, Uid, User};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::spec::RiskLevel;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("command `{command}` declares risk {risk} above the allowed maximum {max}")]
    RiskExceeded {
        command: String,
        risk: &'static str,
        max: &'static str,
    },

    #[error("privileged command `{command}` must declare risk high (declared {risk})")]
    PrivilegedRiskTooLow {
        command: String,
        risk: &'static str,
    },

    #[error("unknown user `{0}`")]
    UnknownUser(String),

    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error("binary `{path}` mode {mode:03o} permits group or world write")]
    UnsafeBinaryMode { path: String, mode: u32 },

    #[error("binary `{path}` owned by uid {uid}; must be owned by root or the invoking user")]
    UntrustedBinaryOwner { path: String, uid: u32 },

    #[error("failed to inspect binary `{path}`: {source}")]
    BinaryInspect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner lacks the privileges to run as user `{user}`")]
    CannotElevate { user: String },

    #[error("failed to {op}: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: nix::Error,
    },
}

impl PrivilegeError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RiskExceeded { .. } | Self::PrivilegedRiskTooLow { .. } => {
                "risk_policy_violation"
            }
            _ => "privilege_escalation_failed",
        }
    }
}

/// Refuse commands whose declared risk exceeds the enclosing maximum.
pub fn check_risk(
    command: &str,
    risk: RiskLevel,
    max: RiskLevel,
) -> Result<(), PrivilegeError> {
    if risk > max {
        return Err(PrivilegeError::RiskExceeded {
            command: command.to_string(),
            risk: risk.as_str(),
            max: max.as_str(),
        });
    }
    Ok(())
}

pub struct PrivilegeManager {
    elevation: Mutex<()>,
    orig_euid: Uid,
    orig_egid: Gid,
}

impl Default for PrivilegeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivilegeManager {
    pub fn new() -> Self {
        Self {
            elevation: Mutex::new(()),
            orig_euid: nix::unistd::geteuid(),
            orig_egid: nix::unistd::getegid(),
        }
    }

    /// Switching users requires an effective uid of 0 (root, or a
    /// setuid-root runner binary).
    pub fn can_elevate(&self) -> bool {
        self.orig_euid.is_root()
    }

    /// Enter an elevation scope for one command. Checks the target binary's
    /// permissions first; no process is spawned if they fail. With `user`
    /// absent only the effective gid (and supplementary groups) change.
    pub async fn elevate(
        &self,
        command: &str,
        user: Option<&str>,
        group: Option<&str>,
        binary: &Path,
    ) -> Result<ElevationGuard<'_>, PrivilegeError> {
        check_binary(binary)?;

        if !self.can_elevate() {
            return Err(PrivilegeError::CannotElevate {
                user: user.unwrap_or("<current>").to_string(),
            });
        }

        let target_user = user
            .map(|name| {
                User::from_name(name)
                    .map_err(|source| PrivilegeError::Syscall {
                        op: "look up user",
                        source,
                    })?
                    .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))
            })
            .transpose()?;
        let target_gid = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(|source| PrivilegeError::Syscall {
                        op: "look up group",
                        source,
                    })?
                    .ok_or_else(|| PrivilegeError::UnknownGroup(name.to_string()))?
                    .gid,
            ),
            None => target_user.as_ref().map(|u| u.gid),
        };

        let permit = self.elevation.lock().await;
        let saved_groups = getgroups().map_err(|source| PrivilegeError::Syscall {
            op: "read supplementary groups",
            source,
        })?;

        let result = apply_credentials(target_user.as_ref(), target_gid);
        if let Err(e) = result {
            restore(self.orig_euid, self.orig_egid, &saved_groups);
            return Err(e);
        }

        tracing::debug!(
            command = %command,
            user = user.unwrap_or("<current>"),
            group = group.unwrap_or("<primary>"),
            "entered elevation scope"
        );

        Ok(ElevationGuard {
            orig_euid: self.orig_euid,
            orig_egid: self.orig_egid,
            saved_groups,
            _permit: permit,
        })
    }
}

/// Supplementary groups first, then gid, then uid; the uid drop has to come
/// last or the rest would be refused.
fn apply_credentials(user: Option<&User>, gid: Option<Gid>) -> Result<(), PrivilegeError> {
    if let (Some(user), Some(gid)) = (user, gid) {
        let name = std::ffi::CString::new(user.name.as_str())
            .map_err(|_| PrivilegeError::UnknownUser(user.name.clone()))?;
        let member_groups =
            nix::unistd::getgrouplist(&name, gid).map_err(|source| PrivilegeError::Syscall {
                op: "resolve group membership",
                source,
            })?;
        setgroups(&member_groups).map_err(|source| PrivilegeError::Syscall {
            op: "set supplementary groups",
            source,
        })?;
    }
    if let Some(gid) = gid {
        setegid(gid).map_err(|source| PrivilegeError::Syscall {
            op: "set effective gid",
            source,
        })?;
    }
    if let Some(user) = user {
        seteuid(user.uid).map_err(|source| PrivilegeError::Syscall {
            op: "set effective uid",
            source,
        })?;
    }
    Ok(())
}

/// A binary run with elevated credentials must not be writable by anyone
/// but its owner, and the owner must be root or the invoking user.
fn check_binary(binary: &Path) -> Result<(), PrivilegeError> {
    let meta = std::fs::metadata(binary).map_err(|source| PrivilegeError::BinaryInspect {
        path: binary.display().to_string(),
        source,
    })?;
    let mode = meta.mode() & 0o777;
    if mode & 0o022 != 0 {
        return Err(PrivilegeError::UnsafeBinaryMode {
            path: binary.display().to_string(),
            mode,
        });
    }
    let owner = meta.uid();
    if owner != 0 && owner != nix::unistd::getuid().as_raw() {
        return Err(PrivilegeError::UntrustedBinaryOwner {
            path: binary.display().to_string(),
            uid: owner,
        });
    }
    Ok(())
}

fn restore(euid: Uid, egid: Gid, groups: &[Gid]) {
    // Raise the effective uid first; the saved set-user-ID keeps this legal,
    // and the gid/groups calls below need it.
    let uid_ok = seteuid(euid).is_ok();
    let gid_ok = setegid(egid).is_ok();
    let groups_ok = setgroups(groups).is_ok();
    if !(uid_ok && gid_ok && groups_ok) {
        eprintln!("[CRITICAL] privilege: failed to restore credentials after elevation; aborting");
        std::process::abort();
    }
}

/// Active elevation scope. Dropping it restores the original credentials
/// and releases the elevation lock.
#[derive(Debug)]
pub struct ElevationGuard<'a> {
    orig_euid: Uid,
    orig_egid: Gid,
    saved_groups: Vec<Gid>,
    _permit: MutexGuard<'a, ()>,
}

impl Drop for ElevationGuard<'_> {
    fn drop(&mut self) {
        restore(self.orig_euid, self.orig_egid, &self.saved_groups);
        tracing::debug!("left elevation scope");
    }
}
