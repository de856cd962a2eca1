//! Three-state command timeout and its hierarchical resolution.
//!
//! "Unset" and "zero" must stay distinguishable across deserialization,
//! inheritance and logging: an absent field inherits, an explicit `0` means
//! unlimited and propagates as such.

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::logging::Value;

/// Used only when no level sets a timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Upper bound accepted from configuration (24 hours).
pub const MAX_TIMEOUT_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Field absent; inherit from the enclosing scope.
    #[default]
    Unset,
    /// Explicit `0`: no deadline.
    Unlimited,
    /// Hard deadline in seconds.
    Seconds(u32),
}

impl Timeout {
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }

    /// Effective seconds when this level is set; `Unlimited` is `Some(0)`.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            Self::Unset => None,
            Self::Unlimited => Some(0),
            Self::Seconds(n) => Some(u64::from(*n)),
        }
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            return Err(de::Error::custom(format!(
                "timeout must not be negative (got {raw})"
            )));
        }
        if raw > MAX_TIMEOUT_SECS {
            return Err(de::Error::custom(format!(
                "timeout must not exceed {MAX_TIMEOUT_SECS} seconds (got {raw})"
            )));
        }
        Ok(match raw {
            0 => Self::Unlimited,
            n => Self::Seconds(n as u32),
        })
    }
}

/// Which level supplied the effective timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutLevel {
    Command,
    Group,
    Global,
    Default,
}

impl TimeoutLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Group => "group",
            Self::Global => "global",
            Self::Default => "default",
        }
    }
}

/// Resolved timeout with provenance, carried on the runtime command for
/// audit and dry-run reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutResolution {
    pub seconds: u64,
    pub level: TimeoutLevel,
    pub command_name: String,
    pub group_name: String,
}

impl TimeoutResolution {
    pub fn to_value(&self) -> Value {
        Value::group(vec![
            ("level".to_string(), Value::str(self.level.as_str())),
            ("command_name".to_string(), Value::str(&self.command_name)),
            ("group_name".to_string(), Value::str(&self.group_name)),
            ("seconds".to_string(), Value::Uint(self.seconds)),
        ])
    }
}

/// First set level wins, in command > group > global order; zero is a value
/// like any other and is never replaced by the default.
pub fn resolve(cmd: Timeout, group: Timeout, global: Timeout) -> (u64, TimeoutLevel) {
    if let Some(secs) = cmd.seconds() {
        return (secs, TimeoutLevel::Command);
    }
    if let Some(secs) = group.seconds() {
        return (secs, TimeoutLevel::Group);
    }
    if let Some(secs) = global.seconds() {
        return (secs, TimeoutLevel::Global);
    }
    (DEFAULT_TIMEOUT_SECS, TimeoutLevel::Default)
}
