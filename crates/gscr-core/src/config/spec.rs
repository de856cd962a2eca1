//! Static configuration model, as parsed from the TOML file.
//!
//! These records are immutable inputs; the expansion engine lowers them into
//! runtime objects. Unknown fields are rejected so a typo cannot silently
//! weaken a policy.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::expand::timeout::Timeout;

/// Risk declared by a command, gated by the enclosing `max_risk_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// A variable is either a scalar string or an array of strings; the two live
/// in disjoint namespaces during expansion.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VarValue {
    Scalar(String),
    Array(Vec<String>),
}

impl VarValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "string",
            Self::Array(_) => "array",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigSpec {
    pub version: Option<String>,
    pub global: GlobalSpec,
    pub templates: BTreeMap<String, CommandTemplate>,
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct GlobalSpec {
    pub timeout: Timeout,
    pub workdir: Option<String>,
    pub verify_files: Vec<String>,
    pub env_allowed: Vec<String>,
    pub env_import: Vec<String>,
    pub vars: BTreeMap<String, VarValue>,
    pub output_size_limit: Option<u64>,
    pub log_level: String,
    pub max_risk_level: RiskLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub timeout: Timeout,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// `None` inherits the global allowlist; `Some([])` rejects all imports;
    /// a non-empty list is used as-is.
    #[serde(default)]
    pub env_allowed: Option<Vec<String>>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub verify_files: Vec<String>,
    #[serde(default)]
    pub max_risk_level: Option<RiskLevel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub timeout: Timeout,
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub run_as_group: Option<String>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Referenced by name from commands. Carries the same executable surface as
/// a command plus `${param}` placeholders; deliberately no run-as fields.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct CommandTemplate {
    pub cmd: String,
    pub args: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub output: Option<String>,
    pub timeout: Timeout,
    pub risk: Option<RiskLevel>,
    pub env_import: Vec<String>,
    pub vars: BTreeMap<String, VarValue>,
}
