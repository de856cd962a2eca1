//! Lowering the static spec into runtime objects.
//!
//! Expansion is strictly parent-first: global, then group, then command.
//! Each stage resolves its variable table against the parent's, expands
//! every string field, builds the merged environment, and resolves the
//! effective timeout with provenance. Nothing downstream ever sees an
//! unexpanded `%{…}`.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::config::spec::{
    CommandSpec, CommandTemplate, ConfigSpec, GroupSpec, RiskLevel, VarValue,
};
use crate::envfilter::{self, EnvFilterError, EnvSnapshot, InheritanceMode};
use crate::expand::template::{self, TemplateError};
use crate::expand::timeout::{self, Timeout, TimeoutResolution};
use crate::expand::vars::{VarError, VarExpander, VarTable};
use crate::logging::Level;
use crate::safety::path::{PathError, PathValidator, ValidateOptions, ValidatedPath};

/// Default cap on captured output when the config does not set one.
pub const DEFAULT_OUTPUT_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error(transparent)]
    Var(#[from] VarError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("command `{command}` references unknown template `{template}`")]
    TemplateNotFound { command: String, template: String },

    #[error(transparent)]
    Env(#[from] EnvFilterError),

    #[error("output path for command `{command}`: {source}")]
    OutputPath {
        command: String,
        #[source]
        source: PathError,
    },

    #[error(
        "variable `{name}` in scope `{scope}` overrides a {parent_kind} variable with a {child_kind} value"
    )]
    TypeMismatch {
        scope: String,
        name: String,
        parent_kind: &'static str,
        child_kind: &'static str,
    },

    #[error("command `{0}` expanded to an empty command line")]
    EmptyCommand(String),
}

impl ExpandError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Var(e) => e.tag(),
            Self::Template(e) => e.tag(),
            Self::TemplateNotFound { .. } => "template_not_found",
            Self::Env(e) => e.tag(),
            Self::OutputPath { .. } => "config_schema_invalid",
            Self::TypeMismatch { .. } => "var_type_mismatch",
            Self::EmptyCommand(_) => "config_schema_invalid",
        }
    }
}

/// Expanded global scope plus the process-environment snapshot.
#[derive(Debug)]
pub struct RuntimeGlobal {
    pub env: BTreeMap<String, String>,
    pub vars: VarTable,
    pub verify_files: Vec<String>,
    pub env_snapshot: EnvSnapshot,
    pub allowlist: Vec<String>,
    pub timeout: Timeout,
    pub workdir: Option<String>,
    pub output_size_limit: u64,
    pub log_level: Level,
    pub max_risk_level: RiskLevel,
}

/// Expanded group scope.
#[derive(Debug)]
pub struct RuntimeGroup {
    pub name: String,
    pub env: BTreeMap<String, String>,
    pub vars: VarTable,
    pub verify_files: Vec<String>,
    pub mode: InheritanceMode,
    pub allowlist: BTreeSet<String>,
    pub workdir: Option<String>,
    pub timeout: Timeout,
    pub max_risk_level: RiskLevel,
}

/// Fully expanded command, ready for the executor.
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    pub name: String,
    pub group: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `None` means the runner's own working directory.
    pub workdir: Option<String>,
    pub output: Option<ValidatedPath>,
    pub timeout: Timeout,
    pub effective_timeout: u64,
    pub timeout_resolution: TimeoutResolution,
    pub risk: RiskLevel,
    pub max_risk_level: RiskLevel,
    pub run_as_user: Option<String>,
    pub run_as_group: Option<String>,
    pub output_size_limit: u64,
}

impl RuntimeCommand {
    /// Display form of the full command line for plans and summaries.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn is_privileged(&self) -> bool {
        self.run_as_user.is_some() || self.run_as_group.is_some()
    }
}

/// Build a child symbol table on top of the parent's. An override must keep
/// the parent's kind.
fn merge_vars(
    scope: &str,
    parent: &VarTable,
    child: &BTreeMap<String, VarValue>,
) -> Result<VarTable, ExpandError> {
    let mut merged = parent.clone();
    for (name, value) in child {
        let parent_kind = if parent.has_scalar(name) {
            Some("string")
        } else if parent.has_array(name) {
            Some("array")
        } else {
            None
        };
        if let Some(parent_kind) = parent_kind {
            if parent_kind != value.kind() {
                return Err(ExpandError::TypeMismatch {
                    scope: scope.to_string(),
                    name: name.clone(),
                    parent_kind,
                    child_kind: value.kind(),
                });
            }
        }
        match value {
            VarValue::Scalar(s) => merged.insert_scalar(name.clone(), s.clone()),
            VarValue::Array(items) => merged.insert_array(name.clone(), items.clone()),
        }
    }
    Ok(merged)
}

fn expand_env_map(
    expander: &VarExpander<'_>,
    declared: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ExpandError> {
    let mut out = BTreeMap::new();
    for (k, v) in declared {
        out.insert(k.clone(), expander.expand_str(v)?);
    }
    Ok(out)
}

/// Expand the global scope. The snapshot passed here is the single read of
/// the process environment for the whole run.
pub fn expand_global(
    spec: &ConfigSpec,
    snapshot: EnvSnapshot,
) -> Result<RuntimeGlobal, ExpandError> {
    let g = &spec.global;
    let vars = merge_vars("global", &VarTable::new(), &g.vars)?;
    crate::expand::vars::verify_table(&vars)?;
    let expander = VarExpander::new(&vars);

    let verify_files = expander.expand_all(&g.verify_files)?;
    let workdir = g.workdir.as_deref().map(|w| expander.expand_str(w)).transpose()?;

    // The global scope has no trusted overlay; its env is entirely imports
    // gated by its own allowlist.
    let allowset: BTreeSet<String> = g.env_allowed.iter().cloned().collect();
    let env = envfilter::import(
        &g.env_import,
        &allowset,
        InheritanceMode::Explicit,
        "global",
        &snapshot,
    )?;

    let log_level = Level::parse(&g.log_level).unwrap_or(Level::Info);

    Ok(RuntimeGlobal {
        env,
        vars,
        verify_files,
        env_snapshot: snapshot,
        allowlist: g.env_allowed.clone(),
        timeout: g.timeout,
        workdir,
        output_size_limit: g.output_size_limit.unwrap_or(DEFAULT_OUTPUT_SIZE_LIMIT),
        log_level,
        max_risk_level: g.max_risk_level,
    })
}

/// Expand one group against the global runtime.
pub fn expand_group(
    global: &RuntimeGlobal,
    spec: &GroupSpec,
) -> Result<RuntimeGroup, ExpandError> {
    let scope = format!("group `{}`", spec.name);
    let vars = merge_vars(&scope, &global.vars, &spec.vars)?;
    crate::expand::vars::verify_table(&vars)?;
    let expander = VarExpander::new(&vars);

    let verify_files = expander.expand_all(&spec.verify_files)?;
    let workdir = match spec.workdir.as_deref() {
        Some(w) => Some(expander.expand_str(w)?),
        None => global.workdir.clone(),
    };

    let (allowlist, mode) =
        envfilter::effective_allowlist(&global.allowlist, spec.env_allowed.as_deref());

    let mut env = global.env.clone();
    let imported = envfilter::import(
        &spec.env_import,
        &allowlist,
        mode,
        &spec.name,
        &global.env_snapshot,
    )?;
    env.extend(imported);

    Ok(RuntimeGroup {
        name: spec.name.clone(),
        env,
        vars,
        verify_files,
        mode,
        allowlist,
        workdir,
        timeout: spec.timeout,
        max_risk_level: spec.max_risk_level.unwrap_or(global.max_risk_level),
    })
}

/// Expand one command against its group and the global runtime.
pub fn expand_command(
    templates: &BTreeMap<String, CommandTemplate>,
    global: &RuntimeGlobal,
    group: &RuntimeGroup,
    spec: &CommandSpec,
) -> Result<RuntimeCommand, ExpandError> {
    // Template parameters are substituted before anything else; `${…}` and
    // `%{…}` never see each other.
    let effective = match &spec.template {
        Some(name) => {
            let tpl = templates.get(name).ok_or_else(|| ExpandError::TemplateNotFound {
                command: spec.name.clone(),
                template: name.clone(),
            })?;
            template::apply(tpl, spec)?
        }
        None => spec.clone(),
    };

    let scope = format!("command `{}`", effective.name);
    let vars = merge_vars(&scope, &group.vars, &effective.vars)?;
    crate::expand::vars::verify_table(&vars)?;
    let expander = VarExpander::new(&vars);

    let program = expander.expand_str(&effective.cmd)?;
    if program.is_empty() {
        return Err(ExpandError::EmptyCommand(effective.name.clone()));
    }
    let args = expander.expand_all(&effective.args)?;

    let workdir = match effective.workdir.as_deref() {
        // Explicit empty string pins the runner's working directory.
        Some("") => None,
        Some(w) => Some(expander.expand_str(w)?),
        None => group.workdir.clone(),
    };

    let output = effective
        .output
        .as_deref()
        .map(|o| -> Result<ValidatedPath, ExpandError> {
            let expanded = expander.expand_str(o)?;
            PathValidator::validate(&expanded, &ValidateOptions::default()).map_err(|source| {
                ExpandError::OutputPath {
                    command: effective.name.clone(),
                    source,
                }
            })
        })
        .transpose()?;

    // Merged environment: group env as base, allowlisted imports, then the
    // trusted overlay on top.
    let mut env = group.env.clone();
    let imported = envfilter::import(
        &effective.env_import,
        &group.allowlist,
        group.mode,
        &group.name,
        &global.env_snapshot,
    )?;
    env.extend(imported);
    env.extend(expand_env_map(&expander, &effective.env_vars)?);

    let (effective_timeout, level) =
        timeout::resolve(effective.timeout, group.timeout, global.timeout);
    let timeout_resolution = TimeoutResolution {
        seconds: effective_timeout,
        level,
        command_name: effective.name.clone(),
        group_name: group.name.clone(),
    };

    Ok(RuntimeCommand {
        name: effective.name.clone(),
        group: group.name.clone(),
        program,
        args,
        env,
        workdir,
        output,
        timeout: effective.timeout,
        effective_timeout,
        timeout_resolution,
        risk: effective.risk.unwrap_or_default(),
        max_risk_level: group.max_risk_level,
        run_as_user: effective.run_as_user.clone(),
        run_as_group: effective.run_as_group.clone(),
        output_size_limit: global.output_size_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::expand::timeout::TimeoutLevel;

    fn snapshot() -> EnvSnapshot {
        EnvSnapshot::from_entries([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/op".to_string()),
            ("SECRET".to_string(), "shh".to_string()),
        ])
    }

    fn lower(cfg: &str) -> (ConfigSpec, RuntimeGlobal) {
        let spec = load_config(cfg).unwrap();
        let global = expand_global(&spec, snapshot()).unwrap();
        (spec, global)
    }

    #[test]
    fn global_env_comes_from_allowlisted_imports_only() {
        let (_, global) = lower(
            r#"
            [global]
            env_allowed = ["PATH"]
            env_import = ["PATH"]
            "#,
        );
        assert_eq!(global.env["PATH"], "/usr/bin:/bin");
        assert_eq!(global.env.len(), 1);
    }

    #[test]
    fn global_import_outside_allowlist_fails() {
        let spec = load_config(
            r#"
            [global]
            env_allowed = ["PATH"]
            env_import = ["SECRET"]
            "#,
        )
        .unwrap();
        let err = expand_global(&spec, snapshot()).unwrap_err();
        assert_eq!(err.tag(), "env_import_not_allowed");
    }

    #[test]
    fn command_expansion_end_to_end() {
        let (spec, global) = lower(
            r#"
            [global]
            timeout = 120
            env_allowed = ["HOME"]

            [global.vars]
            base = "/srv/app"

            [[groups]]
            name = "deploy"
            [groups.vars]
            release = "%{base}/current"
            [[groups.commands]]
            name = "list"
            cmd = "/bin/ls"
            args = ["-l", "%{release}"]
            env_vars = { APP_DIR = "%{release}" }
            env_import = ["HOME"]
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        let cmd =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();

        assert_eq!(cmd.program, "/bin/ls");
        assert_eq!(cmd.args, vec!["-l".to_string(), "/srv/app/current".to_string()]);
        assert_eq!(cmd.env["APP_DIR"], "/srv/app/current");
        assert_eq!(cmd.env["HOME"], "/home/op");
        assert_eq!(cmd.effective_timeout, 120);
        assert_eq!(cmd.timeout_resolution.level, TimeoutLevel::Global);
        assert_eq!(cmd.command_line(), "/bin/ls -l /srv/app/current");
    }

    #[test]
    fn overlay_beats_import_on_collision() {
        let (spec, global) = lower(
            r#"
            [global]
            env_allowed = ["HOME"]

            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/true"
            env_vars = { HOME = "/custom" }
            env_import = ["HOME"]
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        let cmd =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();
        assert_eq!(cmd.env["HOME"], "/custom");
    }

    #[test]
    fn group_reject_mode_blocks_command_imports() {
        let (spec, global) = lower(
            r#"
            [global]
            env_allowed = ["PATH"]

            [[groups]]
            name = "locked"
            env_allowed = []
            [[groups.commands]]
            name = "c"
            cmd = "/bin/true"
            env_import = ["PATH"]
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        assert_eq!(group.mode, InheritanceMode::Reject);
        let err =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0])
                .unwrap_err();
        assert_eq!(err.tag(), "env_import_not_allowed");
    }

    #[test]
    fn var_type_override_mismatch_rejected() {
        let (spec, global) = lower(
            r#"
            [global.vars]
            items = ["a"]

            [[groups]]
            name = "g"
            [groups.vars]
            items = "scalar-now"
            "#,
        );
        let err = expand_group(&global, &spec.groups[0]).unwrap_err();
        assert_eq!(err.tag(), "var_type_mismatch");
    }

    #[test]
    fn template_workdir_inherited_and_params_expanded() {
        let (spec, global) = lower(
            r#"
            [templates.echo]
            cmd = "/bin/echo"
            args = ["${msg}"]
            workdir = "/tmp"

            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "hello"
            template = "echo"
            params = { msg = "hi" }
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        let cmd =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();
        assert_eq!(cmd.command_line(), "/bin/echo hi");
        assert_eq!(cmd.workdir.as_deref(), Some("/tmp"));
        assert_eq!(cmd.timeout_resolution.level, TimeoutLevel::Default);
        assert_eq!(cmd.effective_timeout, 60);
    }

    #[test]
    fn unlimited_timeout_propagates_from_global() {
        let (spec, global) = lower(
            r#"
            [global]
            timeout = 0

            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "sleepy"
            cmd = "/bin/sleep"
            args = ["5"]
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        let cmd =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();
        assert_eq!(cmd.effective_timeout, 0);
        assert_eq!(cmd.timeout_resolution.level, TimeoutLevel::Global);
    }

    #[test]
    fn group_timeout_beats_global_and_yields_to_command() {
        let (spec, global) = lower(
            r#"
            [global]
            timeout = 300

            [[groups]]
            name = "g"
            timeout = 30
            [[groups.commands]]
            name = "inherits-group"
            cmd = "/bin/true"
            [[groups.commands]]
            name = "own-deadline"
            cmd = "/bin/true"
            timeout = 5
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();

        let first =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();
        assert_eq!(first.effective_timeout, 30);
        assert_eq!(first.timeout_resolution.level, TimeoutLevel::Group);

        let second =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[1]).unwrap();
        assert_eq!(second.effective_timeout, 5);
        assert_eq!(second.timeout_resolution.level, TimeoutLevel::Command);
    }

    #[test]
    fn workdir_empty_string_means_runner_cwd() {
        let (spec, global) = lower(
            r#"
            [global]
            workdir = "/srv"

            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "here"
            cmd = "/bin/pwd"
            workdir = ""
            "#,
        );
        let group = expand_group(&global, &spec.groups[0]).unwrap();
        assert_eq!(group.workdir.as_deref(), Some("/srv"));
        let cmd =
            expand_command(&spec.templates, &global, &group, &spec.groups[0].commands[0]).unwrap();
        assert_eq!(cmd.workdir, None);
    }
}
