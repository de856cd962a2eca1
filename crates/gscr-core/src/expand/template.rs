//! Command templates: `${param}` substitution and field inheritance.
//!
//! Parameters are substituted into the template's own fields before any
//! `%{…}` variable work happens; the two mechanisms are deliberately
//! separate. Inheritance then combines template and command: nullable
//! scalars follow an override model, lists and maps merge, and run-as
//! fields never come from a template.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::config::spec::{CommandSpec, CommandTemplate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template parameter `${{{param}}}` is not bound by command `{command}`")]
    UnboundParam { command: String, param: String },

    #[error("unterminated `${{` placeholder in `{text}`")]
    Unterminated { text: String },
}

impl TemplateError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UnboundParam { .. } => "template_param_unbound",
            Self::Unterminated { .. } => "template_param_unbound",
        }
    }
}

fn substitute(
    input: &str,
    params: &BTreeMap<String, String>,
    used: &mut BTreeSet<String>,
    command: &str,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(TemplateError::Unterminated {
                text: input.to_string(),
            });
        };
        let name = &after[..end];
        let Some(value) = params.get(name) else {
            return Err(TemplateError::UnboundParam {
                command: command.to_string(),
                param: name.to_string(),
            });
        };
        used.insert(name.to_string());
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Apply `template` to `command`, producing the effective command spec.
///
/// Unused parameters are reported with a warning and do not fail the run.
pub fn apply(template: &CommandTemplate, command: &CommandSpec) -> Result<CommandSpec, TemplateError> {
    let params = &command.params;
    let mut used = BTreeSet::new();
    let name = command.name.as_str();

    let tpl_cmd = substitute(&template.cmd, params, &mut used, name)?;
    let tpl_args = template
        .args
        .iter()
        .map(|a| substitute(a, params, &mut used, name))
        .collect::<Result<Vec<_>, _>>()?;
    let tpl_workdir = template
        .workdir
        .as_deref()
        .map(|w| substitute(w, params, &mut used, name))
        .transpose()?;
    let tpl_output = template
        .output
        .as_deref()
        .map(|o| substitute(o, params, &mut used, name))
        .transpose()?;
    let mut tpl_env = BTreeMap::new();
    for (k, v) in &template.env_vars {
        tpl_env.insert(k.clone(), substitute(v, params, &mut used, name)?);
    }

    for param in params.keys() {
        if !used.contains(param) {
            tracing::warn!(
                command = %name,
                param = %param,
                "template parameter bound but never used"
            );
        }
    }

    let mut merged = command.clone();

    // Executable surface: the command's own value wins when present.
    if merged.cmd.is_empty() {
        merged.cmd = tpl_cmd;
    }
    if merged.args.is_empty() {
        merged.args = tpl_args;
    }

    // Override model for nullable scalars. An explicit empty workdir on the
    // command means "runner's working directory" and still overrides.
    if merged.workdir.is_none() {
        merged.workdir = tpl_workdir;
    }
    if merged.output.is_none() {
        merged.output = tpl_output;
    }
    if !merged.timeout.is_set() {
        merged.timeout = template.timeout;
    }
    if merged.risk.is_none() {
        merged.risk = template.risk;
    }

    // Merge model for lists and maps: template entries first, command
    // entries win on collision.
    let mut env = tpl_env;
    env.extend(merged.env_vars);
    merged.env_vars = env;

    let mut imports = template.env_import.clone();
    for name in &command.env_import {
        if !imports.contains(name) {
            imports.push(name.clone());
        }
    }
    merged.env_import = imports;

    let mut vars = template.vars.clone();
    vars.extend(merged.vars);
    merged.vars = vars;

    // run_as_user / run_as_group intentionally untouched: templates cannot
    // grant privilege.

    Ok(merged)
}
