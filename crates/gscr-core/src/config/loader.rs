//! Config parsing and semantic validation.
//!
//! Loading happens in three passes: a raw TOML parse, a legacy-field sweep
//! over the raw document (so migration errors name the field instead of
//! drowning in an unknown-field message), then the typed decode followed by
//! semantic checks.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::spec::{CommandSpec, ConfigSpec, GroupSpec, VarValue};
use crate::expand::vars::{
    is_valid_var_name, MAX_ARRAY_ELEMENTS, MAX_VALUE_BYTES, MAX_VARS_PER_SCOPE,
};
use crate::logging::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("legacy field `{field}` is no longer supported: {hint}")]
    LegacyField { field: String, hint: String },

    #[error("duplicate group name `{0}`")]
    DuplicateGroup(String),

    #[error("duplicate command name `{command}` in group `{group}`")]
    DuplicateCommand { group: String, command: String },

    #[error("group `{group}` depends on unknown group `{dependency}`")]
    MissingDependency { group: String, dependency: String },

    #[error("dependency cycle involving group `{0}`")]
    DependencyCycle(String),

    #[error("command `{command}` in group `{group}` references unknown template `{template}`")]
    TemplateNotFound {
        group: String,
        command: String,
        template: String,
    },

    #[error("command `{command}` in group `{group}` has neither `cmd` nor a template")]
    MissingCmd { group: String, command: String },

    #[error("invalid variable name `{name}` in scope `{scope}`")]
    InvalidVarName { scope: String, name: String },

    #[error("invalid environment variable name `{name}` in scope `{scope}`")]
    InvalidEnvName { scope: String, name: String },

    #[error("scope `{scope}` declares {count} variables (limit {MAX_VARS_PER_SCOPE})")]
    TooManyVars { scope: String, count: usize },

    #[error("array variable `{name}` in scope `{scope}` has {count} elements (limit {MAX_ARRAY_ELEMENTS})")]
    ArrayTooLong {
        scope: String,
        name: String,
        count: usize,
    },

    #[error("variable `{name}` in scope `{scope}` exceeds {MAX_VALUE_BYTES} bytes")]
    ValueTooLong { scope: String, name: String },

    #[error("invalid log level `{0}`")]
    InvalidLogLevel(String),
}

impl ConfigError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Parse(_) => "config_parse_failed",
            Self::TemplateNotFound { .. } => "template_not_found",
            Self::MissingDependency { .. } => "group_missing_dependency",
            Self::DependencyCycle(_) => "group_cycle",
            _ => "config_schema_invalid",
        }
    }
}

/// Parse and validate configuration text into a [`ConfigSpec`].
pub fn load_config(text: &str) -> Result<ConfigSpec, ConfigError> {
    let raw: toml::Value = toml::from_str(text)?;
    detect_legacy_fields(&raw)?;
    let spec: ConfigSpec = raw.try_into()?;
    validate(&spec)?;
    Ok(spec)
}

/// Fields from retired config schemas get a pointed migration message.
fn detect_legacy_fields(raw: &toml::Value) -> Result<(), ConfigError> {
    if find_key(raw, "slack_webhook_url") {
        return Err(ConfigError::LegacyField {
            field: "slack_webhook_url".to_string(),
            hint: "webhook URLs are discovered from GSCR_SLACK_WEBHOOK_URL_SUCCESS and \
                   GSCR_SLACK_WEBHOOK_URL_ERROR; the integrity-verified config file must \
                   not carry secrets"
                .to_string(),
        });
    }
    if let Some(groups) = raw.get("groups").and_then(toml::Value::as_array) {
        for group in groups {
            let Some(commands) = group.get("commands").and_then(toml::Value::as_array) else {
                continue;
            };
            for command in commands {
                for legacy in ["user", "group"] {
                    if command.get(legacy).is_some() {
                        return Err(ConfigError::LegacyField {
                            field: legacy.to_string(),
                            hint: format!("use `run_as_{legacy}` instead"),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn find_key(value: &toml::Value, needle: &str) -> bool {
    match value {
        toml::Value::Table(table) => table
            .iter()
            .any(|(k, v)| k == needle || find_key(v, needle)),
        toml::Value::Array(items) => items.iter().any(|v| find_key(v, needle)),
        _ => false,
    }
}

fn is_valid_env_name(name: &str) -> bool {
    is_valid_var_name(name)
}

fn validate(spec: &ConfigSpec) -> Result<(), ConfigError> {
    if Level::parse(&spec.global.log_level).is_none() {
        return Err(ConfigError::InvalidLogLevel(spec.global.log_level.clone()));
    }

    validate_var_table("global", &spec.global.vars)?;
    validate_env_names("global", &spec.global.env_allowed)?;
    validate_env_names("global", &spec.global.env_import)?;

    for (name, template) in &spec.templates {
        let scope = format!("template `{name}`");
        validate_var_table(&scope, &template.vars)?;
        validate_env_names(&scope, &template.env_import)?;
    }

    let mut group_names = BTreeSet::new();
    for group in &spec.groups {
        if !group_names.insert(group.name.as_str()) {
            return Err(ConfigError::DuplicateGroup(group.name.clone()));
        }
    }

    for group in &spec.groups {
        let scope = format!("group `{}`", group.name);
        validate_var_table(&scope, &group.vars)?;
        if let Some(allowed) = &group.env_allowed {
            validate_env_names(&scope, allowed)?;
        }
        validate_env_names(&scope, &group.env_import)?;
        for dep in &group.depends_on {
            if !group_names.contains(dep.as_str()) {
                return Err(ConfigError::MissingDependency {
                    group: group.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        validate_commands(spec, group)?;
    }

    check_acyclic(&spec.groups)?;
    Ok(())
}

fn validate_commands(spec: &ConfigSpec, group: &GroupSpec) -> Result<(), ConfigError> {
    let mut names = BTreeSet::new();
    for command in &group.commands {
        if !names.insert(command.name.as_str()) {
            return Err(ConfigError::DuplicateCommand {
                group: group.name.clone(),
                command: command.name.clone(),
            });
        }
        let scope = format!("command `{}`", command.name);
        validate_var_table(&scope, &command.vars)?;
        validate_env_names(&scope, &command.env_import)?;
        for key in command.env_vars.keys() {
            if !is_valid_env_name(key) {
                return Err(ConfigError::InvalidEnvName {
                    scope: scope.clone(),
                    name: key.clone(),
                });
            }
        }
        validate_command_target(spec, group, command)?;
    }
    Ok(())
}

fn validate_command_target(
    spec: &ConfigSpec,
    group: &GroupSpec,
    command: &CommandSpec,
) -> Result<(), ConfigError> {
    match &command.template {
        Some(template) => {
            if !spec.templates.contains_key(template) {
                return Err(ConfigError::TemplateNotFound {
                    group: group.name.clone(),
                    command: command.name.clone(),
                    template: template.clone(),
                });
            }
        }
        None => {
            if command.cmd.is_empty() {
                return Err(ConfigError::MissingCmd {
                    group: group.name.clone(),
                    command: command.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_var_table(
    scope: &str,
    vars: &BTreeMap<String, VarValue>,
) -> Result<(), ConfigError> {
    if vars.len() > MAX_VARS_PER_SCOPE {
        return Err(ConfigError::TooManyVars {
            scope: scope.to_string(),
            count: vars.len(),
        });
    }
    for (name, value) in vars {
        if !is_valid_var_name(name) {
            return Err(ConfigError::InvalidVarName {
                scope: scope.to_string(),
                name: name.clone(),
            });
        }
        match value {
            VarValue::Scalar(s) => {
                if s.len() > MAX_VALUE_BYTES {
                    return Err(ConfigError::ValueTooLong {
                        scope: scope.to_string(),
                        name: name.clone(),
                    });
                }
            }
            VarValue::Array(items) => {
                if items.len() > MAX_ARRAY_ELEMENTS {
                    return Err(ConfigError::ArrayTooLong {
                        scope: scope.to_string(),
                        name: name.clone(),
                        count: items.len(),
                    });
                }
                for item in items {
                    if item.len() > MAX_VALUE_BYTES {
                        return Err(ConfigError::ValueTooLong {
                            scope: scope.to_string(),
                            name: name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_env_names(scope: &str, names: &[String]) -> Result<(), ConfigError> {
    for name in names {
        if !is_valid_env_name(name) {
            return Err(ConfigError::InvalidEnvName {
                scope: scope.to_string(),
                name: name.clone(),
            });
        }
    }
    Ok(())
}

/// Depth-first cycle check over `depends_on`. The scheduler re-derives the
/// order at run time; this catches the error before anything else runs.
fn check_acyclic(groups: &[GroupSpec]) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let index: BTreeMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (g.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::White; groups.len()];

    fn visit(
        at: usize,
        groups: &[GroupSpec],
        index: &BTreeMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Result<(), ConfigError> {
        match marks[at] {
            Mark::Black => return Ok(()),
            Mark::Grey => return Err(ConfigError::DependencyCycle(groups[at].name.clone())),
            Mark::White => {}
        }
        marks[at] = Mark::Grey;
        for dep in &groups[at].depends_on {
            if let Some(&next) = index.get(dep.as_str()) {
                visit(next, groups, index, marks)?;
            }
        }
        marks[at] = Mark::Black;
        Ok(())
    }

    for i in 0..groups.len() {
        visit(i, groups, &index, &mut marks)?;
    }
    Ok(())
}
