//! KEY=value environment-file parsing.
//!
//! The file is hash-verified before it gets here. Its entries overlay the
//! process-environment snapshot as a trusted source for allowlisted
//! imports; it never reaches the webhook configuration, which is read from
//! the real environment only.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

pub fn parse(text: &str) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("line {}: expected KEY=value, got `{line}`", lineno + 1);
        };
        let key = key.trim();
        if !is_valid_name(key) {
            bail!("line {}: invalid variable name `{key}`", lineno + 1);
        }
        let value = value.trim().trim_matches('"');
        entries.insert(key.to_string(), value.to_string());
    }
    Ok(entries)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
