//! `%{name}` variable expansion.
//!
//! Each scope carries two disjoint tables, scalar and array. A `%{x}` in a
//! string context must name a scalar; array variables can only be spliced
//! where an array is expected, and their elements are themselves subject to
//! scalar expansion. Resolution is lazy, memoized per scope, and guarded by
//! a visited set plus a depth bound.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

pub const MAX_EXPANSION_DEPTH: usize = 100;
pub const MAX_VARS_PER_SCOPE: usize = 1000;
pub const MAX_ARRAY_ELEMENTS: usize = 1000;
pub const MAX_VALUE_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VarError {
    #[error("undefined variable `{name}` (expansion chain: {})", chain.join(" -> "))]
    Undefined { name: String, chain: Vec<String> },

    #[error("circular variable reference (expansion chain: {})", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("variable expansion exceeded {MAX_EXPANSION_DEPTH} levels at `{name}`")]
    MaxDepth { name: String },

    #[error("array variable `{name}` referenced in a string context")]
    ArrayInStringContext { name: String },

    #[error("unterminated `%{{` reference in `{text}`")]
    Unterminated { text: String },

    #[error("invalid variable name `{name}` in reference")]
    InvalidName { name: String },
}

impl VarError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Undefined { .. } => "var_undefined",
            Self::Cycle { .. } => "var_cycle",
            Self::MaxDepth { .. } => "var_max_depth",
            Self::ArrayInStringContext { .. } => "var_array_in_string_context",
            Self::Unterminated { .. } | Self::InvalidName { .. } => "var_undefined",
        }
    }
}

pub fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Raw (unexpanded) symbol table for one scope. Values keep their `%{…}`
/// references; expansion happens on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarTable {
    scalars: BTreeMap<String, String>,
    arrays: BTreeMap<String, Vec<String>>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.scalars.insert(name.into(), value.into());
    }

    pub fn insert_array(&mut self, name: impl Into<String>, value: Vec<String>) {
        self.arrays.insert(name.into(), value);
    }

    pub fn scalar(&self, name: &str) -> Option<&str> {
        self.scalars.get(name).map(String::as_str)
    }

    pub fn array(&self, name: &str) -> Option<&[String]> {
        self.arrays.get(name).map(Vec::as_slice)
    }

    pub fn has_scalar(&self, name: &str) -> bool {
        self.scalars.contains_key(name)
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.scalars.len() + self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.arrays.is_empty()
    }

    pub fn array_names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }
}

/// Resolve every entry of a table once, so cycles, undefined references and
/// type misuse surface before any field is expanded, whether or not a field
/// references the variable.
pub fn verify_table(table: &VarTable) -> Result<(), VarError> {
    let expander = VarExpander::new(table);
    for name in table.scalars.keys() {
        expander.expand_str(&format!("%{{{name}}}"))?;
    }
    for name in table.arrays.keys() {
        expander.expand_array(name)?;
    }
    Ok(())
}

/// Expander over one scope's resolved table.
pub struct VarExpander<'a> {
    table: &'a VarTable,
    memo: RefCell<HashMap<String, String>>,
}

impl<'a> VarExpander<'a> {
    pub fn new(table: &'a VarTable) -> Self {
        Self {
            table,
            memo: RefCell::new(HashMap::new()),
        }
    }

    /// Expand every `%{name}` in `input`. A `%` not followed by `{` is
    /// literal.
    pub fn expand_str(&self, input: &str) -> Result<String, VarError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        self.expand_inner(input, &mut chain, &mut visited, 0)
    }

    pub fn expand_all(&self, inputs: &[String]) -> Result<Vec<String>, VarError> {
        inputs.iter().map(|s| self.expand_str(s)).collect()
    }

    /// Expand an array variable: each element scalar-expanded in order.
    pub fn expand_array(&self, name: &str) -> Result<Vec<String>, VarError> {
        let elements = self
            .table
            .array(name)
            .ok_or_else(|| VarError::Undefined {
                name: name.to_string(),
                chain: vec![name.to_string()],
            })?;
        elements.iter().map(|e| self.expand_str(e)).collect()
    }

    fn expand_inner(
        &self,
        input: &str,
        chain: &mut Vec<String>,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<String, VarError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(VarError::Unterminated {
                    text: input.to_string(),
                });
            };
            let name = &after[..end];
            if !is_valid_var_name(name) {
                return Err(VarError::InvalidName {
                    name: name.to_string(),
                });
            }
            out.push_str(&self.resolve(name, chain, visited, depth)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(
        &self,
        name: &str,
        chain: &mut Vec<String>,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<String, VarError> {
        if let Some(hit) = self.memo.borrow().get(name) {
            return Ok(hit.clone());
        }
        if visited.contains(name) {
            let mut cycle = chain.clone();
            cycle.push(name.to_string());
            return Err(VarError::Cycle { chain: cycle });
        }
        if self.table.has_array(name) {
            return Err(VarError::ArrayInStringContext {
                name: name.to_string(),
            });
        }
        let Some(value) = self.table.scalar(name) else {
            let mut missing = chain.clone();
            missing.push(name.to_string());
            return Err(VarError::Undefined {
                name: name.to_string(),
                chain: missing,
            });
        };
        if depth + 1 > MAX_EXPANSION_DEPTH {
            return Err(VarError::MaxDepth {
                name: name.to_string(),
            });
        }

        visited.insert(name.to_string());
        chain.push(name.to_string());
        let expanded = self.expand_inner(value, chain, visited, depth + 1)?;
        chain.pop();
        visited.remove(name);

        self.memo
            .borrow_mut()
            .insert(name.to_string(), expanded.clone());
        Ok(expanded)
    }
}
