//! Credential redaction for audit records.
//!
//! Values are rewritten before they reach any transport; keys pass through
//! untouched. The walk descends into groups and arrays so nested command
//! output is covered as well.

use super::{Level, LogHandler, Record, Value};
use regex::Regex;
use std::sync::Arc;

pub const REDACTED: &str = "[REDACTED]";

/// Compiled credential patterns. Stateless; share one instance per process.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Arc<Vec<Regex>>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        // key=value / key: value shapes for common credential keys.
        let patterns = vec![
            Regex::new(
                r#"(?i)\b(password|passwd|pwd|api[-_]?key|access[-_]?key|secret|token|authorization|credentials?)\b(\s*[=:]\s*)(?:bearer\s+)?[^\s"',;&]+"#,
            )
            .expect("redaction pattern is valid"),
            // Bearer-style headers.
            Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/-]+=*").expect("redaction pattern is valid"),
        ];
        Self {
            patterns: Arc::new(patterns),
        }
    }

    pub fn redact_str(&self, input: &str) -> String {
        let mut text = input.to_string();
        for re in self.patterns.iter() {
            text = re
                .replace_all(&text, |caps: &regex::Captures<'_>| {
                    let key = &caps[1];
                    let sep = caps.get(2).map(|m| m.as_str()).unwrap_or(" ");
                    format!("{key}{sep}{REDACTED}")
                })
                .into_owned();
        }
        text
    }

    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                let replaced = self.redact_str(s);
                if replaced != *s {
                    *s = replaced;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            Value::Group(entries) => {
                for (_, v) in entries {
                    self.redact_value(v);
                }
            }
            _ => {}
        }
    }

    pub fn redact_record(&self, record: &Record) -> Record {
        let mut out = record.clone();
        out.message = self.redact_str(&out.message);
        for (_, v) in &mut out.attrs {
            self.redact_value(v);
        }
        out
    }
}

/// Wraps inner handlers; every record is redacted exactly once before fanning
/// out to them.
pub struct RedactingHandler {
    redactor: Redactor,
    inner: Vec<Arc<dyn LogHandler>>,
}

impl RedactingHandler {
    pub fn new(redactor: Redactor, inner: Vec<Arc<dyn LogHandler>>) -> Self {
        Self { redactor, inner }
    }
}

impl LogHandler for RedactingHandler {
    fn enabled(&self, level: Level) -> bool {
        self.inner.iter().any(|h| h.enabled(level))
    }

    fn handle(&self, record: &Record) {
        let redacted = self.redactor.redact_record(record);
        for handler in &self.inner {
            if handler.enabled(redacted.level) {
                handler.handle(&redacted);
            }
        }
    }
}
