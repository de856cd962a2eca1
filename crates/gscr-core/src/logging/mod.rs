//! Structured audit log pipeline.
//!
//! Execution produces [`Record`]s that flow through a small set of composable
//! [`LogHandler`]s: a level predicate decides acceptance, a redacting wrapper
//! rewrites sensitive values, transports encode and deliver. Handlers are
//! capabilities, not a class hierarchy; adding a sink means adding one more
//! `LogHandler` with its own predicate.
//!
//! Operator diagnostics stay on `tracing`; this pipeline carries the audit
//! surface (group summaries, dry-run plans, webhook notifications), where
//! routing and redaction must be typed and testable.

pub mod redact;
pub mod results;

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Severity of a record. Ordered so that `Warn >= Info` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parses a level name. The empty string maps to `Info`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute value. `Group` keeps keyed sub-structures intact through the
/// sink layer instead of flattening them into positional attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Float(f64),
    Array(Vec<Value>),
    Group(Vec<(String, Value)>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn group(entries: Vec<(String, Value)>) -> Self {
        Self::Group(entries)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Uint(u) => serde_json::Value::from(*u),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Group(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Self::Uint(u)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// One audit record: timestamp, level, message, typed attributes.
#[derive(Debug, Clone)]
pub struct Record {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub attrs: Vec<(String, Value)>,
}

impl Record {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            message: message.into(),
            attrs: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True when the record asks for webhook delivery.
    pub fn wants_notification(&self) -> bool {
        matches!(self.get("slack_notify"), Some(Value::Bool(true)))
    }
}

/// A sink capability: a level predicate plus a delivery method.
pub trait LogHandler: Send + Sync {
    fn enabled(&self, level: Level) -> bool;
    fn handle(&self, record: &Record);
}

/// Fan-out front. Cheap to clone; handlers are shared.
#[derive(Clone)]
pub struct Logger {
    handlers: Arc<Vec<Arc<dyn LogHandler>>>,
}

impl Logger {
    pub fn new(handlers: Vec<Arc<dyn LogHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// A logger with no sinks. Used by tests and the earliest bootstrap
    /// phase, before logging is configured.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn log(&self, record: Record) {
        for handler in self.handlers.iter() {
            if handler.enabled(record.level) {
                handler.handle(&record);
            }
        }
    }
}

/// JSON-lines transport writing to stdout or a log file.
pub struct JsonLineHandler {
    min_level: Level,
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLineHandler {
    pub fn stdout(min_level: Level) -> Self {
        Self {
            min_level,
            out: Mutex::new(Box::new(io::stdout())),
        }
    }

    pub fn file(path: &Path, min_level: Level) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            min_level,
            out: Mutex::new(Box::new(file)),
        })
    }

    fn encode(record: &Record) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "ts".to_string(),
            serde_json::Value::String(record.ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        map.insert(
            "level".to_string(),
            serde_json::Value::String(record.level.as_str().to_string()),
        );
        map.insert(
            "msg".to_string(),
            serde_json::Value::String(record.message.clone()),
        );
        for (k, v) in &record.attrs {
            map.insert(k.clone(), v.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl LogHandler for JsonLineHandler {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn handle(&self, record: &Record) {
        let line = Self::encode(record).to_string();
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // A failed diagnostic write must not take the run down.
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_and_parse() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Warn > Level::Info);
        assert_eq!(Level::parse(""), Some(Level::Info));
        assert_eq!(Level::parse("warn"), Some(Level::Warn));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn record_attrs_round_trip() {
        let rec = Record::new(Level::Info, "hello")
            .attr("group", "g1")
            .attr("count", 3u64)
            .attr("slack_notify", true);
        assert_eq!(rec.get("group"), Some(&Value::String("g1".into())));
        assert!(rec.wants_notification());
        assert!(rec.get("missing").is_none());
    }

    #[test]
    fn json_encoding_nests_groups() {
        let rec = Record::new(Level::Error, "boom").attr(
            "commands",
            Value::group(vec![(
                "cmd_0".to_string(),
                Value::group(vec![("name".to_string(), Value::str("a"))]),
            )]),
        );
        let json = JsonLineHandler::encode(&rec);
        assert_eq!(json["level"], "error");
        assert_eq!(json["commands"]["cmd_0"]["name"], "a");
    }

    #[test]
    fn logger_respects_handler_predicate() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting {
            min: Level,
            seen: AtomicUsize,
        }
        impl LogHandler for Counting {
            fn enabled(&self, level: Level) -> bool {
                level >= self.min
            }
            fn handle(&self, _record: &Record) {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(Counting {
            min: Level::Warn,
            seen: AtomicUsize::new(0),
        });
        let logger = Logger::new(vec![handler.clone()]);
        logger.log(Record::new(Level::Info, "ignored"));
        logger.log(Record::new(Level::Error, "kept"));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    }
}
