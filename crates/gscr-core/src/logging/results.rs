//! Structured log value for per-command outcomes.
//!
//! A slice of results rendered as a plain attribute list would be flattened
//! by generic sinks; instead the whole collection presents itself as one
//! group value keyed `cmd_0`, `cmd_1`, … so it survives any transport.

use super::Value;
use crate::exec::CommandResult;

/// Cap on entries included in one summary record.
pub const MAX_LOGGED_COMMANDS: usize = 100;

/// Borrowing wrapper that renders command results as a single group value.
#[derive(Debug, Clone, Copy)]
pub struct CommandResults<'a>(pub &'a [CommandResult]);

impl CommandResults<'_> {
    pub fn to_value(&self) -> Value {
        let truncated = self.0.len() > MAX_LOGGED_COMMANDS;
        let mut entries = vec![
            ("total_count".to_string(), Value::Int(self.0.len() as i64)),
            ("truncated".to_string(), Value::Bool(truncated)),
        ];
        for (i, result) in self.0.iter().take(MAX_LOGGED_COMMANDS).enumerate() {
            entries.push((
                format!("cmd_{i}"),
                Value::group(vec![
                    ("name".to_string(), Value::str(&result.name)),
                    (
                        "exit_code".to_string(),
                        Value::Int(i64::from(result.exit_code.unwrap_or(-1))),
                    ),
                    ("output".to_string(), Value::str(&result.stdout)),
                    ("stderr".to_string(), Value::str(&result.stderr)),
                ]),
            ));
        }
        Value::Group(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecFailure;
    use chrono::Utc;

    fn result(name: &str, exit: Option<i32>) -> CommandResult {
        CommandResult {
            name: name.to_string(),
            group: "g".to_string(),
            exit_code: exit,
            stdout: format!("{name} out"),
            stderr: String::new(),
            duration_ms: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            timeout_secs: 60,
            privileged: false,
            error: None,
        }
    }

    #[test]
    fn renders_counts_and_keyed_entries() {
        let results = vec![result("first", Some(0)), result("second", Some(2))];
        let json = CommandResults(&results).to_value().to_json();
        assert_eq!(json["total_count"], 2);
        assert_eq!(json["truncated"], false);
        assert_eq!(json["cmd_0"]["name"], "first");
        assert_eq!(json["cmd_1"]["exit_code"], 2);
        assert_eq!(json["cmd_0"]["output"], "first out");
    }

    #[test]
    fn exactly_at_cap_is_not_truncated() {
        let results: Vec<_> = (0..MAX_LOGGED_COMMANDS)
            .map(|i| result(&format!("c{i}"), Some(0)))
            .collect();
        let json = CommandResults(&results).to_value().to_json();
        assert_eq!(json["truncated"], false);
        assert_eq!(json["total_count"], 100);
        assert!(json.get("cmd_99").is_some());
    }

    #[test]
    fn one_past_cap_truncates_to_cap() {
        let results: Vec<_> = (0..=MAX_LOGGED_COMMANDS)
            .map(|i| result(&format!("c{i}"), Some(0)))
            .collect();
        let json = CommandResults(&results).to_value().to_json();
        assert_eq!(json["truncated"], true);
        assert_eq!(json["total_count"], 101);
        assert!(json.get("cmd_99").is_some());
        assert!(json.get("cmd_100").is_none());
    }

    #[test]
    fn signal_death_renders_exit_minus_one() {
        let mut r = result("killed", None);
        r.error = Some(ExecFailure::Signal(9));
        let json = CommandResults(&[r]).to_value().to_json();
        assert_eq!(json["cmd_0"]["exit_code"], -1);
    }
}
