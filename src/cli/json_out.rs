//! `--json` output mode.
//!
//! When the flag is present the banner and human-formatted output are
//! suppressed and each command emits exactly one JSON document on
//! stdout. The level controls how much detail rides along.

use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Value, json};

/// Requested verbosity of the JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum JsonLevel {
    /// Command name and outcome only
    Minimal,
    /// Plus the summary counters
    Standard,
    /// Plus per-item detail
    Extended,
    /// The unfiltered payload
    Raw,
}

/// Builder for the single document a command emits.
pub struct JsonDoc {
    command: &'static str,
    ok: bool,
    summary: Value,
    detail: Value,
}

impl JsonDoc {
    pub fn new(command: &'static str) -> Self {
        Self {
            command,
            ok: true,
            summary: Value::Null,
            detail: Value::Null,
        }
    }

    pub fn ok(mut self, ok: bool) -> Self {
        self.ok = ok;
        self
    }

    pub fn summary(mut self, value: impl Serialize) -> Self {
        self.summary = serde_json::to_value(value).unwrap_or(Value::Null);
        self
    }

    pub fn detail(mut self, value: impl Serialize) -> Self {
        self.detail = serde_json::to_value(value).unwrap_or(Value::Null);
        self
    }

    /// Render at the requested level.
    pub fn render(&self, level: JsonLevel) -> Value {
        match level {
            JsonLevel::Minimal => json!({
                "command": self.command,
                "ok": self.ok,
            }),
            JsonLevel::Standard => json!({
                "command": self.command,
                "ok": self.ok,
                "summary": self.summary,
            }),
            JsonLevel::Extended => json!({
                "command": self.command,
                "ok": self.ok,
                "summary": self.summary,
                "detail": self.detail,
            }),
            JsonLevel::Raw => {
                if self.detail.is_null() {
                    self.summary.clone()
                } else {
                    self.detail.clone()
                }
            }
        }
    }

    /// Print the document to stdout.
    pub fn emit(&self, level: JsonLevel) {
        let value = self.render(level);
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
    }
}
