//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use tandem_core::{AreaName, PersistedPayload};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print the decoded contents of a slot
    pub fn print_slot(&self, area: AreaName, key: &str, payload: Option<&PersistedPayload>) {
        match self.format {
            OutputFormat::Human => {
                println!("Area:      {}", area);
                println!("Key:       {}", key);
                let Some(payload) = payload else {
                    println!();
                    println!("No state stored.");
                    return;
                };
                match payload {
                    PersistedPayload::Versioned(snapshot) => {
                        println!("Format:    versioned");
                        println!("Writer:    {}", snapshot.writer_id);
                        println!("Timestamp: {}", format_timestamp(snapshot.timestamp));
                    }
                    PersistedPayload::Legacy(_) => println!("Format:    legacy"),
                }
                println!();
                println!("{}", pretty(payload.value()));
            }
            OutputFormat::Json => {
                println!("{}", pretty(&slot_json(area, key, payload)));
            }
            OutputFormat::Quiet => {
                if let Some(payload) = payload {
                    println!("{}", payload.value());
                }
            }
        }
    }

    /// Print a state value
    pub fn print_state(&self, state: &Value) {
        match self.format {
            OutputFormat::Human | OutputFormat::Json => println!("{}", pretty(state)),
            OutputFormat::Quiet => println!("{}", state),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr unless quiet
    pub fn warning(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }
}

fn slot_json(area: AreaName, key: &str, payload: Option<&PersistedPayload>) -> Value {
    let mut out = json!({"area": area, "key": key, "format": null, "state": null});
    match payload {
        Some(PersistedPayload::Versioned(snapshot)) => {
            out["format"] = json!("versioned");
            out["writer_id"] = json!(snapshot.writer_id);
            out["timestamp"] = json!(snapshot.timestamp);
            out["state"] = snapshot.value.clone();
        }
        Some(PersistedPayload::Legacy(value)) => {
            out["format"] = json!("legacy");
            out["state"] = value.clone();
        }
        None => {}
    }
    out
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Render a millisecond timestamp with its UTC time when it is one
fn format_timestamp(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(at) if ms > 0 => format!("{} ({})", ms, at.format("%Y-%m-%d %H:%M:%S%.3f UTC")),
        _ => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::StateSnapshot;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_slot_json_versioned() {
        let payload =
            PersistedPayload::Versioned(StateSnapshot::new(json!({"a": 1}), "writer-1", 42));
        let out = slot_json(AreaName::Sync, "tandem", Some(&payload));
        assert_eq!(out["area"], "sync");
        assert_eq!(out["format"], "versioned");
        assert_eq!(out["writer_id"], "writer-1");
        assert_eq!(out["timestamp"], 42);
        assert_eq!(out["state"], json!({"a": 1}));
    }

    #[test]
    fn test_slot_json_legacy_and_empty() {
        let legacy = PersistedPayload::Legacy(json!({"a": 1}));
        let out = slot_json(AreaName::Local, "tandem", Some(&legacy));
        assert_eq!(out["format"], "legacy");
        assert!(out.get("writer_id").is_none());

        let empty = slot_json(AreaName::Local, "tandem", None);
        assert!(empty["format"].is_null());
        assert!(empty["state"].is_null());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "0");
        assert_eq!(
            format_timestamp(1_700_000_000_000),
            "1700000000000 (2023-11-14 22:13:20.000 UTC)"
        );
    }
}
