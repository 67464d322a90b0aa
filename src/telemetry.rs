//! telemetry.rs
//!
//! Per-step JSONL telemetry for the control loop.
//!
//! One JSON object per loop step, written to a file when enabled. Controlled
//! entirely by environment variables so runs can switch it on without a
//! config change.
//!
//! # Environment variables
//!
//! - `SIGNALFLOW_TELEMETRY_MODE`: `"off"` (default) or `"jsonl"`.
//! - `SIGNALFLOW_TELEMETRY_PATH`: JSONL file path. Required for `"jsonl"`.
//! - `SIGNALFLOW_TELEMETRY_APPEND`: `"1"`/`"true"`/`"yes"` appends instead of
//!   truncating.
//!
//! Telemetry failures never reach the control loop: an unopenable file or a
//! failed write switches the sink off for the rest of the run.

use std::collections::BTreeMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::types::{SignalId, Step};

/// Current telemetry schema version.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Jsonl,
}

impl TelemetryMode {
    fn parse(raw: Option<String>) -> Self {
        match raw.map(|s| s.to_lowercase()) {
            Some(s) if s == "jsonl" => TelemetryMode::Jsonl,
            _ => TelemetryMode::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = TelemetryMode::parse(lookup("SIGNALFLOW_TELEMETRY_MODE"));
        let path = match mode {
            TelemetryMode::Jsonl => lookup("SIGNALFLOW_TELEMETRY_PATH").map(PathBuf::from),
            TelemetryMode::Off => None,
        };
        let append = lookup("SIGNALFLOW_TELEMETRY_APPEND")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        TelemetryConfig { mode, path, append }
    }

    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        TelemetryConfig {
            mode: TelemetryMode::Jsonl,
            path: Some(path.into()),
            append: false,
        }
    }
}

/// One loop step, as written to the telemetry file.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub schema_version: i64,
    pub step: Step,
    /// Signals with a trusted sample this step.
    pub observed: usize,
    /// Signals whose sensor was gated or whose read failed.
    pub skipped: usize,
    /// Phase commands the engine accepted this step.
    pub switches: usize,
    /// Per-signal engine errors this step.
    pub signal_errors: usize,
    pub queues: BTreeMap<SignalId, u64>,
}

impl StepRecord {
    pub fn new(step: Step) -> Self {
        StepRecord {
            schema_version: SCHEMA_VERSION,
            step,
            observed: 0,
            skipped: 0,
            switches: 0,
            signal_errors: 0,
            queues: BTreeMap::new(),
        }
    }
}

/// A JSONL telemetry sink. All methods are no-ops while the mode is Off.
pub struct TelemetrySink {
    mode: TelemetryMode,
    path: Option<PathBuf>,
    append: bool,
    writer: Option<BufWriter<File>>,
}

impl TelemetrySink {
    pub fn from_env() -> Self {
        Self::from_config(TelemetryConfig::from_env())
    }

    pub fn from_config(cfg: TelemetryConfig) -> Self {
        TelemetrySink {
            mode: cfg.mode,
            path: cfg.path,
            append: cfg.append,
            writer: None,
        }
    }

    pub fn disabled() -> Self {
        Self::from_config(TelemetryConfig {
            mode: TelemetryMode::Off,
            path: None,
            append: false,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == TelemetryMode::Jsonl
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != TelemetryMode::Jsonl {
            return None;
        }

        if self.writer.is_none() {
            let Some(path) = self.path.clone() else {
                warn!("telemetry mode is jsonl but no path is set; telemetry off");
                self.mode = TelemetryMode::Off;
                return None;
            };

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let mut options = OpenOptions::new();
            options.create(true).write(true);
            if self.append {
                options.append(true);
            } else {
                options.truncate(true);
            }

            match options.open(&path) {
                Ok(file) => self.writer = Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open telemetry file; telemetry off");
                    self.mode = TelemetryMode::Off;
                    return None;
                }
            }
        }

        self.writer.as_mut()
    }

    /// Write a JSON value as a single line.
    pub fn log_json(&mut self, value: &JsonValue) {
        let Some(writer) = self.ensure_writer() else {
            return;
        };
        let Ok(line) = serde_json::to_string(value) else {
            return;
        };
        if writeln!(writer, "{}", line).is_err() {
            self.mode = TelemetryMode::Off;
            self.writer = None;
        }
    }

    pub fn log_step(&mut self, record: &StepRecord) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(value) = serde_json::to_value(record) {
            self.log_json(&value);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn mode_defaults_to_off() {
        let cfg = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.mode, TelemetryMode::Off);
        assert!(cfg.path.is_none());

        let cfg = TelemetryConfig::from_lookup(lookup(&[("SIGNALFLOW_TELEMETRY_MODE", "csv")]));
        assert_eq!(cfg.mode, TelemetryMode::Off);
    }

    #[test]
    fn jsonl_mode_reads_path_and_append() {
        let cfg = TelemetryConfig::from_lookup(lookup(&[
            ("SIGNALFLOW_TELEMETRY_MODE", "JSONL"),
            ("SIGNALFLOW_TELEMETRY_PATH", "/tmp/t.jsonl"),
            ("SIGNALFLOW_TELEMETRY_APPEND", "yes"),
        ]));
        assert_eq!(cfg.mode, TelemetryMode::Jsonl);
        assert_eq!(cfg.path, Some(PathBuf::from("/tmp/t.jsonl")));
        assert!(cfg.append);
    }

    #[test]
    fn writes_one_line_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("steps.jsonl");
        {
            let mut sink = TelemetrySink::from_config(TelemetryConfig::jsonl(&path));
            for step in 0..3 {
                let mut rec = StepRecord::new(step);
                rec.observed = 1;
                rec.queues.insert("J1".to_string(), step * 2);
                sink.log_step(&rec);
            }
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: JsonValue = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["schema_version"], 1);
        assert_eq!(last["step"], 2);
        assert_eq!(last["queues"]["J1"], 4);
    }

    #[test]
    fn missing_path_disables_sink() {
        let mut sink = TelemetrySink::from_config(TelemetryConfig {
            mode: TelemetryMode::Jsonl,
            path: None,
            append: false,
        });
        sink.log_step(&StepRecord::new(0));
        assert!(!sink.is_enabled());
    }
}
