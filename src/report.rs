// src/report.rs
//
// Report sink: tickets plus a run summary, written at loop finalisation.
//
// Outputs (under the configured output directory):
// - <scenario>_simulation_tickets.json: one ticket per observed signal
// - run_summary.json: run metadata with a checksum over the records

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::{ControlMode, PathsConfig, Scenario};
use crate::registry::DeviceRegistry;
use crate::runner::RunOutcome;
use crate::stats::ReportRecord;

/// Timestamp layout used in tickets and summaries.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const SUMMARY_FILE: &str = "run_summary.json";

/// Placeholder for device identifiers the registry does not know.
pub const UNKNOWN_DEVICE: &str = "N/A";

/// Receives the outcome of a run exactly once, at finalisation.
pub trait ReportSink: Send {
    fn emit(&mut self, outcome: &RunOutcome) -> Result<(), ReportError>;
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMetrics {
    pub flow_count: usize,
    pub max_queue: u64,
    pub avg_queue: f64,
}

/// Per-signal performance ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub sumo_id: String,
    pub tls_mac: String,
    pub camera_mac: String,
    pub source: String,
    pub metrics: TicketMetrics,
    pub mode: String,
    pub timestamp: String,
}

/// Summary of one run, for comparing runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub scenario: String,
    pub mode: String,
    pub seed: u64,
    pub steps: u64,
    pub termination: String,
    pub error: Option<String>,
    pub record_count: usize,
    pub switches: u64,
    pub signal_errors: u64,
    pub uncontrolled: Vec<String>,
    pub timestamp: String,
    pub checksum: String,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn build_tickets(
    records: &[ReportRecord],
    registry: &DeviceRegistry,
    scenario: Scenario,
    mode: ControlMode,
    timestamp: &str,
) -> Vec<Ticket> {
    records
        .iter()
        .map(|r| Ticket {
            sumo_id: r.signal_id.clone(),
            tls_mac: registry
                .tls_mac(&r.signal_id)
                .unwrap_or(UNKNOWN_DEVICE)
                .to_string(),
            camera_mac: registry
                .camera_mac(&r.signal_id)
                .unwrap_or(UNKNOWN_DEVICE)
                .to_string(),
            source: scenario.source_label(),
            metrics: TicketMetrics {
                flow_count: r.distinct_vehicle_flow,
                max_queue: r.max_queue,
                avg_queue: round2(r.average_queue),
            },
            mode: mode.as_str().to_string(),
            timestamp: timestamp.to_string(),
        })
        .collect()
}

/// SHA-256 over the records and seed. Averages are fixed to 6 decimals so
/// the digest is stable across platforms.
pub fn compute_checksum(records: &[ReportRecord], seed: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    for r in records {
        hasher.update(r.signal_id.as_bytes());
        hasher.update((r.distinct_vehicle_flow as u64).to_le_bytes());
        hasher.update(r.max_queue.to_le_bytes());
        let avg = (r.average_queue * 1_000_000.0).round() as i64;
        hasher.update(avg.to_le_bytes());
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let io_err = |source| ReportError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

/// Writes tickets and the run summary to disk.
pub struct ReportEmitter {
    tickets_path: PathBuf,
    summary_path: PathBuf,
    scenario: Scenario,
    mode: ControlMode,
    seed: u64,
    registry: DeviceRegistry,
    timestamp: Option<String>,
}

impl ReportEmitter {
    pub fn new(
        paths: &PathsConfig,
        scenario: Scenario,
        mode: ControlMode,
        seed: u64,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            tickets_path: paths.tickets(scenario),
            summary_path: paths.output().join(SUMMARY_FILE),
            scenario,
            mode,
            seed,
            registry,
            timestamp: None,
        }
    }

    /// Pin the timestamp instead of reading the clock at emission.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn tickets_path(&self) -> &Path {
        &self.tickets_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn summarize(&self, outcome: &RunOutcome, timestamp: &str) -> RunSummary {
        RunSummary {
            scenario: self.scenario.as_str().to_string(),
            mode: self.mode.as_str().to_string(),
            seed: self.seed,
            steps: outcome.steps,
            termination: outcome.termination.as_str().to_string(),
            error: outcome.error.as_ref().map(|e| e.to_string()),
            record_count: outcome.records.len(),
            switches: outcome.switches,
            signal_errors: outcome.signal_errors,
            uncontrolled: outcome.uncontrolled.clone(),
            timestamp: timestamp.to_string(),
            checksum: compute_checksum(&outcome.records, self.seed),
        }
    }
}

impl ReportSink for ReportEmitter {
    fn emit(&mut self, outcome: &RunOutcome) -> Result<(), ReportError> {
        let timestamp = self
            .timestamp
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format(TIMESTAMP_FORMAT).to_string());

        let tickets = build_tickets(
            &outcome.records,
            &self.registry,
            self.scenario,
            self.mode,
            &timestamp,
        );
        write_json(&self.tickets_path, &tickets)?;
        write_json(&self.summary_path, &self.summarize(outcome, &timestamp))?;

        info!(
            tickets = tickets.len(),
            path = %self.tickets_path.display(),
            "tickets written"
        );
        Ok(())
    }
}
