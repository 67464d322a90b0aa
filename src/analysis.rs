// src/analysis.rs
//
// Post-run trip analysis over the simulator's tripinfo.xml.
//
// Computes fleet-level averages, appends a text ticket to <logs>/ticket.log
// and appends the metrics to <output>/consolidated_data.json. A missing
// tripinfo file is not an error: there is simply nothing to analyse.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{PathsConfig, Scenario};
use crate::report::TIMESTAMP_FORMAT;

pub const TICKET_LOG: &str = "ticket.log";
pub const CONSOLIDATED_FILE: &str = "consolidated_data.json";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse tripinfo XML: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("failed to serialise analysis: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> AnalysisError + '_ {
    move |source| AnalysisError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One `<tripinfo>` element. Only the attributes used here are read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TripRecord {
    #[serde(rename = "@id", default)]
    pub id: String,
    #[serde(rename = "@duration", default)]
    pub duration: Option<f64>,
    #[serde(rename = "@waitingTime", default)]
    pub waiting_time: Option<f64>,
    #[serde(rename = "@timeLoss", default)]
    pub time_loss: Option<f64>,
    #[serde(rename = "@routeLength", default)]
    pub route_length: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TripInfoDocument {
    #[serde(rename = "tripinfo", default)]
    trips: Vec<TripRecord>,
}

pub fn parse_tripinfo(xml: &str) -> Result<Vec<TripRecord>, AnalysisError> {
    let doc: TripInfoDocument = quick_xml::de::from_str(xml)?;
    Ok(doc.trips)
}

/// Fleet-level averages for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripMetrics {
    pub count: usize,
    /// Mean trip duration (s).
    pub duration: f64,
    /// Mean waiting time (s).
    pub wait: f64,
    /// Mean time loss (s).
    pub loss: f64,
    /// Mean of per-trip average speeds (km/h).
    pub speed: f64,
    pub scenario: String,
    pub mode: String,
}

/// Mean of one trip attribute. A trip missing the attribute (or carrying a
/// non-finite value) is left out of that attribute only.
#[derive(Debug, Clone, Copy, Default)]
struct AttributeMean {
    sum: f64,
    count: u64,
}

impl AttributeMean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub fn compute_metrics(trips: &[TripRecord], scenario: Scenario, mode: &str) -> TripMetrics {
    let mut duration = AttributeMean::default();
    let mut wait = AttributeMean::default();
    let mut loss = AttributeMean::default();
    let mut speed = AttributeMean::default();

    for t in trips {
        duration.add(t.duration);
        wait.add(t.waiting_time);
        loss.add(t.time_loss);
        // km/h from metres over seconds; zero-length trips have no speed.
        let kmh = match (t.route_length, t.duration) {
            (Some(len), Some(d)) if d > 0.0 => Some(len / d * 3.6),
            _ => None,
        };
        speed.add(kmh);
    }

    TripMetrics {
        count: trips.len(),
        duration: duration.value(),
        wait: wait.value(),
        loss: loss.value(),
        speed: speed.value(),
        scenario: scenario.as_str().to_uppercase(),
        mode: mode.to_string(),
    }
}

pub fn render_ticket(id: &str, now: &str, m: &TripMetrics) -> String {
    let rule = "=".repeat(80);
    let thin = "-".repeat(80);
    let status = if m.count > 0 { "SUCCESS" } else { "NO DATA" };
    format!(
        "\n{rule}\n[TICKET #{id}] SIMULATION REPORT\nDATE: {now} | SCENARIO: {} | MODE: {}\n{thin}\n \
         -> Vehicles:      {}\n -> Mean duration: {:.2} s\n -> Mean wait:     {:.2} s\n \
         -> Mean loss:     {:.2} s\n -> Mean speed:    {:.2} km/h\n\nSTATUS: {status}\n{rule}\n",
        m.scenario, m.mode, m.count, m.duration, m.wait, m.loss, m.speed
    )
}

pub struct TripAnalyzer {
    paths: PathsConfig,
    mode: String,
}

impl TripAnalyzer {
    pub fn new(paths: PathsConfig, mode: impl Into<String>) -> Self {
        Self {
            paths,
            mode: mode.into(),
        }
    }

    /// The scenario whose tripinfo.xml was written most recently.
    pub fn latest_tripinfo(&self) -> Option<(Scenario, PathBuf)> {
        [Scenario::Api, Scenario::Osm]
            .into_iter()
            .filter_map(|s| {
                let path = self.paths.tripinfo(s);
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, s, path))
            })
            .max_by_key(|(modified, _, _)| *modified)
            .map(|(_, s, path)| (s, path))
    }

    pub fn analyze_file(&self, path: &Path, scenario: Scenario) -> Result<TripMetrics, AnalysisError> {
        let xml = fs::read_to_string(path).map_err(io_error(path))?;
        let trips = parse_tripinfo(&xml)?;
        Ok(compute_metrics(&trips, scenario, &self.mode))
    }

    /// Analyse the given scenario, or the most recent one when None.
    /// Returns Ok(None) when there is no tripinfo to read.
    pub fn run(&self, scenario: Option<Scenario>) -> Result<Option<TripMetrics>, AnalysisError> {
        let target = match scenario {
            Some(s) => Some((s, self.paths.tripinfo(s))).filter(|(_, p)| p.exists()),
            None => self.latest_tripinfo(),
        };
        let Some((scenario, path)) = target else {
            info!("no tripinfo.xml found; skipping trip analysis");
            return Ok(None);
        };

        let metrics = self.analyze_file(&path, scenario)?;
        self.append_ticket(&metrics)?;
        self.append_consolidated(&metrics)?;
        info!(
            scenario = %metrics.scenario,
            vehicles = metrics.count,
            mean_wait = metrics.wait,
            mean_speed_kmh = metrics.speed,
            "trip analysis complete"
        );
        Ok(Some(metrics))
    }

    fn append_ticket(&self, metrics: &TripMetrics) -> Result<(), AnalysisError> {
        let dir = self.paths.logs();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let path = dir.join(TICKET_LOG);

        let id = format!("{:08X}", rand::random::<u32>());
        let now = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let text = render_ticket(&id, &now, metrics);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.write_all(text.as_bytes()).map_err(io_error(&path))?;
        Ok(())
    }

    fn append_consolidated(&self, metrics: &TripMetrics) -> Result<(), AnalysisError> {
        let dir = self.paths.output();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let path = dir.join(CONSOLIDATED_FILE);

        let mut entries: Vec<JsonValue> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "consolidated data unreadable; starting fresh");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        entries.push(serde_json::json!({
            "timestamp": chrono::Local::now().to_rfc3339(),
            "metrics": metrics,
        }));

        let body = serde_json::to_string_pretty(&entries)?;
        fs::write(&path, body).map_err(io_error(&path))?;
        Ok(())
    }
}
