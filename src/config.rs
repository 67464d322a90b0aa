// src/config.rs
//
// Central configuration for a signalflow run.
//
// Sources, lowest to highest precedence:
//   1) built-in defaults
//   2) YAML file (config/signalflow.yaml unless overridden)
//   3) SIGNALFLOW_* environment variables
//   4) CLI flags (applied by the binary)

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::PhaseKind;

/// Human-readable config schema version.
pub const CONFIG_VERSION: &str = "signalflow-config-v1";

/// Default config file location, relative to the project root.
pub const DEFAULT_CONFIG_PATH: &str = "config/signalflow.yaml";

/// Which scenario family the run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Network built from OpenStreetMap extracts (offline, manifest only).
    Osm,
    /// Network built from the device API (eligible for the remote overlay).
    Api,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Osm => "osm",
            Scenario::Api => "api",
        }
    }

    /// Ticket `source` label.
    pub fn source_label(&self) -> String {
        format!("from_{}", self.as_str())
    }
}

/// Control policy applied to every active signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Fixed cycle with randomized per-phase durations.
    Static,
    /// Demand-responsive with min/max dwell.
    Adaptive,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Static => "STATIC",
            ControlMode::Adaptive => "ADAPTIVE",
        }
    }
}

/// Duration band: samples fall uniformly in `[base - variation, base + variation]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBand {
    pub base: u64,
    pub variation: u64,
}

impl DurationBand {
    pub const fn new(base: u64, variation: u64) -> Self {
        Self { base, variation }
    }

    pub fn low(&self) -> u64 {
        self.base.saturating_sub(self.variation)
    }

    pub fn high(&self) -> u64 {
        self.base.saturating_add(self.variation)
    }
}

/// Fixed-cycle controller parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedCycleConfig {
    pub go: DurationBand,
    pub stop: DurationBand,
    pub caution: DurationBand,
    /// No sampled duration is ever below this.
    pub floor: u64,
    /// Upper bound of the random head start given to each signal at setup.
    pub start_offset_max: u64,
    /// Optional green-follows-red policy: a go phase lasts the last observed
    /// red dwell plus its own sample.
    pub red_coupling: bool,
    /// Red dwell memory before any red phase has been observed.
    pub initial_red_memory: u64,
}

impl Default for FixedCycleConfig {
    fn default() -> Self {
        Self {
            go: DurationBand::new(300, 120),
            stop: DurationBand::new(240, 60),
            caution: DurationBand::new(90, 30),
            floor: 60,
            start_offset_max: 60,
            red_coupling: false,
            initial_red_memory: 300,
        }
    }
}

impl FixedCycleConfig {
    pub fn band(&self, kind: PhaseKind) -> Option<DurationBand> {
        match kind {
            PhaseKind::Go => Some(self.go),
            PhaseKind::Stop => Some(self.stop),
            PhaseKind::Caution => Some(self.caution),
            PhaseKind::Other => None,
        }
    }
}

/// Adaptive controller parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Queue sum at or above which early release is allowed.
    pub threshold: u64,
    /// Steps that must elapse (strictly) before a demand switch.
    pub min_dwell: u64,
    /// Steps after which a switch is forced (strictly greater).
    pub max_dwell: u64,
    /// Fixed dwell of transitional (caution) phases.
    pub transitional_dwell: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            min_dwell: 60,
            max_dwell: 600,
            transitional_dwell: 4,
        }
    }
}

/// Simulation engine connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// Connection attempts before giving up (establishment only).
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Simulator executable to spawn. When None, connect to a running one.
    pub binary: Option<String>,
    /// Simulator config file passed with `-c` when spawning.
    pub config_file: Option<PathBuf>,
    /// Optional cap on the number of loop steps.
    pub max_steps: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8813,
            connect_retries: 10,
            retry_delay_ms: 1000,
            binary: None,
            config_file: None,
            max_steps: None,
        }
    }
}

impl EngineConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote device status overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    /// Base URL; SUPABASE_URL takes precedence when set.
    pub url: Option<String>,
    pub table: String,
    pub timeout_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            table: "dispositivos".to_string(),
            timeout_ms: 5000,
        }
    }
}

/// Filesystem layout of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub scenarios_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            logs_dir: PathBuf::from("logs"),
            scenarios_dir: PathBuf::from("scenarios"),
        }
    }
}

impl PathsConfig {
    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn output(&self) -> PathBuf {
        self.resolve(&self.output_dir)
    }

    pub fn logs(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn scenario_dir(&self, scenario: Scenario) -> PathBuf {
        self.resolve(&self.scenarios_dir)
            .join(scenario.source_label())
    }

    /// `<scenario_dir>/<scenario>.sumocfg`
    pub fn simulator_config(&self, scenario: Scenario) -> PathBuf {
        self.scenario_dir(scenario)
            .join(format!("{}.sumocfg", scenario.as_str()))
    }

    pub fn manifest(&self, scenario: Scenario) -> PathBuf {
        self.output()
            .join(format!("{}_devices_manifest.json", scenario.as_str()))
    }

    pub fn tickets(&self, scenario: Scenario) -> PathBuf {
        self.output()
            .join(format!("{}_simulation_tickets.json", scenario.as_str()))
    }

    pub fn tripinfo(&self, scenario: Scenario) -> PathBuf {
        self.scenario_dir(scenario).join("tripinfo.xml")
    }
}

/// Full run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seed for every random draw in the run. None picks one at startup.
    pub seed: Option<u64>,
    pub fixed: FixedCycleConfig,
    pub adaptive: AdaptiveConfig,
    pub engine: EngineConfig,
    pub overlay: OverlayConfig,
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: None,
            fixed: FixedCycleConfig::default(),
            adaptive: AdaptiveConfig::default(),
            engine: EngineConfig::default(),
            overlay: OverlayConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    /// Parse a config from YAML text and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Load the file if present (defaults otherwise), then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let path = path.unwrap_or(&default_path);

        let mut cfg = if path.exists() {
            info!(path = %path.display(), "loading config");
            Self::from_yaml_file(path)?
        } else {
            info!(path = %path.display(), "config file not found; using defaults");
            Config::default()
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply SIGNALFLOW_* overrides using the given lookup.
    ///
    /// Any variable that fails to parse is ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut seed = self.seed.unwrap_or_default();
        if override_from(&lookup, "SIGNALFLOW_SEED", &mut seed) {
            self.seed = Some(seed);
        }
        override_from(&lookup, "SIGNALFLOW_ADAPTIVE_THRESHOLD", &mut self.adaptive.threshold);
        override_from(&lookup, "SIGNALFLOW_ADAPTIVE_MIN_DWELL", &mut self.adaptive.min_dwell);
        override_from(&lookup, "SIGNALFLOW_ADAPTIVE_MAX_DWELL", &mut self.adaptive.max_dwell);
        override_from(&lookup, "SIGNALFLOW_FIXED_FLOOR", &mut self.fixed.floor);
        override_from(&lookup, "SIGNALFLOW_ENGINE_PORT", &mut self.engine.port);
    }

    /// Short stable hash of the resolved config, for run headers.
    pub fn fingerprint(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(yaml.as_bytes());
        digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adaptive.min_dwell > self.adaptive.max_dwell {
            return Err(ConfigError::validation(
                "adaptive.min_dwell",
                format!(
                    "min_dwell ({}) must not exceed max_dwell ({})",
                    self.adaptive.min_dwell, self.adaptive.max_dwell
                ),
            ));
        }
        if self.adaptive.transitional_dwell == 0 {
            return Err(ConfigError::validation(
                "adaptive.transitional_dwell",
                "transitional_dwell must be > 0",
            ));
        }
        if self.fixed.floor == 0 {
            return Err(ConfigError::validation("fixed.floor", "floor must be > 0"));
        }
        for (field, band) in [
            ("fixed.go", self.fixed.go),
            ("fixed.stop", self.fixed.stop),
            ("fixed.caution", self.fixed.caution),
        ] {
            if band.high() < self.fixed.floor {
                return Err(ConfigError::validation(
                    field,
                    format!(
                        "band [{}, {}] lies entirely below floor {}",
                        band.low(),
                        band.high(),
                        self.fixed.floor
                    ),
                ));
            }
        }
        if self.engine.port == 0 {
            return Err(ConfigError::validation("engine.port", "port must be > 0"));
        }
        if self.engine.connect_retries == 0 {
            return Err(ConfigError::validation(
                "engine.connect_retries",
                "connect_retries must be >= 1",
            ));
        }
        if self.engine.max_steps == Some(0) {
            return Err(ConfigError::validation(
                "engine.max_steps",
                "max_steps must be > 0 when set",
            ));
        }
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, name: &str, slot: &mut T) -> bool
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
{
    let Some(raw) = lookup(name) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            info!("[config] {name} = {v} (overrode default)");
            *slot = v;
            true
        }
        Err(_) => {
            warn!("[config] could not parse {name} = {raw:?}; keeping {slot}");
            false
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config validation error in '{field}': {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
