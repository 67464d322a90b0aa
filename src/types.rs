// src/types.rs
//
// Common shared types for the signal control loop.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable signal identifier in the simulation engine's namespace.
pub type SignalId = String;

/// Lane identifier in the simulation engine's namespace.
pub type LaneId = String;

/// Vehicle identifier in the simulation engine's namespace.
pub type VehicleId = String;

/// Loop step index. One engine advance per step, starting at 0.
pub type Step = u64;

/// Coarse classification of a phase state string.
///
/// State strings carry one character per controlled link group:
/// `G`/`g` go, `y`/`Y` caution, `r`/`R` stop (case-insensitive here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// At least one go indicator.
    Go,
    /// Caution indicator and no go indicator (transitional).
    Caution,
    /// Only stop indicators.
    Stop,
    /// Anything else (off, blinking, empty).
    Other,
}

impl PhaseKind {
    pub fn classify(state: &str) -> Self {
        let mut go = false;
        let mut caution = false;
        let mut stop = false;
        for c in state.chars() {
            match c.to_ascii_lowercase() {
                'g' => go = true,
                'y' => caution = true,
                'r' => stop = true,
                _ => {}
            }
        }

        if caution && !go {
            PhaseKind::Caution
        } else if go {
            PhaseKind::Go
        } else if stop {
            PhaseKind::Stop
        } else {
            PhaseKind::Other
        }
    }

    pub fn is_transitional(self) -> bool {
        self == PhaseKind::Caution
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Go => "go",
            PhaseKind::Caution => "caution",
            PhaseKind::Stop => "stop",
            PhaseKind::Other => "other",
        }
    }
}

/// One lighting configuration of a signal program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub state: String,
    /// Nominal duration as reported by the engine (simulation seconds).
    pub nominal_duration: f64,
}

impl Phase {
    pub fn new(state: impl Into<String>, nominal_duration: f64) -> Self {
        Self {
            state: state.into(),
            nominal_duration,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        PhaseKind::classify(&self.state)
    }
}

/// Ordered, non-empty-by-convention phase sequence for one signal.
///
/// Fetched once per signal at setup; controllers never query the engine for
/// it again unless the engine reports a program change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseProgram {
    phases: Vec<Phase>,
}

impl PhaseProgram {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Strictly forward-cyclic successor.
    pub fn next_index(&self, index: usize) -> usize {
        if self.phases.is_empty() {
            0
        } else {
            (index + 1) % self.phases.len()
        }
    }

    pub fn kind_at(&self, index: usize) -> PhaseKind {
        self.phases
            .get(index)
            .map(Phase::kind)
            .unwrap_or(PhaseKind::Other)
    }

    /// First phase of the given kind, if any.
    pub fn first_of(&self, kind: PhaseKind) -> Option<usize> {
        self.phases.iter().position(|p| p.kind() == kind)
    }
}

/// Operational status of a device (signal head or its sensor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    /// Parse a status string (case-insensitive). Unrecognised values map to Unknown.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => DeviceStatus::Active,
            "inactive" => DeviceStatus::Inactive,
            "maintenance" => DeviceStatus::Maintenance,
            _ => DeviceStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Congestion reading for one signal at one step, summed over its unique lanes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSample {
    pub halted_count: u64,
    pub vehicle_ids: BTreeSet<VehicleId>,
}

impl QueueSample {
    pub fn new<I, V>(halted_count: u64, vehicles: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<VehicleId>,
    {
        Self {
            halted_count,
            vehicle_ids: vehicles.into_iter().map(Into::into).collect(),
        }
    }
}

/// Why a controller asked for a phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// Alignment to the controller's starting phase during setup.
    Initial,
    /// Fixed schedule elapsed.
    Schedule,
    /// Queue demand above threshold after the minimum dwell.
    Demand,
    /// Maximum dwell exceeded.
    MaxDwell,
    /// Transitional phase dwell elapsed.
    Transitional,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchReason::Initial => "initial",
            SwitchReason::Schedule => "schedule",
            SwitchReason::Demand => "demand",
            SwitchReason::MaxDwell => "max_dwell",
            SwitchReason::Transitional => "transitional",
        }
    }
}

/// A phase command produced by a controller and issued by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCommand {
    pub signal: SignalId,
    pub from_index: usize,
    pub to_index: usize,
    pub reason: SwitchReason,
}
