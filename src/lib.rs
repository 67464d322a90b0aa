//! Signalflow core library.
//!
//! Traffic-signal control against an external road-traffic simulation:
//! fixed-cycle and queue-adaptive phase controllers, a lock-step control
//! loop with per-signal failure isolation, per-signal congestion statistics
//! and the report sinks they feed. The binary (`src/main.rs`) is a thin
//! harness that wires these together against a live simulator.

pub mod analysis;
pub mod config;
pub mod controller;
pub mod engine;
pub mod observer;
pub mod overlay;
pub mod registry;
pub mod report;
pub mod runner;
pub mod stats;
pub mod telemetry;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use analysis::{TripAnalyzer, TripMetrics};

pub use config::{Config, ControlMode, Scenario};

pub use controller::{
    build_controller, sample_duration, AdaptiveController, ControllerState, DurationContext,
    FixedCycleController, SignalController, StepObservations,
};

pub use engine::{EngineError, ScriptedEngine, SimulationEngine, TraciEngine};

pub use observer::QueueObserver;

pub use overlay::{RemoteOverlay, StatusRow};

pub use registry::{DeviceRecord, DeviceRegistry};

pub use report::{ReportEmitter, ReportSink};

pub use runner::{CancelToken, RunError, RunOutcome, SimulationLoop, Termination};

pub use stats::{ReportRecord, StatsAggregator};

pub use telemetry::TelemetrySink;

pub use types::{DeviceStatus, Phase, PhaseCommand, PhaseKind, PhaseProgram, QueueSample, SignalId, Step};
