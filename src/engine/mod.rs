// src/engine/mod.rs
//
// Simulation engine boundary.
//
// The engine owns vehicle physics, routing and network topology. The control
// loop only advances it one step at a time, reads congestion indicators and
// issues phase commands. Implementations:
// - TraciEngine:    TCP control-protocol client for a running simulator
// - ScriptedEngine: in-process engine with scripted queues (tests, dry runs)

pub mod codec;
pub mod scripted;
pub mod traci;

use thiserror::Error;

use crate::types::{LaneId, PhaseProgram, SignalId, VehicleId};

pub use scripted::ScriptedEngine;
pub use traci::TraciEngine;

/// Step/observe/command API consumed by the control loop.
///
/// All methods take `&mut self`: a real engine is a single connection and
/// every call is a round trip on it.
pub trait SimulationEngine: Send {
    /// Advance the simulation by exactly one step (blocking).
    fn advance_step(&mut self) -> Result<(), EngineError>;

    /// Whether the engine still expects activity (vehicles pending or running).
    fn remaining_activity(&mut self) -> Result<bool, EngineError>;

    /// All signal identifiers known to the engine.
    fn signal_ids(&mut self) -> Result<Vec<SignalId>, EngineError>;

    /// Lanes controlled by a signal, possibly with repeats (one per link).
    fn controlled_lanes(&mut self, signal: &str) -> Result<Vec<LaneId>, EngineError>;

    /// Halted vehicles on a lane during the last step.
    fn halted_count(&mut self, lane: &str) -> Result<u64, EngineError>;

    /// Vehicles present on a lane during the last step.
    fn vehicle_ids_on_lane(&mut self, lane: &str) -> Result<Vec<VehicleId>, EngineError>;

    /// The active phase program of a signal.
    fn phase_program(&mut self, signal: &str) -> Result<PhaseProgram, EngineError>;

    fn active_phase_index(&mut self, signal: &str) -> Result<usize, EngineError>;

    fn set_active_phase_index(&mut self, signal: &str, index: usize) -> Result<(), EngineError>;

    /// Switch the signal off for the rest of the run.
    fn disable_signal(&mut self, signal: &str) -> Result<(), EngineError>;

    /// Signals whose program changed since the last call.
    fn take_program_changes(&mut self) -> Vec<SignalId> {
        Vec::new()
    }

    /// Release the connection. Called once during finalisation.
    fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Engine name for logging.
    fn name(&self) -> &str;
}

/// Errors surfaced by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to simulation engine at {addr} after {attempts} attempt(s): {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn simulator '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed engine response: {0}")]
    Protocol(String),
    #[error("engine rejected command 0x{command:02x}: {description}")]
    CommandFailed { command: u8, description: String },
    #[error("unknown {kind} '{id}'")]
    UnknownObject { kind: &'static str, id: String },
    #[error("phase index {index} out of range for signal '{signal}' ({count} phases)")]
    PhaseOutOfRange {
        signal: SignalId,
        index: usize,
        count: usize,
    },
    #[error("engine connection is closed")]
    Closed,
    #[error("scripted failure: {0}")]
    Scripted(String),
}
