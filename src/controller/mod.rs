// src/controller/mod.rs
//
// Signal-phase controllers.
//
// A controller owns one ControllerState per managed signal and never talks
// to the engine after setup. Each step it turns the step's observations into
// PhaseCommands; the loop issues them and acknowledges the ones the engine
// accepted, which is the only point where a controller's state advances.
//
// Cross-signal independence: a signal's decision reads only its own state and
// its own observation, so evaluation order across signals is irrelevant.

pub mod adaptive;
pub mod fixed;

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::{Config, ControlMode};
use crate::engine::SimulationEngine;
use crate::types::{PhaseCommand, PhaseProgram, QueueSample, SignalId, Step};

pub use adaptive::AdaptiveController;
pub use fixed::{sample_duration, DurationContext, FixedCycleController};

/// Per-signal phase-timing state, exclusively owned by its controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    /// Cached phase program (fetched at setup).
    pub program: PhaseProgram,
    /// Always a valid index into `program`.
    pub current_phase_index: usize,
    /// Step at which the current phase became active. May be negative when a
    /// signal is given a head start at setup.
    pub last_switch_step: i64,
    /// Committed duration of the current phase (never below the policy floor).
    pub current_phase_duration: u64,
    /// Last observed red dwell, used by the optional green-follows-red policy.
    pub last_red_duration: Option<u64>,
}

impl ControllerState {
    pub fn new(program: PhaseProgram, index: usize, last_switch_step: i64, duration: u64) -> Self {
        Self {
            program,
            current_phase_index: index,
            last_switch_step,
            current_phase_duration: duration,
            last_red_duration: None,
        }
    }

    /// Steps spent in the current phase at `step`.
    pub fn dwell(&self, step: Step) -> u64 {
        let elapsed = step as i64 - self.last_switch_step;
        elapsed.max(0) as u64
    }

    pub fn next_index(&self) -> usize {
        self.program.next_index(self.current_phase_index)
    }
}

/// What the loop learned about each signal this step.
///
/// `samples` holds full readings from trusted sensors and feeds statistics.
/// `demand` holds the halted count of every signal that could be read,
/// trusted or not, and is what controllers decide on. `failed` lists signals
/// whose engine read failed; those must not advance this step.
#[derive(Debug, Clone, Default)]
pub struct StepObservations {
    samples: BTreeMap<SignalId, QueueSample>,
    demand: BTreeMap<SignalId, u64>,
    failed: BTreeSet<SignalId>,
}

impl StepObservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// A trusted sample; also counts as the signal's demand.
    pub fn insert(&mut self, signal: SignalId, sample: QueueSample) {
        self.demand.insert(signal.clone(), sample.halted_count);
        self.samples.insert(signal, sample);
    }

    /// Demand only, for a signal whose sensor is not trusted for statistics.
    pub fn insert_demand(&mut self, signal: SignalId, halted: u64) {
        self.demand.insert(signal, halted);
    }

    pub fn mark_failed(&mut self, signal: SignalId) {
        self.failed.insert(signal);
    }

    pub fn is_failed(&self, signal: &str) -> bool {
        self.failed.contains(signal)
    }

    pub fn get(&self, signal: &str) -> Option<&QueueSample> {
        self.samples.get(signal)
    }

    pub fn halted(&self, signal: &str) -> Option<u64> {
        self.demand.get(signal).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SignalId, &QueueSample)> {
        self.samples.iter()
    }
}

/// Result of controller setup.
#[derive(Debug, Default)]
pub struct SetupOutcome {
    /// Commands aligning signals to their starting phase.
    pub commands: Vec<PhaseCommand>,
    /// Signals excluded from control for the whole run.
    pub skipped: Vec<SignalId>,
}

/// A phase-timing policy over a set of signals.
pub trait SignalController: Send {
    fn mode(&self) -> ControlMode;

    /// Initialise state for each signal. Signals whose program cannot be
    /// retrieved are skipped and never advanced.
    fn setup(&mut self, engine: &mut dyn SimulationEngine, signals: &[SignalId]) -> SetupOutcome;

    /// Commands for signals that should advance at `step`. Signals marked
    /// failed in `observations` get none. State only moves in `acknowledge`.
    fn decide(&self, step: Step, observations: &StepObservations) -> Vec<PhaseCommand>;

    /// The engine accepted `command` at `step`.
    fn acknowledge(&mut self, command: &PhaseCommand, step: Step);

    /// Stop controlling a signal (e.g. its initial alignment failed).
    fn release(&mut self, signal: &str);

    /// Replace a signal's cached program after the engine reported a change.
    fn refresh_program(&mut self, signal: &str, program: PhaseProgram, active_index: usize, step: Step);

    fn state(&self, signal: &str) -> Option<&ControllerState>;

    fn managed(&self) -> Vec<SignalId>;
}

/// Build the controller for `mode`, seeded for reproducibility.
pub fn build_controller(mode: ControlMode, cfg: &Config, seed: u64) -> Box<dyn SignalController> {
    match mode {
        ControlMode::Static => Box::new(FixedCycleController::new(cfg.fixed.clone(), seed)),
        ControlMode::Adaptive => Box::new(AdaptiveController::new(cfg.adaptive.clone())),
    }
}

/// Fetch a signal's program, returning None (with a warning) when it is
/// missing or empty.
pub(crate) fn fetch_program(
    engine: &mut dyn SimulationEngine,
    signal: &str,
) -> Option<PhaseProgram> {
    match engine.phase_program(signal) {
        Ok(program) if !program.is_empty() => Some(program),
        Ok(_) => {
            warn!(signal, "phase program is empty; signal excluded from control");
            None
        }
        Err(e) => {
            warn!(signal, error = %e, "phase program unavailable; signal excluded from control");
            None
        }
    }
}

/// Re-anchor a state after a program change: clamp the index, restart the
/// dwell clock.
pub(crate) fn rebase_state(
    state: &mut ControllerState,
    program: PhaseProgram,
    active_index: usize,
    step: Step,
    duration: u64,
) {
    let index = if active_index < program.len() {
        active_index
    } else {
        0
    };
    state.program = program;
    state.current_phase_index = index;
    state.last_switch_step = step as i64;
    state.current_phase_duration = duration;
}
