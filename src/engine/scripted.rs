// src/engine/scripted.rs
//
// In-process SimulationEngine driven by scripts keyed on the loop step.
//
// Queue and vehicle scripts are evaluated at the index of the last completed
// step, so a script value for step n is what the loop observes at step n.
// Failures can be injected per signal, per lane, or at a given advance.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::{EngineError, SimulationEngine};
use crate::types::{LaneId, Phase, PhaseProgram, SignalId, Step, VehicleId};

type QueueScript = Box<dyn Fn(Step) -> u64 + Send>;
type VehicleScript = Box<dyn Fn(Step) -> Vec<VehicleId> + Send>;

#[derive(Debug, Clone)]
struct ScriptedSignal {
    program: PhaseProgram,
    lanes: Vec<LaneId>,
    active_index: usize,
    disabled: bool,
}

/// A phase change accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub step: Step,
    pub signal: SignalId,
    pub index: usize,
}

pub struct ScriptedEngine {
    advances: u64,
    horizon: u64,
    signals: BTreeMap<SignalId, ScriptedSignal>,
    missing_programs: HashSet<SignalId>,
    rejecting_signals: HashSet<SignalId>,
    unreadable_phases: HashSet<SignalId>,
    failing_lanes: HashSet<LaneId>,
    fail_advance_at: Option<u64>,
    queues: HashMap<LaneId, QueueScript>,
    vehicles: HashMap<LaneId, VehicleScript>,
    pending_programs: Vec<(Step, SignalId, PhaseProgram)>,
    changed: Vec<SignalId>,
    switches: Vec<SwitchEvent>,
    closed: bool,
}

impl ScriptedEngine {
    /// Engine that reports activity for exactly `horizon` steps.
    pub fn new(horizon: u64) -> Self {
        Self {
            advances: 0,
            horizon,
            signals: BTreeMap::new(),
            missing_programs: HashSet::new(),
            rejecting_signals: HashSet::new(),
            unreadable_phases: HashSet::new(),
            failing_lanes: HashSet::new(),
            fail_advance_at: None,
            queues: HashMap::new(),
            vehicles: HashMap::new(),
            pending_programs: Vec::new(),
            changed: Vec::new(),
            switches: Vec::new(),
            closed: false,
        }
    }

    pub fn with_signal<L, S>(mut self, id: &str, phases: Vec<Phase>, lanes: L) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<LaneId>,
    {
        self.signals.insert(
            id.to_string(),
            ScriptedSignal {
                program: PhaseProgram::new(phases),
                lanes: lanes.into_iter().map(Into::into).collect(),
                active_index: 0,
                disabled: false,
            },
        );
        self
    }

    /// Start a signal on a phase other than 0.
    pub fn with_active_index(mut self, id: &str, index: usize) -> Self {
        if let Some(sig) = self.signals.get_mut(id) {
            sig.active_index = index;
        }
        self
    }

    pub fn with_queue<F>(mut self, lane: &str, f: F) -> Self
    where
        F: Fn(Step) -> u64 + Send + 'static,
    {
        self.queues.insert(lane.to_string(), Box::new(f));
        self
    }

    pub fn with_vehicles<F>(mut self, lane: &str, f: F) -> Self
    where
        F: Fn(Step) -> Vec<VehicleId> + Send + 'static,
    {
        self.vehicles.insert(lane.to_string(), Box::new(f));
        self
    }

    /// Program queries for this signal fail.
    pub fn without_program(mut self, id: &str) -> Self {
        self.missing_programs.insert(id.to_string());
        self
    }

    /// Every phase command issued for this signal is rejected. Reads still
    /// succeed.
    pub fn rejecting_signal(mut self, id: &str) -> Self {
        self.rejecting_signals.insert(id.to_string());
        self
    }

    /// Active-phase queries for this signal fail.
    pub fn unreadable_phase(mut self, id: &str) -> Self {
        self.unreadable_phases.insert(id.to_string());
        self
    }

    /// Every read on this lane fails.
    pub fn failing_lane(mut self, lane: &str) -> Self {
        self.failing_lanes.insert(lane.to_string());
        self
    }

    /// The advance that would produce loop step `step` fails.
    pub fn fail_advance_at(mut self, step: Step) -> Self {
        self.fail_advance_at = Some(step);
        self
    }

    /// Swap a signal's program once loop step `step` has been advanced.
    pub fn replace_program_at(mut self, step: Step, id: &str, phases: Vec<Phase>) -> Self {
        self.pending_programs
            .push((step, id.to_string(), PhaseProgram::new(phases)));
        self
    }

    /// Phase changes accepted so far, in issue order.
    pub fn switches(&self) -> &[SwitchEvent] {
        &self.switches
    }

    pub fn is_disabled(&self, id: &str) -> bool {
        self.signals.get(id).map(|s| s.disabled).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn current_step(&self) -> Step {
        self.advances.saturating_sub(1)
    }

    fn signal(&self, id: &str) -> Result<&ScriptedSignal, EngineError> {
        self.signals.get(id).ok_or_else(|| EngineError::UnknownObject {
            kind: "signal",
            id: id.to_string(),
        })
    }

    fn signal_mut(&mut self, id: &str) -> Result<&mut ScriptedSignal, EngineError> {
        self.signals.get_mut(id).ok_or_else(|| EngineError::UnknownObject {
            kind: "signal",
            id: id.to_string(),
        })
    }

    fn check_lane(&self, lane: &str) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.failing_lanes.contains(lane) {
            return Err(EngineError::Scripted(format!("lane '{lane}' unavailable")));
        }
        Ok(())
    }
}

impl SimulationEngine for ScriptedEngine {
    fn advance_step(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.fail_advance_at == Some(self.advances) {
            return Err(EngineError::Scripted(format!(
                "advance to step {} failed",
                self.advances
            )));
        }
        self.advances += 1;

        let step = self.current_step();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_programs)
            .into_iter()
            .partition(|(at, _, _)| *at <= step);
        self.pending_programs = later;
        for (_, id, program) in due {
            if let Some(sig) = self.signals.get_mut(&id) {
                sig.program = program;
                sig.active_index = 0;
                self.changed.push(id);
            }
        }
        Ok(())
    }

    fn remaining_activity(&mut self) -> Result<bool, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        Ok(self.advances < self.horizon)
    }

    fn signal_ids(&mut self) -> Result<Vec<SignalId>, EngineError> {
        Ok(self.signals.keys().cloned().collect())
    }

    fn controlled_lanes(&mut self, signal: &str) -> Result<Vec<LaneId>, EngineError> {
        Ok(self.signal(signal)?.lanes.clone())
    }

    fn halted_count(&mut self, lane: &str) -> Result<u64, EngineError> {
        self.check_lane(lane)?;
        let step = self.current_step();
        Ok(self.queues.get(lane).map(|f| f(step)).unwrap_or(0))
    }

    fn vehicle_ids_on_lane(&mut self, lane: &str) -> Result<Vec<VehicleId>, EngineError> {
        self.check_lane(lane)?;
        let step = self.current_step();
        Ok(self.vehicles.get(lane).map(|f| f(step)).unwrap_or_default())
    }

    fn phase_program(&mut self, signal: &str) -> Result<PhaseProgram, EngineError> {
        if self.missing_programs.contains(signal) {
            return Err(EngineError::CommandFailed {
                command: 0,
                description: format!("no program logic for '{signal}'"),
            });
        }
        Ok(self.signal(signal)?.program.clone())
    }

    fn active_phase_index(&mut self, signal: &str) -> Result<usize, EngineError> {
        if self.unreadable_phases.contains(signal) {
            return Err(EngineError::Scripted(format!("phase of '{signal}' unavailable")));
        }
        Ok(self.signal(signal)?.active_index)
    }

    fn set_active_phase_index(&mut self, signal: &str, index: usize) -> Result<(), EngineError> {
        if self.rejecting_signals.contains(signal) {
            return Err(EngineError::CommandFailed {
                command: 0,
                description: format!("phase command for '{signal}' rejected"),
            });
        }
        let step = self.current_step();
        let sig = self.signal_mut(signal)?;
        let count = sig.program.len();
        if index >= count {
            return Err(EngineError::PhaseOutOfRange {
                signal: signal.to_string(),
                index,
                count,
            });
        }
        sig.active_index = index;
        self.switches.push(SwitchEvent {
            step,
            signal: signal.to_string(),
            index,
        });
        Ok(())
    }

    fn disable_signal(&mut self, signal: &str) -> Result<(), EngineError> {
        self.signal_mut(signal)?.disabled = true;
        Ok(())
    }

    fn take_program_changes(&mut self) -> Vec<SignalId> {
        std::mem::take(&mut self.changed)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
