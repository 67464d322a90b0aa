// src/controller/adaptive.rs
//
// Queue-responsive controller.
//
// A non-transitional phase ends early once the signal's queue reaches the
// threshold and the phase has run strictly longer than min_dwell, and is
// forced to end once it has run strictly longer than max_dwell. Transitional
// (caution) phases always run for a fixed short dwell.
//
// Demand is read for every signal, including those whose camera is not
// trusted for statistics. A signal whose read failed this step is left
// alone until the next step.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::{fetch_program, rebase_state, ControllerState, SetupOutcome, SignalController, StepObservations};
use crate::config::{AdaptiveConfig, ControlMode};
use crate::engine::SimulationEngine;
use crate::types::{PhaseCommand, PhaseKind, PhaseProgram, SignalId, Step, SwitchReason};

pub struct AdaptiveController {
    cfg: AdaptiveConfig,
    states: BTreeMap<SignalId, ControllerState>,
}

impl AdaptiveController {
    pub fn new(cfg: AdaptiveConfig) -> Self {
        Self {
            cfg,
            states: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.cfg
    }

    fn committed_duration(&self, kind: PhaseKind) -> u64 {
        if kind.is_transitional() {
            self.cfg.transitional_dwell
        } else {
            self.cfg.min_dwell
        }
    }

    fn reason_for(&self, state: &ControllerState, step: Step, halted: u64) -> Option<SwitchReason> {
        let dwell = state.dwell(step);
        if state.program.kind_at(state.current_phase_index).is_transitional() {
            return (dwell >= self.cfg.transitional_dwell).then_some(SwitchReason::Transitional);
        }
        if halted >= self.cfg.threshold && dwell > self.cfg.min_dwell {
            Some(SwitchReason::Demand)
        } else if dwell > self.cfg.max_dwell {
            Some(SwitchReason::MaxDwell)
        } else {
            None
        }
    }
}

impl SignalController for AdaptiveController {
    fn mode(&self) -> ControlMode {
        ControlMode::Adaptive
    }

    fn setup(&mut self, engine: &mut dyn SimulationEngine, signals: &[SignalId]) -> SetupOutcome {
        let mut outcome = SetupOutcome::default();

        for signal in signals {
            if self.states.contains_key(signal) {
                continue;
            }
            let Some(program) = fetch_program(engine, signal) else {
                outcome.skipped.push(signal.clone());
                continue;
            };

            let start = match engine.active_phase_index(signal) {
                Ok(i) if i < program.len() => i,
                Ok(i) => {
                    warn!(signal = %signal, index = i, phases = program.len(), "active phase out of range; starting at 0");
                    outcome.commands.push(PhaseCommand {
                        signal: signal.clone(),
                        from_index: 0,
                        to_index: 0,
                        reason: SwitchReason::Initial,
                    });
                    0
                }
                Err(e) => {
                    warn!(signal = %signal, error = %e, "active phase unavailable; signal excluded from control");
                    outcome.skipped.push(signal.clone());
                    continue;
                }
            };

            let duration = self.committed_duration(program.kind_at(start));
            debug!(signal = %signal, start, "adaptive signal initialised");
            self.states
                .insert(signal.clone(), ControllerState::new(program, start, 0, duration));
        }

        info!(
            managed = self.states.len(),
            skipped = outcome.skipped.len(),
            threshold = self.cfg.threshold,
            min_dwell = self.cfg.min_dwell,
            max_dwell = self.cfg.max_dwell,
            "adaptive controller ready"
        );
        outcome
    }

    fn decide(&self, step: Step, observations: &StepObservations) -> Vec<PhaseCommand> {
        let mut commands = Vec::new();
        for (id, state) in &self.states {
            if observations.is_failed(id) {
                continue;
            }
            let halted = observations.halted(id).unwrap_or(0);
            if let Some(reason) = self.reason_for(state, step, halted) {
                commands.push(PhaseCommand {
                    signal: id.clone(),
                    from_index: state.current_phase_index,
                    to_index: state.next_index(),
                    reason,
                });
            }
        }
        commands
    }

    fn acknowledge(&mut self, command: &PhaseCommand, step: Step) {
        if command.reason == SwitchReason::Initial {
            return;
        }
        let Some(kind) = self
            .states
            .get(&command.signal)
            .map(|st| st.program.kind_at(command.to_index))
        else {
            return;
        };
        let duration = self.committed_duration(kind);
        let Some(state) = self.states.get_mut(&command.signal) else {
            return;
        };
        if state.current_phase_index != command.from_index {
            debug!(signal = %command.signal, "stale phase command ignored");
            return;
        }
        state.current_phase_index = command.to_index;
        state.last_switch_step = step as i64;
        state.current_phase_duration = duration;
    }

    fn release(&mut self, signal: &str) {
        self.states.remove(signal);
    }

    fn refresh_program(&mut self, signal: &str, program: PhaseProgram, active_index: usize, step: Step) {
        let index = if active_index < program.len() { active_index } else { 0 };
        let duration = self.committed_duration(program.kind_at(index));
        if let Some(state) = self.states.get_mut(signal) {
            rebase_state(state, program, index, step, duration);
        }
    }

    fn state(&self, signal: &str) -> Option<&ControllerState> {
        self.states.get(signal)
    }

    fn managed(&self) -> Vec<SignalId> {
        self.states.keys().cloned().collect()
    }
}
