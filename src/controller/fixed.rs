// src/controller/fixed.rs
//
// Fixed-cycle controller with randomized per-phase durations.
//
// Each signal cycles through its program in order. A phase's duration is
// drawn once, when the phase becomes active, from the band configured for its
// kind and clamped to the floor. Signals get an independent random head start
// at setup so they do not switch in lock-step.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use super::{fetch_program, rebase_state, ControllerState, SetupOutcome, SignalController, StepObservations};
use crate::config::{ControlMode, FixedCycleConfig};
use crate::engine::SimulationEngine;
use crate::types::{PhaseCommand, PhaseKind, PhaseProgram, SignalId, Step, SwitchReason};

/// Inputs to a duration draw besides the phase kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationContext {
    /// Last red dwell of the signal, when known.
    pub last_red: Option<u64>,
}

/// Draw a phase duration.
///
/// Uniform over the kind's band, plus the red memory for go phases when
/// `red_coupling` is on, never below `cfg.floor`. Kinds without a band get
/// the floor.
pub fn sample_duration<R: Rng + ?Sized>(
    kind: PhaseKind,
    ctx: &DurationContext,
    cfg: &FixedCycleConfig,
    rng: &mut R,
) -> u64 {
    let sampled = match cfg.band(kind) {
        Some(band) => rng.gen_range(band.low()..=band.high()),
        None => cfg.floor,
    };
    let duration = if kind == PhaseKind::Go && cfg.red_coupling {
        sampled.saturating_add(ctx.last_red.unwrap_or(cfg.initial_red_memory))
    } else {
        sampled
    };
    duration.max(cfg.floor)
}

pub struct FixedCycleController {
    cfg: FixedCycleConfig,
    rng: ChaCha8Rng,
    states: BTreeMap<SignalId, ControllerState>,
}

impl FixedCycleController {
    pub fn new(cfg: FixedCycleConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: ChaCha8Rng::seed_from_u64(seed),
            states: BTreeMap::new(),
        }
    }

    fn context(&self, state: &ControllerState) -> DurationContext {
        DurationContext {
            last_red: state.last_red_duration,
        }
    }
}

impl SignalController for FixedCycleController {
    fn mode(&self) -> ControlMode {
        ControlMode::Static
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

            // Start on a red phase when the program has one.
            let start = program.first_of(PhaseKind::Stop).unwrap_or(0);
            let red_memory = self.cfg.red_coupling.then_some(self.cfg.initial_red_memory);
            let ctx = DurationContext { last_red: red_memory };
            let duration = sample_duration(program.kind_at(start), &ctx, &self.cfg, &mut self.rng);

            // Head start: pretend the phase has already run for `offset` steps.
            // What is left of the phase after the head start stays >= floor.
            let offset = self
                .rng
                .gen_range(0..=self.cfg.start_offset_max)
                .min(duration.saturating_sub(self.cfg.floor));

            let mut state = ControllerState::new(program, start, -(offset as i64), duration);
            state.last_red_duration = red_memory;
            debug!(signal = %signal, start, duration, offset, "fixed-cycle signal initialised");

            self.states.insert(signal.clone(), state);
            outcome.commands.push(PhaseCommand {
                signal: signal.clone(),
                from_index: start,
                to_index: start,
                reason: SwitchReason::Initial,
            });
        }

        info!(
            managed = self.states.len(),
            skipped = outcome.skipped.len(),
            red_coupling = self.cfg.red_coupling,
            "fixed-cycle controller ready"
        );
        outcome
    }

    fn decide(&self, step: Step, observations: &StepObservations) -> Vec<PhaseCommand> {
        self.states
            .iter()
            .filter(|(id, _)| !observations.is_failed(id))
            .filter(|(_, st)| st.dwell(step) >= st.current_phase_duration)
            .map(|(id, st)| PhaseCommand {
                signal: id.clone(),
                from_index: st.current_phase_index,
                to_index: st.next_index(),
                reason: SwitchReason::Schedule,
            })
            .collect()
    }

    fn acknowledge(&mut self, command: &PhaseCommand, step: Step) {
        if command.reason == SwitchReason::Initial {
            return;
        }
        let Some(state) = self.states.get_mut(&command.signal) else {
            return;
        };
        if state.current_phase_index != command.from_index {
            debug!(signal = %command.signal, "stale phase command ignored");
            return;
        }

        if self.cfg.red_coupling && state.program.kind_at(state.current_phase_index) == PhaseKind::Stop {
            let dwell = state.dwell(step);
            // Only a red that ran past the floor counts as a real red.
            if dwell > self.cfg.floor {
                state.last_red_duration = Some(dwell);
            }
        }

        let ctx = DurationContext {
            last_red: state.last_red_duration,
        };
        let kind = state.program.kind_at(command.to_index);
        state.current_phase_duration = sample_duration(kind, &ctx, &self.cfg, &mut self.rng);
        state.current_phase_index = command.to_index;
        state.last_switch_step = step as i64;
    }

    fn release(&mut self, signal: &str) {
        self.states.remove(signal);
    }

    fn refresh_program(&mut self, signal: &str, program: PhaseProgram, active_index: usize, step: Step) {
        let Some(state) = self.states.get(signal) else {
            return;
        };
        let ctx = self.context(state);
        let index = if active_index < program.len() { active_index } else { 0 };
        let duration = sample_duration(program.kind_at(index), &ctx, &self.cfg, &mut self.rng);
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
