// src/runner.rs
//
// SimulationLoop: the single driver of the external clock.
//
// Per step, in order:
//   1) advance the engine one step
//   2) pick up program changes reported by the engine
//   3) sample every active signal into the aggregator (trusted sensors) and
//      into the step's demand readings (all signals)
//   4) ask the controller for phase commands and issue them; a signal whose
//      read failed this step gets none
//   5) write one telemetry record
//
// Per-signal failures are logged and counted; the step goes on. A failed
// advance (or activity query) ends the run, but finalisation and report
// emission always happen. Cancellation is checked between steps only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::controller::{SignalController, StepObservations};
use crate::engine::{EngineError, SimulationEngine};
use crate::observer::QueueObserver;
use crate::registry::DeviceRegistry;
use crate::report::ReportSink;
use crate::stats::{ReportRecord, StatsAggregator};
use crate::telemetry::{StepRecord, TelemetrySink};
use crate::types::{PhaseCommand, SignalId, Step};

/// Shared flag checked by the loop between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The engine reported no remaining activity.
    Completed,
    /// External cancellation (timeout or interrupt).
    Cancelled,
    /// The configured step cap was reached.
    HorizonReached,
    /// A loop-fatal error.
    Failed,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::Cancelled => "cancelled",
            Termination::HorizonReached => "horizon_reached",
            Termination::Failed => "failed",
        }
    }
}

/// Loop-fatal errors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not connect to the simulation engine: {0}")]
    Connect(#[source] EngineError),
    #[error("signal discovery failed: {0}")]
    Discovery(#[source] EngineError),
    #[error("activity query failed before step {step}: {source}")]
    ActivityQuery {
        step: Step,
        #[source]
        source: EngineError,
    },
    #[error("advancing to step {step} failed: {source}")]
    StepFailed {
        step: Step,
        #[source]
        source: EngineError,
    },
}

/// Result of a run. Always produced, even when the run failed.
#[derive(Debug)]
pub struct RunOutcome {
    /// Steps fully advanced.
    pub steps: u64,
    pub termination: Termination,
    pub records: Vec<ReportRecord>,
    pub error: Option<RunError>,
    /// Phase commands accepted by the engine (setup alignment excluded).
    pub switches: u64,
    /// Per-signal engine errors absorbed during the run.
    pub signal_errors: u64,
    /// Signals left out of control (program unavailable or disabled).
    pub uncontrolled: Vec<SignalId>,
}

impl RunOutcome {
    /// Outcome for a run that never reached the engine.
    pub fn failed_before_start(error: RunError) -> Self {
        RunOutcome {
            steps: 0,
            termination: Termination::Failed,
            records: Vec::new(),
            error: Some(error),
            switches: 0,
            signal_errors: 0,
            uncontrolled: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct SimulationLoop<E: SimulationEngine> {
    engine: E,
    controller: Box<dyn SignalController>,
    registry: DeviceRegistry,
    observer: QueueObserver,
    stats: StatsAggregator,
    telemetry: TelemetrySink,
    cancel: CancelToken,
    max_steps: Option<u64>,
    sink: Option<Box<dyn ReportSink>>,
    active: Vec<SignalId>,
    uncontrolled: Vec<SignalId>,
    switches: u64,
    signal_errors: u64,
}

impl<E: SimulationEngine> SimulationLoop<E> {
    pub fn new(engine: E, controller: Box<dyn SignalController>, registry: DeviceRegistry) -> Self {
        Self {
            engine,
            controller,
            registry,
            observer: QueueObserver::new(),
            stats: StatsAggregator::new(),
            telemetry: TelemetrySink::disabled(),
            cancel: CancelToken::new(),
            max_steps: None,
            sink: None,
            active: Vec::new(),
            uncontrolled: Vec::new(),
            switches: 0,
            signal_errors: 0,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_report_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn controller(&self) -> &dyn SignalController {
        self.controller.as_ref()
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Drive the engine until it runs out of activity, is cancelled, hits
    /// the step cap, or fails. Always finalises.
    pub fn run(&mut self) -> RunOutcome {
        info!(
            engine = self.engine.name(),
            mode = self.controller.mode().as_str(),
            max_steps = ?self.max_steps,
            "simulation loop starting"
        );

        let mut step: Step = 0;
        let (termination, err) = match self.setup() {
            Ok(()) => self.drive(&mut step),
            Err(e) => (Termination::Failed, Some(e)),
        };
        self.finalize(step, termination, err)
    }

    fn setup(&mut self) -> Result<(), RunError> {
        let signals = self.engine.signal_ids().map_err(RunError::Discovery)?;
        let partition = self.registry.partition(&signals);

        for signal in &partition.disabled {
            match self.engine.disable_signal(signal) {
                Ok(()) => info!(
                    signal = %signal,
                    status = %self.registry.status(signal),
                    "signal disabled"
                ),
                Err(e) => {
                    warn!(signal = %signal, error = %e, "failed to disable signal");
                    self.signal_errors += 1;
                }
            }
        }

        let outcome = self.controller.setup(&mut self.engine, &partition.active);
        for cmd in &outcome.commands {
            match self.engine.set_active_phase_index(&cmd.signal, cmd.to_index) {
                Ok(()) => self.controller.acknowledge(cmd, 0),
                Err(e) => {
                    warn!(signal = %cmd.signal, error = %e, "initial phase alignment failed; signal released");
                    self.controller.release(&cmd.signal);
                    self.uncontrolled.push(cmd.signal.clone());
                    self.signal_errors += 1;
                }
            }
        }

        self.uncontrolled.extend(outcome.skipped);
        self.uncontrolled.extend(partition.disabled);
        self.active = partition.active;

        info!(
            signals = signals.len(),
            observed = self.active.len(),
            controlled = self.controller.managed().len(),
            uncontrolled = self.uncontrolled.len(),
            "loop setup complete"
        );
        Ok(())
    }

    fn drive(&mut self, step: &mut Step) -> (Termination, Option<RunError>) {
        loop {
            if self.cancel.is_cancelled() {
                info!(step = *step, "cancellation requested");
                return (Termination::Cancelled, None);
            }
            if self.max_steps.is_some_and(|max| *step >= max) {
                info!(step = *step, "step cap reached");
                return (Termination::HorizonReached, None);
            }
            match self.engine.remaining_activity() {
                Ok(true) => {}
                Ok(false) => return (Termination::Completed, None),
                Err(source) => {
                    return (
                        Termination::Failed,
                        Some(RunError::ActivityQuery { step: *step, source }),
                    )
                }
            }
            if let Err(source) = self.engine.advance_step() {
                return (
                    Termination::Failed,
                    Some(RunError::StepFailed { step: *step, source }),
                );
            }

            self.step_once(*step);
            *step += 1;
        }
    }

    fn step_once(&mut self, step: Step) {
        self.refresh_changed_programs(step);

        let mut record = StepRecord::new(step);
        let mut observations = StepObservations::new();

        for signal in &self.active {
            match self.observer.sample(&mut self.engine, &self.registry, signal) {
                Ok(Some(sample)) => {
                    self.stats.record(signal, &sample);
                    record.queues.insert(signal.clone(), sample.halted_count);
                    observations.insert(signal.clone(), sample);
                    record.observed += 1;
                }
                // Sensor not trusted: no statistics, but control still sees demand.
                Ok(None) => {
                    record.skipped += 1;
                    match self.observer.demand(&mut self.engine, signal) {
                        Ok(halted) => observations.insert_demand(signal.clone(), halted),
                        Err(e) => {
                            warn!(signal = %signal, step, error = %e, "demand read failed; signal held this step");
                            observations.mark_failed(signal.clone());
                            record.signal_errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(signal = %signal, step, error = %e, "queue sample failed; signal held this step");
                    observations.mark_failed(signal.clone());
                    record.skipped += 1;
                    record.signal_errors += 1;
                }
            }
        }

        for cmd in self.controller.decide(step, &observations) {
            if self.issue(&cmd, step) {
                record.switches += 1;
            } else {
                record.signal_errors += 1;
            }
        }

        self.signal_errors += record.signal_errors as u64;
        self.telemetry.log_step(&record);
    }

    /// Send one command. The controller only hears about accepted ones.
    fn issue(&mut self, cmd: &PhaseCommand, step: Step) -> bool {
        match self.engine.set_active_phase_index(&cmd.signal, cmd.to_index) {
            Ok(()) => {
                debug!(
                    signal = %cmd.signal,
                    step,
                    from = cmd.from_index,
                    to = cmd.to_index,
                    reason = cmd.reason.as_str(),
                    "phase switch"
                );
                self.controller.acknowledge(cmd, step);
                self.switches += 1;
                true
            }
            Err(e) => {
                warn!(signal = %cmd.signal, step, error = %e, "phase command rejected");
                false
            }
        }
    }

    fn refresh_changed_programs(&mut self, step: Step) {
        for signal in self.engine.take_program_changes() {
            self.observer.invalidate(&signal);
            if self.controller.state(&signal).is_none() {
                continue;
            }
            let program = match self.engine.phase_program(&signal) {
                Ok(p) if !p.is_empty() => p,
                Ok(_) => {
                    warn!(signal = %signal, "engine reported an empty program; signal released");
                    self.controller.release(&signal);
                    self.uncontrolled.push(signal);
                    continue;
                }
                Err(e) => {
                    warn!(signal = %signal, error = %e, "program refresh failed; keeping cached program");
                    self.signal_errors += 1;
                    continue;
                }
            };
            let active = match self.engine.active_phase_index(&signal) {
                Ok(i) => i,
                Err(e) => {
                    warn!(signal = %signal, step, error = %e, "active phase unavailable after program change; restarting at 0");
                    self.signal_errors += 1;
                    0
                }
            };
            info!(signal = %signal, phases = program.len(), step, "phase program refreshed");
            self.controller.refresh_program(&signal, program, active, step);
        }
    }

    fn finalize(&mut self, steps: u64, termination: Termination, err: Option<RunError>) -> RunOutcome {
        self.telemetry.flush();
        if let Err(e) = self.engine.close() {
            warn!(error = %e, "engine close failed");
        }

        let outcome = RunOutcome {
            steps,
            termination,
            records: self.stats.finalize(),
            error: err,
            switches: self.switches,
            signal_errors: self.signal_errors,
            uncontrolled: self.uncontrolled.clone(),
        };

        match &outcome.error {
            Some(e) => error!(steps, error = %e, "simulation loop failed"),
            None => info!(
                steps,
                termination = termination.as_str(),
                records = outcome.records.len(),
                switches = outcome.switches,
                signal_errors = outcome.signal_errors,
                "simulation loop finished"
            ),
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.emit(&outcome) {
                error!(error = %e, "report emission failed");
            }
        }
        outcome
    }
}
