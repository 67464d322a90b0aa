use std::fs;

use signalflow::config::{AdaptiveConfig, ControlMode, FixedCycleConfig, PathsConfig, Scenario};
use signalflow::controller::{AdaptiveController, FixedCycleController, SignalController};
use signalflow::engine::scripted::SwitchEvent;
use signalflow::engine::ScriptedEngine;
use signalflow::overlay::StatusRow;
use signalflow::registry::{DeviceRecord, DeviceRegistry};
use signalflow::report::{ReportEmitter, RunSummary, Ticket};
use signalflow::runner::{CancelToken, RunError, SimulationLoop, Termination};
use signalflow::telemetry::{TelemetryConfig, TelemetrySink};
use signalflow::types::{Phase, PhaseKind};

fn two_phase() -> Vec<Phase> {
    vec![Phase::new("G", 100.0), Phase::new("y", 4.0)]
}

fn four_phase() -> Vec<Phase> {
    vec![
        Phase::new("GGrr", 30.0),
        Phase::new("yyrr", 4.0),
        Phase::new("rrGG", 30.0),
        Phase::new("rryy", 4.0),
    ]
}

fn adaptive(threshold: u64, min_dwell: u64, max_dwell: u64) -> Box<dyn SignalController> {
    Box::new(AdaptiveController::new(AdaptiveConfig {
        threshold,
        min_dwell,
        max_dwell,
        transitional_dwell: 4,
    }))
}

fn switches_for<'a>(events: &'a [SwitchEvent], signal: &str) -> Vec<&'a SwitchEvent> {
    events.iter().filter(|e| e.signal == signal).collect()
}

fn manifest_record(signal: &str, status: &str, camera_status: Option<&str>) -> serde_json::Value {
    let mut rec = serde_json::json!({
        "sumo_id": signal,
        "id": format!("AA:{signal}"),
        "type": "traffic_control_unit",
        "status": status,
        "geo": {"lat": 0.0, "lon": 0.0},
    });
    if let Some(cs) = camera_status {
        rec["camera"] = serde_json::json!({"id": format!("CC:{signal}"), "status": cs});
    }
    rec
}

fn registry_from(records: Vec<serde_json::Value>) -> DeviceRegistry {
    let parsed: Vec<DeviceRecord> = serde_json::from_value(serde_json::Value::Array(records)).unwrap();
    DeviceRegistry::from_records(parsed)
}

#[test]
fn adaptive_switches_exactly_after_min_dwell_then_after_caution() {
    let engine = ScriptedEngine::new(70)
        .with_signal("J1", two_phase(), ["in_0"])
        .with_queue("in_0", |s| if s < 60 { 0 } else { 6 });

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), DeviceRegistry::empty());
    let out = sim.run();

    assert_eq!(out.termination, Termination::Completed);
    assert_eq!(
        sim.engine().switches(),
        &[
            SwitchEvent { step: 61, signal: "J1".into(), index: 1 },
            SwitchEvent { step: 65, signal: "J1".into(), index: 0 },
        ]
    );
    assert_eq!(out.switches, 2);
}

#[test]
fn adaptive_dwell_stays_within_bounds() {
    let (min_dwell, max_dwell) = (60, 300);
    let mut engine = ScriptedEngine::new(4_000);
    for (i, sig) in ["A", "B", "C"].iter().enumerate() {
        let lane = format!("{sig}_0");
        let period = 37 + 11 * i as u64;
        engine = engine
            .with_signal(sig, four_phase(), [lane.clone()])
            .with_queue(&lane, move |s| (s / period) % 9);
    }

    let mut sim = SimulationLoop::new(engine, adaptive(5, min_dwell, max_dwell), DeviceRegistry::empty());
    sim.run();

    let phases = four_phase();
    for sig in ["A", "B", "C"] {
        let events = switches_for(sim.engine().switches(), sig);
        assert!(events.len() > 10, "{sig} barely switched");

        let mut prev_step = 0u64;
        let mut prev_index = 0usize;
        for ev in events {
            let dwell = ev.step - prev_step;
            if phases[prev_index].kind() == PhaseKind::Caution {
                assert_eq!(dwell, 4, "{sig} caution dwell at step {}", ev.step);
            } else {
                assert!(dwell > min_dwell, "{sig} switched after {dwell} at step {}", ev.step);
                assert!(dwell <= max_dwell + 1, "{sig} held for {dwell} at step {}", ev.step);
            }
            assert_eq!(ev.index, (prev_index + 1) % phases.len());
            prev_step = ev.step;
            prev_index = ev.index;
        }
    }
}

#[test]
fn fixed_cycle_keeps_indices_valid_and_is_reproducible() {
    let run = |seed| {
        let engine = ScriptedEngine::new(3_000)
            .with_signal("A", four_phase(), ["a"])
            .with_signal("B", two_phase(), ["b"]);
        let ctrl = FixedCycleController::new(FixedCycleConfig::default(), seed);
        let mut sim = SimulationLoop::new(engine, Box::new(ctrl), DeviceRegistry::empty());
        sim.run();
        for sig in ["A", "B"] {
            let st = sim.controller().state(sig).unwrap();
            assert!(st.current_phase_index < st.program.len());
            assert!(st.current_phase_duration >= 60);
        }
        sim.engine().switches().to_vec()
    };

    let first = run(99);
    for ev in &first {
        let count = if ev.signal == "A" { 4 } else { 2 };
        assert!(ev.index < count);
    }
    assert!(first.iter().filter(|e| e.step > 0).count() > 10);
    assert_eq!(first, run(99));
    assert_ne!(first, run(100));
}

#[test]
fn fixed_cycle_desynchronises_signals() {
    let mut engine = ScriptedEngine::new(2_000);
    let ids: Vec<String> = (0..8).map(|i| format!("J{i}")).collect();
    for id in &ids {
        engine = engine.with_signal(id, four_phase(), [format!("{id}_0")]);
    }
    let ctrl = FixedCycleController::new(FixedCycleConfig::default(), 7);
    let mut sim = SimulationLoop::new(engine, Box::new(ctrl), DeviceRegistry::empty());
    sim.run();

    let first_steps: Vec<u64> = ids
        .iter()
        .filter_map(|id| {
            sim.engine()
                .switches()
                .iter()
                .find(|e| &e.signal == id && e.step > 0)
                .map(|e| e.step)
        })
        .collect();
    assert_eq!(first_steps.len(), ids.len());
    let distinct: std::collections::BTreeSet<_> = first_steps.iter().collect();
    assert!(distinct.len() > 1, "all signals switched in lock-step: {first_steps:?}");
}

#[test]
fn failing_lane_is_isolated_to_its_signal() {
    let engine = ScriptedEngine::new(200)
        .with_signal("J1", two_phase(), ["ok_0"])
        .with_signal("J2", two_phase(), ["bad_0"])
        .with_queue("ok_0", |_| 9)
        .failing_lane("bad_0");

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), DeviceRegistry::empty());
    let out = sim.run();

    assert_eq!(out.termination, Termination::Completed);
    assert!(out.is_success());
    assert_eq!(out.signal_errors, 200);
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].signal_id, "J1");
    assert!(!switches_for(sim.engine().switches(), "J1").is_empty());
}

#[test]
fn signal_with_failed_read_is_never_advanced() {
    let engine = ScriptedEngine::new(200)
        .with_signal("J1", two_phase(), ["ok_0"])
        .with_signal("J2", two_phase(), ["bad_0"])
        .failing_lane("bad_0");

    // Max dwell well inside the horizon: J1 is forced off G, J2 must not be.
    let mut sim = SimulationLoop::new(engine, adaptive(5, 10, 50), DeviceRegistry::empty());
    let out = sim.run();

    assert_eq!(out.signal_errors, 200);
    let j1: Vec<u64> = switches_for(sim.engine().switches(), "J1")
        .iter()
        .map(|e| e.step)
        .collect();
    assert_eq!(&j1[..2], &[51, 55]);
    assert!(switches_for(sim.engine().switches(), "J2").is_empty());
    let st = sim.controller().state("J2").unwrap();
    assert_eq!(st.current_phase_index, 0);
    assert_eq!(st.last_switch_step, 0);
}

#[test]
fn rejected_commands_leave_state_untouched() {
    let engine = ScriptedEngine::new(100)
        .with_signal("J1", two_phase(), ["a"])
        .with_signal("J2", two_phase(), ["b"])
        .with_queue("a", |_| 9)
        .with_queue("b", |_| 9)
        .rejecting_signal("J2");

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), DeviceRegistry::empty());
    let out = sim.run();

    assert_eq!(out.termination, Termination::Completed);
    assert!(out.is_success());
    assert_eq!(out.steps, 100);

    let j1: Vec<(u64, usize)> = switches_for(sim.engine().switches(), "J1")
        .iter()
        .map(|e| (e.step, e.index))
        .collect();
    assert_eq!(j1, vec![(61, 1), (65, 0)]);

    // J2 asks again every step from 61 on; each ask is rejected once.
    assert!(switches_for(sim.engine().switches(), "J2").is_empty());
    assert_eq!(out.signal_errors, 39);
    assert_eq!(out.switches, 2);
    let st = sim.controller().state("J2").unwrap();
    assert_eq!(st.current_phase_index, 0);
    assert_eq!(st.last_switch_step, 0);
    assert_eq!(sim.stats().sample_count("J2"), 100);
}

#[test]
fn signal_without_program_is_observed_but_never_switched() {
    let engine = ScriptedEngine::new(1_000)
        .with_signal("J1", two_phase(), ["a"])
        .with_signal("J2", two_phase(), ["b"])
        .with_queue("a", |_| 3)
        .with_queue("b", |_| 4)
        .without_program("J2");

    let ctrl = FixedCycleController::new(FixedCycleConfig::default(), 1);
    let mut sim = SimulationLoop::new(engine, Box::new(ctrl), DeviceRegistry::empty());
    let out = sim.run();

    assert!(sim.controller().state("J2").is_none());
    assert!(switches_for(sim.engine().switches(), "J2").is_empty());
    assert!(!switches_for(sim.engine().switches(), "J1").is_empty());
    assert!(out.uncontrolled.contains(&"J2".to_string()));
    assert_eq!(sim.stats().sample_count("J2"), 1_000);
}

#[test]
fn gated_sensor_skips_statistics_but_not_control() {
    let registry = registry_from(vec![
        manifest_record("J1", "active", Some("maintenance")),
        manifest_record("J2", "active", Some("active")),
    ]);
    let engine = ScriptedEngine::new(100)
        .with_signal("J1", two_phase(), ["a"])
        .with_signal("J2", two_phase(), ["b"])
        .with_queue("a", |_| 50)
        .with_queue("b", |_| 1);

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), registry);
    let out = sim.run();

    assert_eq!(sim.stats().sample_count("J1"), 0);
    assert_eq!(sim.stats().sample_count("J2"), 100);
    assert!(out.records.iter().all(|r| r.signal_id != "J1"));
    // The camera only gates statistics; control still sees the long queue.
    let j1: Vec<(u64, usize)> = switches_for(sim.engine().switches(), "J1")
        .iter()
        .map(|e| (e.step, e.index))
        .collect();
    assert_eq!(j1, vec![(61, 1), (65, 0)]);
    assert!(switches_for(sim.engine().switches(), "J2").is_empty());
}

#[test]
fn overlay_can_take_a_signal_out_of_service() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("api_devices_manifest.json");
    fs::write(
        &manifest,
        serde_json::to_string(&vec![
            manifest_record("J1", "active", Some("active")),
            manifest_record("J2", "active", Some("active")),
        ])
        .unwrap(),
    )
    .unwrap();

    let mut registry = DeviceRegistry::load_manifest(&manifest).unwrap();
    registry.apply_overlay(&[StatusRow::new("AA:J2", "maintenance", "SEMAFARO")]);

    let engine = ScriptedEngine::new(500)
        .with_signal("J1", four_phase(), ["a"])
        .with_signal("J2", four_phase(), ["b"]);
    let ctrl = FixedCycleController::new(FixedCycleConfig::default(), 3);
    let mut sim = SimulationLoop::new(engine, Box::new(ctrl), registry);
    let out = sim.run();

    assert!(sim.engine().is_disabled("J2"));
    assert!(!sim.engine().is_disabled("J1"));
    assert!(switches_for(sim.engine().switches(), "J2").is_empty());
    assert!(out.uncontrolled.contains(&"J2".to_string()));
    assert!(out.records.iter().all(|r| r.signal_id != "J2"));
}

#[test]
fn cancellation_stops_between_steps() {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let engine = ScriptedEngine::new(1_000_000)
        .with_signal("J1", two_phase(), ["a"])
        .with_queue("a", move |s| {
            if s == 50 {
                trigger.cancel();
            }
            1
        });

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), DeviceRegistry::empty())
        .with_cancel(cancel);
    let out = sim.run();

    assert_eq!(out.termination, Termination::Cancelled);
    assert_eq!(out.steps, 51);
    assert!(out.is_success());
    assert_eq!(out.records[0].max_queue, 1);
    assert!(sim.engine().is_closed());
}

#[test]
fn fatal_advance_still_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        root: dir.path().to_path_buf(),
        ..PathsConfig::default()
    };
    let registry = registry_from(vec![manifest_record("J1", "active", Some("active"))]);
    let emitter = ReportEmitter::new(&paths, Scenario::Api, ControlMode::Adaptive, 5, registry.clone())
        .with_timestamp("2024-01-02 03:04:05");

    let engine = ScriptedEngine::new(1_000)
        .with_signal("J1", two_phase(), ["a"])
        .with_queue("a", |s| s % 4)
        .with_vehicles("a", |s| vec![format!("veh{}", s % 10)])
        .fail_advance_at(30);

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), registry)
        .with_report_sink(Box::new(emitter));
    let out = sim.run();

    assert_eq!(out.termination, Termination::Failed);
    assert!(matches!(out.error, Some(RunError::StepFailed { step: 30, .. })));
    assert!(sim.engine().is_closed());

    let tickets: Vec<Ticket> =
        serde_json::from_str(&fs::read_to_string(paths.tickets(Scenario::Api)).unwrap()).unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].sumo_id, "J1");
    assert_eq!(tickets[0].tls_mac, "AA:J1");
    assert_eq!(tickets[0].camera_mac, "CC:J1");
    assert_eq!(tickets[0].metrics.flow_count, 10);
    assert_eq!(tickets[0].metrics.max_queue, 3);
    assert_eq!(tickets[0].mode, "ADAPTIVE");

    let summary: RunSummary = serde_json::from_str(
        &fs::read_to_string(paths.output().join("run_summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary.termination, "failed");
    assert_eq!(summary.steps, 30);
    assert!(summary.error.unwrap().contains("step 30"));
}

#[test]
fn telemetry_writes_one_record_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("telemetry").join("steps.jsonl");
    let engine = ScriptedEngine::new(40)
        .with_signal("J1", two_phase(), ["a"])
        .with_queue("a", |_| 2);

    let mut sim = SimulationLoop::new(engine, adaptive(5, 60, 600), DeviceRegistry::empty())
        .with_telemetry(TelemetrySink::from_config(TelemetryConfig::jsonl(&path)));
    sim.run();

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 40);
    assert_eq!(lines[0]["step"], 0);
    assert_eq!(lines[39]["queues"]["J1"], 2);
    assert_eq!(lines[39]["observed"], 1);
}
