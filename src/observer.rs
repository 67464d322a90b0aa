// src/observer.rs
//
// QueueObserver: per-step congestion reads for one signal.
//
// Halted counts are summed over the signal's unique controlled lanes (a lane
// listed once per link it feeds is read once). Signals whose sensor is not
// trusted produce no sample for statistics; their demand is still readable
// for control.

use std::collections::{BTreeSet, HashMap};

use crate::engine::{EngineError, SimulationEngine};
use crate::registry::DeviceRegistry;
use crate::types::{LaneId, QueueSample, SignalId};

#[derive(Debug, Default)]
pub struct QueueObserver {
    lanes: HashMap<SignalId, Vec<LaneId>>,
}

impl QueueObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique controlled lanes of `signal`, in first-seen order. Cached after
    /// the first successful read.
    pub fn lanes(
        &mut self,
        engine: &mut dyn SimulationEngine,
        signal: &str,
    ) -> Result<&[LaneId], EngineError> {
        if !self.lanes.contains_key(signal) {
            let mut seen = BTreeSet::new();
            let unique: Vec<LaneId> = engine
                .controlled_lanes(signal)?
                .into_iter()
                .filter(|l| seen.insert(l.clone()))
                .collect();
            self.lanes.insert(signal.to_string(), unique);
        }
        Ok(self.lanes.get(signal).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Drop the cached lanes of `signal` (its program changed).
    pub fn invalidate(&mut self, signal: &str) {
        self.lanes.remove(signal);
    }

    /// Sample `signal` for the current step. `Ok(None)` when its sensor is
    /// not trusted.
    pub fn sample(
        &mut self,
        engine: &mut dyn SimulationEngine,
        registry: &DeviceRegistry,
        signal: &str,
    ) -> Result<Option<QueueSample>, EngineError> {
        if !registry.sensor_trusted(signal) {
            return Ok(None);
        }

        let lanes = self.lanes(engine, signal)?.to_vec();
        let mut sample = QueueSample::default();
        for lane in &lanes {
            sample.halted_count += engine.halted_count(lane)?;
            sample.vehicle_ids.extend(engine.vehicle_ids_on_lane(lane)?);
        }
        Ok(Some(sample))
    }

    /// Halted-vehicle sum of `signal` for control, regardless of whether its
    /// sensor is trusted for statistics.
    pub fn demand(
        &mut self,
        engine: &mut dyn SimulationEngine,
        signal: &str,
    ) -> Result<u64, EngineError> {
        let lanes = self.lanes(engine, signal)?.to_vec();
        let mut halted = 0;
        for lane in &lanes {
            halted += engine.halted_count(lane)?;
        }
        Ok(halted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::registry::{CameraRecord, DeviceRecord};
    use crate::types::{DeviceStatus, Phase};

    fn engine() -> ScriptedEngine {
        ScriptedEngine::new(10)
            .with_signal("J1", vec![Phase::new("Gr", 1.0)], ["a_0", "b_0", "a_0", "b_0"])
            .with_queue("a_0", |_| 2)
            .with_queue("b_0", |_| 3)
            .with_vehicles("a_0", |_| vec!["v1".into(), "v2".into()])
            .with_vehicles("b_0", |_| vec!["v2".into(), "v3".into()])
    }

    fn device(signal: &str, camera: Option<DeviceStatus>) -> DeviceRecord {
        DeviceRecord {
            id: format!("mac-{signal}"),
            sumo_id: Some(signal.to_string()),
            kind: "traffic_control_unit".into(),
            status: DeviceStatus::Active,
            geo: None,
            camera: camera.map(|status| CameraRecord {
                id: format!("cam-{signal}"),
                status,
                source: None,
            }),
            source: None,
        }
    }

    #[test]
    fn duplicate_lanes_counted_once() {
        let mut eng = engine();
        eng.advance_step().unwrap();
        let mut obs = QueueObserver::new();
        let sample = obs
            .sample(&mut eng, &DeviceRegistry::empty(), "J1")
            .unwrap()
            .unwrap();
        assert_eq!(sample.halted_count, 5);
        assert_eq!(sample.vehicle_ids.len(), 3);
        assert_eq!(obs.lanes(&mut eng, "J1").unwrap().len(), 2);
    }

    #[test]
    fn untrusted_sensor_yields_no_sample() {
        let mut eng = engine();
        eng.advance_step().unwrap();
        let reg = DeviceRegistry::from_records([device("J1", Some(DeviceStatus::Maintenance))]);
        let mut obs = QueueObserver::new();
        assert_eq!(obs.sample(&mut eng, &reg, "J1").unwrap(), None);

        let reg = DeviceRegistry::from_records([device("J1", Some(DeviceStatus::Active))]);
        assert!(obs.sample(&mut eng, &reg, "J1").unwrap().is_some());
    }

    #[test]
    fn demand_ignores_sensor_trust() {
        let mut eng = engine();
        eng.advance_step().unwrap();
        let mut obs = QueueObserver::new();
        assert_eq!(obs.demand(&mut eng, "J1").unwrap(), 5);

        let mut eng = engine().failing_lane("a_0");
        eng.advance_step().unwrap();
        assert!(obs.demand(&mut eng, "J1").is_err());
    }

    #[test]
    fn lane_failure_surfaces_as_error() {
        let mut eng = engine().failing_lane("b_0");
        eng.advance_step().unwrap();
        let mut obs = QueueObserver::new();
        assert!(obs.sample(&mut eng, &DeviceRegistry::empty(), "J1").is_err());
    }
}
