// src/stats.rs
//
// StatsAggregator: per-signal running statistics over the run.
//
// A signal's entry is created on its first recorded sample. Signals never
// sampled are absent from `finalize()`, which is how "never observed" stays
// distinguishable from "observed empty".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{QueueSample, SignalId, VehicleId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStat {
    pub vehicles: BTreeSet<VehicleId>,
    pub queue_sum: u64,
    pub samples: u64,
    pub max_queue: u64,
}

impl AggregateStat {
    pub fn average_queue(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.queue_sum as f64 / self.samples as f64)
    }
}

/// Finalized statistics for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub signal_id: SignalId,
    pub distinct_vehicle_flow: usize,
    pub max_queue: u64,
    pub average_queue: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    stats: BTreeMap<SignalId, AggregateStat>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, signal: &str, sample: &QueueSample) {
        let stat = self.stats.entry(signal.to_string()).or_default();
        stat.vehicles.extend(sample.vehicle_ids.iter().cloned());
        stat.queue_sum += sample.halted_count;
        stat.samples += 1;
        stat.max_queue = stat.max_queue.max(sample.halted_count);
    }

    pub fn get(&self, signal: &str) -> Option<&AggregateStat> {
        self.stats.get(signal)
    }

    pub fn sample_count(&self, signal: &str) -> u64 {
        self.stats.get(signal).map(|s| s.samples).unwrap_or(0)
    }

    /// One record per signal with at least one sample, ordered by signal id.
    pub fn finalize(&self) -> Vec<ReportRecord> {
        self.stats
            .iter()
            .filter_map(|(id, stat)| {
                stat.average_queue().map(|average_queue| ReportRecord {
                    signal_id: id.clone(),
                    distinct_vehicle_flow: stat.vehicles.len(),
                    max_queue: stat.max_queue,
                    average_queue,
                })
            })
            .collect()
    }
}
