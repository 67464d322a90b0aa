// src/registry.rs
//
// DeviceRegistry: signal id -> operational metadata.
//
// Built once from the device manifest, optionally overlaid with remote status
// before the loop, then read-only for the rest of the run.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::overlay::StatusRow;
use crate::types::{DeviceStatus, SignalId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Sensor (camera) attached to a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub source: Option<String>,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Controller MAC address.
    pub id: String,
    #[serde(default)]
    pub sumo_id: Option<SignalId>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub camera: Option<CameraRecord>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read manifest '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Counts of what an overlay changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlaySummary {
    pub signals_updated: usize,
    pub cameras_updated: usize,
    pub unmatched: usize,
}

/// Signals split by whether they may be controlled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub active: Vec<SignalId>,
    pub disabled: Vec<SignalId>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<SignalId, DeviceRecord>,
    by_mac: HashMap<String, SignalId>,
}

impl DeviceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Records without a signal id are ignored.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = DeviceRecord>,
    {
        let mut reg = Self::default();
        for rec in records {
            let Some(signal) = rec.sumo_id.clone() else {
                debug!(mac = %rec.id, "manifest record without signal id ignored");
                continue;
            };
            reg.by_mac.insert(rec.id.clone(), signal.clone());
            reg.devices.insert(signal, rec);
        }
        reg
    }

    /// Load a manifest file. A missing file yields an empty registry.
    pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "device manifest not found; all signals active, no sensor gating");
            return Ok(Self::empty());
        }
        let raw = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let records: Vec<DeviceRecord> =
            serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let reg = Self::from_records(records);
        info!(path = %path.display(), devices = reg.len(), "device manifest loaded");
        Ok(reg)
    }

    /// Apply remote status rows. Signal rows match by controller MAC; camera
    /// rows match by camera id.
    pub fn apply_overlay(&mut self, rows: &[StatusRow]) -> OverlaySummary {
        let mut summary = OverlaySummary::default();
        for row in rows {
            let status = DeviceStatus::parse(&row.status);
            if row.is_signal() {
                match self
                    .by_mac
                    .get(&row.mac_address)
                    .and_then(|sid| self.devices.get_mut(sid))
                {
                    Some(dev) => {
                        dev.status = status;
                        summary.signals_updated += 1;
                    }
                    None => summary.unmatched += 1,
                }
            } else if row.is_camera() {
                let mut matched = false;
                for cam in self.devices.values_mut().filter_map(|d| d.camera.as_mut()) {
                    if cam.id == row.mac_address {
                        cam.status = status;
                        matched = true;
                        summary.cameras_updated += 1;
                    }
                }
                if !matched {
                    summary.unmatched += 1;
                }
            } else {
                summary.unmatched += 1;
            }
        }
        info!(
            signals = summary.signals_updated,
            cameras = summary.cameras_updated,
            unmatched = summary.unmatched,
            "remote status overlay applied"
        );
        summary
    }

    pub fn get(&self, signal: &str) -> Option<&DeviceRecord> {
        self.devices.get(signal)
    }

    /// Status of a signal; signals absent from the manifest are active.
    pub fn status(&self, signal: &str) -> DeviceStatus {
        self.devices
            .get(signal)
            .map(|d| d.status)
            .unwrap_or(DeviceStatus::Active)
    }

    /// False only for signals explicitly inactive or in maintenance.
    pub fn is_controllable(&self, signal: &str) -> bool {
        !matches!(
            self.status(signal),
            DeviceStatus::Inactive | DeviceStatus::Maintenance
        )
    }

    /// Whether queue readings for `signal` should be trusted. A signal with
    /// a manifest record needs an active camera; one without a record is
    /// not gated.
    pub fn sensor_trusted(&self, signal: &str) -> bool {
        match self.devices.get(signal) {
            None => true,
            Some(dev) => matches!(
                dev.camera.as_ref().map(|c| c.status),
                Some(DeviceStatus::Active)
            ),
        }
    }

    pub fn partition(&self, signals: &[SignalId]) -> Partition {
        let (active, disabled): (Vec<SignalId>, Vec<SignalId>) = signals
            .iter()
            .cloned()
            .partition(|s| self.is_controllable(s));
        Partition { active, disabled }
    }

    pub fn tls_mac(&self, signal: &str) -> Option<&str> {
        self.devices.get(signal).map(|d| d.id.as_str())
    }

    pub fn camera_mac(&self, signal: &str) -> Option<&str> {
        self.devices
            .get(signal)
            .and_then(|d| d.camera.as_ref())
            .map(|c| c.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"[
        {"source": "from_api", "sumo_id": "J1", "id": "AA:01", "type": "traffic_control_unit",
         "camera": {"id": "CC:01", "status": "active", "source": "from_api"},
         "geo": {"lat": -23.5, "lon": -46.6}, "status": "active"},
        {"sumo_id": "J2", "id": "AA:02", "type": "traffic_control_unit",
         "camera": {"id": "CC:02", "status": "inactive"}, "status": "maintenance"},
        {"sumo_id": "J3", "id": "AA:03", "type": "traffic_control_unit", "status": "active"},
        {"id": "AA:99", "type": "orphan"}
    ]"#;

    fn registry() -> DeviceRegistry {
        let records: Vec<DeviceRecord> = serde_json::from_str(MANIFEST).unwrap();
        DeviceRegistry::from_records(records)
    }

    #[test]
    fn records_without_signal_id_are_ignored() {
        let reg = registry();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.tls_mac("J1"), Some("AA:01"));
        assert_eq!(reg.camera_mac("J3"), None);
        assert_eq!(reg.get("J1").unwrap().geo, Some(GeoPoint { lat: -23.5, lon: -46.6 }));
    }

    #[test]
    fn controllability_and_gating() {
        let reg = registry();
        assert!(reg.is_controllable("J1"));
        assert!(!reg.is_controllable("J2"));
        assert!(reg.is_controllable("unknown"));

        assert!(reg.sensor_trusted("J1"));
        assert!(!reg.sensor_trusted("J2"));
        // Record without a camera: gated.
        assert!(!reg.sensor_trusted("J3"));
        assert!(reg.sensor_trusted("unknown"));
    }

    #[test]
    fn partition_keeps_order() {
        let reg = registry();
        let p = reg.partition(&["J3".into(), "J2".into(), "J1".into(), "X".into()]);
        assert_eq!(p.active, vec!["J3".to_string(), "J1".to_string(), "X".to_string()]);
        assert_eq!(p.disabled, vec!["J2".to_string()]);
    }

    #[test]
    fn overlay_updates_signals_and_cameras() {
        let mut reg = registry();
        let summary = reg.apply_overlay(&[
            StatusRow::new("AA:01", "inactive", "SEMAFARO"),
            StatusRow::new("CC:02", "active", "CAMERA"),
            StatusRow::new("ZZ:00", "active", "SEMAFARO"),
        ]);
        assert_eq!(summary.signals_updated, 1);
        assert_eq!(summary.cameras_updated, 1);
        assert_eq!(summary.unmatched, 1);
        assert!(!reg.is_controllable("J1"));
        assert!(reg.sensor_trusted("J2"));
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = DeviceRegistry::load_manifest(dir.path().join("nope.json")).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            DeviceRegistry::load_manifest(&path),
            Err(RegistryError::Parse { .. })
        ));
    }
}
