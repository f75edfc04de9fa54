//! Field-device liveness tracking.
//!
//! Heartbeats mark a device Online. A scheduler calls [`DeviceHealthMonitor::tick`]
//! periodically; each tick marks devices whose last heartbeat is older than
//! the offline threshold as Offline and raises an alert that escalates from
//! medium to high once the stale count reaches the retry limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::DeviceSettings,
    error::{CoreError, CoreResult},
    ports::{Alert, AlertSink, Severity},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    /// dBm.
    #[serde(default)]
    pub signal_strength: Option<i32>,
    /// Direct volumetric reading, percent.
    #[serde(default)]
    pub soil_moisture: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealthRecord {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub signal_strength: Option<i32>,
    pub battery_level: Option<f64>,
    pub consecutive_error_count: u32,
    pub is_online: bool,
    pub last_offline_at: Option<DateTime<Utc>>,
    /// Latest soil-moisture reading and when it was taken.
    pub soil_moisture: Option<f64>,
    pub soil_moisture_at: Option<DateTime<Utc>>,
}

impl DeviceHealthRecord {
    fn from_heartbeat(hb: &Heartbeat) -> Self {
        Self {
            device_id: hb.device_id.clone(),
            last_seen: hb.timestamp,
            signal_strength: hb.signal_strength,
            battery_level: hb.battery_level,
            consecutive_error_count: 0,
            is_online: true,
            last_offline_at: None,
            soil_moisture: hb.soil_moisture,
            soil_moisture_at: hb.soil_moisture.map(|_| hb.timestamp),
        }
    }

    /// Latest soil-moisture reading if it was taken within `max_age` of `now`.
    pub fn recent_soil_moisture(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> Option<f64> {
        let taken = self.soil_moisture_at?;
        let age = now.signed_duration_since(taken).to_std().unwrap_or_default();
        self.soil_moisture.filter(|_| age <= max_age)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unregistered,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub swept_at: DateTime<Utc>,
    pub checked: usize,
    /// Devices that went Offline during this sweep.
    pub went_offline: Vec<String>,
    /// Every device Offline after this sweep.
    pub offline: Vec<String>,
    pub alerts: Vec<Alert>,
}

#[derive(Debug)]
pub struct DeviceHealthMonitor {
    settings: DeviceSettings,
    alerts: Arc<dyn AlertSink>,
    // One lock for the whole table: a sweep and a heartbeat never interleave
    // on the same record.
    records: Mutex<HashMap<String, DeviceHealthRecord>>,
}

impl DeviceHealthMonitor {
    pub fn new(settings: DeviceSettings, alerts: Arc<dyn AlertSink>) -> Self {
        Self { settings, alerts, records: Mutex::new(HashMap::new()) }
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Record a heartbeat. Brings an Offline device back Online and clears
    /// its stale count. A heartbeat older than `last_seen` changes nothing.
    pub async fn record_heartbeat(&self, hb: Heartbeat) -> DeviceHealthRecord {
        let mut records = self.records.lock().await;

        let Some(record) = records.get_mut(&hb.device_id) else {
            info!(device_id = %hb.device_id, "device registered");
            let record = DeviceHealthRecord::from_heartbeat(&hb);
            records.insert(hb.device_id.clone(), record.clone());
            return record;
        };

        if hb.timestamp < record.last_seen {
            debug!(
                device_id = %hb.device_id,
                heartbeat_at = %hb.timestamp,
                last_seen = %record.last_seen,
                "ignoring out-of-order heartbeat"
            );
            return record.clone();
        }

        if !record.is_online {
            info!(
                device_id = %hb.device_id,
                stale_sweeps = record.consecutive_error_count,
                "device back online"
            );
        }

        record.is_online = true;
        record.consecutive_error_count = 0;
        record.last_seen = hb.timestamp;
        if hb.signal_strength.is_some() {
            record.signal_strength = hb.signal_strength;
        }
        if hb.battery_level.is_some() {
            record.battery_level = hb.battery_level;
        }
        if let Some(moisture) = hb.soil_moisture {
            record.soil_moisture = Some(moisture);
            record.soil_moisture_at = Some(hb.timestamp);
        }

        record.clone()
    }

    /// One liveness sweep at `now`. Alerts are delivered after the device
    /// table is released.
    pub async fn tick(&self, now: DateTime<Utc>) -> SweepReport {
        let offline_after = self.settings.offline_after();
        let mut alerts = Vec::new();
        let mut went_offline = Vec::new();
        let mut offline = Vec::new();

        let checked = {
            let mut records = self.records.lock().await;
            let mut ids: Vec<String> = records.keys().cloned().collect();
            ids.sort_unstable();

            for id in &ids {
                let Some(record) = records.get_mut(id) else { continue };
                let silence = now.signed_duration_since(record.last_seen);

                if silence.to_std().is_ok_and(|s| s > offline_after) {
                    record.consecutive_error_count += 1;
                    if record.is_online {
                        record.is_online = false;
                        record.last_offline_at = Some(now);
                        went_offline.push(id.clone());
                    }
                    offline.push(id.clone());

                    let count = record.consecutive_error_count;
                    let limit = self.settings.retry_limit;
                    let minutes = silence.num_seconds() as f64 / 60.0;
                    let (severity, detail) = if count >= limit {
                        (Severity::High, format!("after {count} stale checks"))
                    } else {
                        (Severity::Medium, format!("(check {count} of {limit})"))
                    };
                    warn!(device_id = %id, stale_sweeps = count, %severity, "device offline");
                    alerts.push(Alert::new(
                        format!("Device {id} connection lost"),
                        format!(
                            "No heartbeat for {minutes:.1} minutes {detail}. \
                             Zone decisions fall back to weather and vegetation data."
                        ),
                        severity,
                    ));
                } else if let Some(dbm) = record.signal_strength.filter(|s| *s < self.settings.weak_signal_dbm) {
                    alerts.push(Alert::new(
                        "Weak device connection",
                        format!("Device {id} has weak signal strength ({dbm} dBm). Connection may be unstable."),
                        Severity::Low,
                    ));
                }
            }
            ids.len()
        };

        for alert in &alerts {
            self.alerts.send(alert.clone()).await;
        }

        SweepReport { swept_at: now, checked, went_offline, offline, alerts }
    }

    pub async fn status(&self, device_id: &str) -> DeviceStatus {
        match self.records.lock().await.get(device_id) {
            Some(r) if r.is_online => DeviceStatus::Online,
            Some(_) => DeviceStatus::Offline,
            None => DeviceStatus::Unregistered,
        }
    }

    pub async fn record(&self, device_id: &str) -> Option<DeviceHealthRecord> {
        self.records.lock().await.get(device_id).cloned()
    }

    /// The device's record, or [`CoreError::DeviceOffline`] when it is
    /// Offline or has never been seen.
    pub async fn require_online(&self, device_id: &str) -> CoreResult<DeviceHealthRecord> {
        match self.records.lock().await.get(device_id) {
            Some(r) if r.is_online => Ok(r.clone()),
            _ => Err(CoreError::DeviceOffline { device_id: device_id.to_string() }),
        }
    }

    /// Every record, ordered by device id.
    pub async fn snapshot(&self) -> Vec<DeviceHealthRecord> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }
}
