//! Port traits: the boundary between the advisory core and its collaborators.
//!
//! ```text
//!   zone store ──▶ ZoneDirectory ──▶ IrrigationAdvisor
//!   DeviceHealthMonitor ──▶ AlertSink ──▶ notification transport
//! ```
//!
//! Adapters for storage and notification live outside this crate. The
//! in-memory implementations here back the CLI and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Mutex, PoisonError},
};

use crate::model::ZoneRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self { title: title.into(), message: message.into(), severity }
    }
}

// ───────────────────────────────────────────────────────────────
// Alert sink (core → notification transport)
// ───────────────────────────────────────────────────────────────

/// Receives structured alerts. Delivery failures are the sink's concern;
/// the core never waits on a retry.
#[async_trait]
pub trait AlertSink: Send + Sync + Debug {
    async fn send(&self, alert: Alert);
}

/// Emits alerts as tracing events, level chosen by severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: Alert) {
        match alert.severity {
            Severity::Low => tracing::info!(severity = %alert.severity, title = %alert.title, "{}", alert.message),
            Severity::Medium => {
                tracing::warn!(severity = %alert.severity, title = %alert.title, "{}", alert.message)
            }
            Severity::High => {
                tracing::error!(severity = %alert.severity, title = %alert.title, "{}", alert.message)
            }
        }
    }
}

/// Keeps every alert in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, alert: Alert) {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).push(alert);
    }
}

// ───────────────────────────────────────────────────────────────
// Zone directory (zone store → core)
// ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait ZoneDirectory: Send + Sync + Debug {
    async fn zone(&self, zone_id: &str) -> Option<ZoneRecord>;
}

/// Fixed set of zones, typically loaded from a TOML file.
#[derive(Debug, Clone, Default)]
pub struct StaticZones {
    zones: HashMap<String, ZoneRecord>,
}

#[derive(Debug, Deserialize)]
struct ZoneFile {
    #[serde(default, rename = "zone")]
    zones: Vec<ZoneRecord>,
}

impl StaticZones {
    pub fn new(zones: impl IntoIterator<Item = ZoneRecord>) -> Self {
        Self { zones: zones.into_iter().map(|z| (z.zone_id.clone(), z)).collect() }
    }

    /// Parse `[[zone]]` tables.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let file: ZoneFile = toml::from_str(contents)?;
        Ok(Self::new(file.zones))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.zones.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl ZoneDirectory for StaticZones {
    async fn zone(&self, zone_id: &str) -> Option<ZoneRecord> {
        self.zones.get(zone_id).cloned()
    }
}
