//! Core library for the `irrigate` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Spatial sampling of zone polygons
//! - Weather providers and their median aggregation
//! - Agronomic formulas (ETo, VPD, GDD, dew point, heat stress)
//! - Vegetation snapshots with live/cached/synthetic fallback
//! - Device liveness tracking
//! - The irrigation decision rule and its zone-level advisor
//!
//! It is used by `irrigation-cli`, but can also be embedded in other services.

pub mod advisor;
pub mod aggregator;
pub mod agronomy;
pub mod cache;
pub mod config;
pub mod decision;
pub mod device;
pub mod error;
pub mod model;
pub mod ports;
pub mod provider;
pub mod spatial;
pub mod vegetation;

pub use advisor::IrrigationAdvisor;
pub use aggregator::WeatherAggregator;
pub use config::{Config, ProviderConfig};
pub use decision::{IrrigationDecision, IrrigationReason};
pub use device::{DeviceHealthMonitor, DeviceHealthRecord, Heartbeat};
pub use error::{CoreError, CoreResult};
pub use model::{AggregatedForecast, VegetationSnapshot, ZoneRecord};
pub use provider::{ProviderId, WeatherProvider};
pub use spatial::{GeoPoint, GeoPolygon};
pub use vegetation::VegetationProvider;
