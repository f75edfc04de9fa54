//! Network-free estimator used when no external source can be reached.
//!
//! Values follow a fixed diurnal model rather than any observation, so this
//! provider should only ever be one voice among several in the median.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::f64::consts::PI;

use crate::{
    agronomy::estimate_solar_radiation_at,
    error::CoreResult,
    model::{DailyForecast, WeatherObservation},
    provider::ProviderId,
    spatial::GeoPoint,
};

use super::WeatherProvider;

const BASE_TEMPERATURE: f64 = 20.0;
const TEMPERATURE_AMPLITUDE: f64 = 5.0;
const BASE_HUMIDITY: f64 = 60.0;
const HUMIDITY_AMPLITUDE: f64 = 20.0;
const TYPICAL_WIND: f64 = 2.0;

#[derive(Debug, Clone, Default)]
pub struct OfflineProvider;

impl OfflineProvider {
    pub fn new() -> Self {
        Self
    }

    /// Estimated conditions at `point` for the instant `at`.
    pub fn observation_at(point: GeoPoint, at: DateTime<Utc>) -> WeatherObservation {
        let hour = at.hour();
        WeatherObservation {
            timestamp: at,
            temperature: estimate_temperature(hour),
            humidity: estimate_humidity(hour),
            precipitation_probability: 0.0,
            precipitation: 0.0,
            wind_speed: TYPICAL_WIND,
            pressure: 1013.25,
            cloud_cover: 0.0,
            uv_index: 0.0,
            soil_moisture: None,
            solar_radiation: Some(estimate_solar_radiation_at(point.lat, at)),
        }
    }

    /// Repeats the daily envelope of the diurnal model for `days` days.
    pub fn forecast_from(at: DateTime<Utc>, days: u32) -> Vec<DailyForecast> {
        (0..days)
            .map(|i| DailyForecast {
                date: (at + Duration::days(i as i64)).date_naive(),
                temperature_max: BASE_TEMPERATURE + TEMPERATURE_AMPLITUDE,
                temperature_min: BASE_TEMPERATURE - TEMPERATURE_AMPLITUDE,
                precipitation: 0.0,
                precipitation_probability: 0.0,
                humidity: Some(BASE_HUMIDITY),
                wind_speed: Some(TYPICAL_WIND),
                uv_index: None,
            })
            .collect()
    }
}

/// Peaks at 15:00, lowest at 03:00.
fn estimate_temperature(hour: u32) -> f64 {
    let phase = (hour as f64 - 15.0) * PI / 12.0;
    round1(BASE_TEMPERATURE + TEMPERATURE_AMPLITUDE * phase.cos())
}

/// Inverse of temperature: peaks at 03:00.
fn estimate_humidity(hour: u32) -> f64 {
    let phase = (hour as f64 - 3.0) * PI / 12.0;
    round1((BASE_HUMIDITY + HUMIDITY_AMPLITUDE * phase.cos()).clamp(0.0, 100.0))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[async_trait]
impl WeatherProvider for OfflineProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Offline
    }

    async fn fetch_current(&self, point: GeoPoint) -> CoreResult<WeatherObservation> {
        Ok(Self::observation_at(point, Utc::now()))
    }

    async fn fetch_forecast(&self, _point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>> {
        Ok(Self::forecast_from(Utc::now(), days))
    }
}
