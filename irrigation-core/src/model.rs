use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;
use crate::spatial::GeoPolygon;

/// One normalized reading from a provider: °C, %, mm, m/s, hPa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub precipitation_probability: f64,
    pub precipitation: f64,
    pub wind_speed: f64,
    pub pressure: f64,
    pub cloud_cover: f64,
    pub uv_index: f64,
    /// Volumetric soil moisture, percent.
    pub soil_moisture: Option<f64>,
    /// Shortwave radiation, MJ/m²/day.
    pub solar_radiation: Option<f64>,
}

/// One forecast day from a provider, or the combination of several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub temperature_max: f64,
    pub temperature_min: f64,
    pub precipitation: f64,
    pub precipitation_probability: f64,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub uv_index: Option<f64>,
}

/// What a single provider returns for a single point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderForecast {
    pub provider: ProviderId,
    pub current: WeatherObservation,
    pub daily: Vec<DailyForecast>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Computed for this request.
    Fresh,
    /// Served from the cache within its TTL.
    Cached,
    /// Served past its TTL because no provider answered.
    Stale,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Distinct providers that contributed at least one sample.
    pub providers: Vec<ProviderId>,
    pub sample_points: usize,
    pub attempted_samples: usize,
    pub successful_samples: usize,
    pub generated_at: DateTime<Utc>,
    pub cache_status: CacheStatus,
}

impl Provenance {
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

/// Median-combined weather over a zone polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedForecast {
    pub current: WeatherObservation,
    pub daily: Vec<DailyForecast>,
    pub provenance: Provenance,
}

impl AggregatedForecast {
    /// Precipitation summed over the first `days` forecast days.
    pub fn expected_rain(&self, days: usize) -> f64 {
        self.daily.iter().take(days).map(|d| d.precipitation).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl IndexStats {
    /// Mean/min/max over the finite values, `None` when there are none.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| IndexStats { mean: sum / count as f64, min, max })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterStressLevel {
    Low,
    Moderate,
    High,
    Severe,
}

impl WaterStressLevel {
    pub fn from_index(index: f64) -> Self {
        if index < 0.2 {
            WaterStressLevel::Low
        } else if index < 0.4 {
            WaterStressLevel::Moderate
        } else if index < 0.6 {
            WaterStressLevel::High
        } else {
            WaterStressLevel::Severe
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaterStress {
    pub index: f64,
    pub level: WaterStressLevel,
}

impl WaterStress {
    pub fn from_index(index: f64) -> Self {
        Self { index, level: WaterStressLevel::from_index(index) }
    }
}

/// Which tier served a vegetation snapshot. Only `Live` is first-hand data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VegetationStatus {
    Live,
    Cached,
    Synthetic,
}

impl VegetationStatus {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, VegetationStatus::Live)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationSnapshot {
    pub zone_id: String,
    pub ndvi: IndexStats,
    pub ndwi: IndexStats,
    pub evi: IndexStats,
    /// Percent. Absent when the scene carried no soil moisture samples.
    pub soil_moisture: Option<IndexStats>,
    /// °C.
    pub land_surface_temp: Option<IndexStats>,
    /// Actual evapotranspiration, mm/day.
    pub evapotranspiration: f64,
    pub water_stress: WaterStress,
    pub timestamp: DateTime<Utc>,
    pub status: VegetationStatus,
}

/// Zone configuration as supplied by the zone store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub zone_id: String,
    pub geometry: GeoPolygon,
    #[serde(default)]
    pub target_moisture_min: Option<f64>,
    #[serde(default)]
    pub target_moisture_max: Option<f64>,
    #[serde(default)]
    pub field_capacity: Option<f64>,
    #[serde(default)]
    pub wilting_point: Option<f64>,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl ZoneRecord {
    /// Midpoint of the configured band, or whichever bound is set.
    pub fn target_moisture(&self) -> Option<f64> {
        match (self.target_moisture_min, self.target_moisture_max) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        }
    }
}
