use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::{CoreError, CoreResult},
    model::{DailyForecast, ProviderForecast, WeatherObservation},
    provider::{ProviderId, kph_to_mps, truncate_body},
    spatial::GeoPoint,
};

use super::WeatherProvider;

const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com";

const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,precipitation,wind_speed_10m,\
                              pressure_msl,cloud_cover,shortwave_radiation";
const HOURLY_FIELDS: &str = "precipitation_probability,soil_moisture_0_to_7cm,uv_index";
const DAILY_FIELDS: &str = "temperature_2m_max,temperature_2m_min,precipitation_sum,\
                            precipitation_probability_max,wind_speed_10m_max,uv_index_max";

/// W/m² (instantaneous) to MJ/m²/day.
const W_M2_TO_MJ_DAY: f64 = 0.0864;

/// Open-Meteo forecast client. Keyless; times requested in UTC.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    base_url: String,
    http: Client,
}

impl Default for OpenMeteoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenMeteoProvider {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url, http: Client::new() }
    }

    async fn fetch_payload(&self, point: GeoPoint, days: u32) -> Result<OmResponse> {
        let url = format!("{}/v1/forecast", self.base_url.trim_end_matches('/'));

        let res = self
            .http
            .get(&url)
            .query(&[
                ("latitude", point.lat.to_string()),
                ("longitude", point.lon.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
                ("hourly", HOURLY_FIELDS.to_string()),
                ("daily", DAILY_FIELDS.to_string()),
                ("timezone", "UTC".to_string()),
                ("forecast_days", days.clamp(1, 16).to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to Open-Meteo")?;

        let status = res.status();
        let body = res.text().await.context("Failed to read Open-Meteo response body")?;

        if !status.is_success() {
            return Err(anyhow!(
                "Open-Meteo request failed with status {}: {}",
                status,
                truncate_body(&body),
            ));
        }

        serde_json::from_str(&body).context("Failed to parse Open-Meteo JSON")
    }
}

#[derive(Debug, Deserialize)]
struct OmCurrent {
    time: String,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    #[serde(default)]
    precipitation: f64,
    /// km/h
    wind_speed_10m: f64,
    pressure_msl: f64,
    #[serde(default)]
    cloud_cover: f64,
    #[serde(default)]
    shortwave_radiation: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct OmHourly {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
    /// m³/m³
    #[serde(default)]
    soil_moisture_0_to_7cm: Vec<Option<f64>>,
    #[serde(default)]
    uv_index: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct OmDaily {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    uv_index_max: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct OmResponse {
    current: OmCurrent,
    #[serde(default)]
    hourly: OmHourly,
    #[serde(default)]
    daily: OmDaily,
}

fn parse_time(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .with_context(|| format!("Open-Meteo returned invalid time '{s}'"))
}

fn at<T: Copy>(values: &[Option<T>], idx: usize) -> Option<T> {
    values.get(idx).copied().flatten()
}

impl OmResponse {
    fn current_observation(&self) -> Result<WeatherObservation> {
        let c = &self.current;
        let time = parse_time(&c.time)?;
        let target_ts = time.and_utc().timestamp();

        let hour_idx = self
            .hourly
            .time
            .iter()
            .enumerate()
            .filter_map(|(i, t)| parse_time(t).ok().map(|t| (i, t.and_utc().timestamp())))
            .min_by_key(|(_, ts)| (ts - target_ts).abs())
            .map(|(i, _)| i);

        let hourly = |values: &[Option<f64>]| hour_idx.and_then(|i| at(values, i));

        Ok(WeatherObservation {
            timestamp: time.and_utc(),
            temperature: c.temperature_2m,
            humidity: c.relative_humidity_2m,
            precipitation_probability: hourly(&self.hourly.precipitation_probability).unwrap_or(0.0),
            precipitation: c.precipitation,
            wind_speed: kph_to_mps(c.wind_speed_10m),
            pressure: c.pressure_msl,
            cloud_cover: c.cloud_cover,
            uv_index: hourly(&self.hourly.uv_index).unwrap_or(0.0),
            soil_moisture: hourly(&self.hourly.soil_moisture_0_to_7cm).map(|m| m * 100.0),
            solar_radiation: c.shortwave_radiation.map(|w| w * W_M2_TO_MJ_DAY),
        })
    }

    fn daily_forecast(&self, days: u32) -> Result<Vec<DailyForecast>> {
        let d = &self.daily;
        let mut out = Vec::new();
        for (i, date) in d.time.iter().take(days as usize).enumerate() {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("Open-Meteo returned invalid date '{date}'"))?;
            // Days without a temperature envelope are not forecast days yet.
            let (Some(temperature_max), Some(temperature_min)) =
                (at(&d.temperature_2m_max, i), at(&d.temperature_2m_min, i))
            else {
                continue;
            };
            out.push(DailyForecast {
                date,
                temperature_max,
                temperature_min,
                precipitation: at(&d.precipitation_sum, i).unwrap_or(0.0),
                precipitation_probability: at(&d.precipitation_probability_max, i).unwrap_or(0.0),
                humidity: None,
                wind_speed: at(&d.wind_speed_10m_max, i).map(kph_to_mps),
                uv_index: at(&d.uv_index_max, i),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenMeteo
    }

    async fn fetch_current(&self, point: GeoPoint) -> CoreResult<WeatherObservation> {
        let parsed = self.fetch_payload(point, 1).await.map_err(unavailable)?;
        parsed.current_observation().map_err(unavailable)
    }

    async fn fetch_forecast(&self, point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>> {
        let parsed = self.fetch_payload(point, days).await.map_err(unavailable)?;
        parsed.daily_forecast(days).map_err(unavailable)
    }

    async fn fetch(&self, point: GeoPoint, days: u32) -> CoreResult<ProviderForecast> {
        let parsed = self.fetch_payload(point, days).await.map_err(unavailable)?;
        let current = parsed.current_observation().map_err(unavailable)?;
        tracing::debug!(
            provider = %ProviderId::OpenMeteo,
            lag_secs = (Utc::now() - current.timestamp).num_seconds(),
            "open-meteo sample"
        );
        Ok(ProviderForecast {
            provider: ProviderId::OpenMeteo,
            current,
            daily: parsed.daily_forecast(days).map_err(unavailable)?,
        })
    }
}

fn unavailable(err: anyhow::Error) -> CoreError {
    CoreError::unavailable(ProviderId::OpenMeteo, format!("{err:#}"))
}
