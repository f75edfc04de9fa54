use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::{CoreError, CoreResult},
    model::{DailyForecast, ProviderForecast, WeatherObservation},
    provider::{ProviderId, truncate_body},
    spatial::GeoPoint,
};

use super::WeatherProvider;

const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

/// OpenWeather One Call client. Metric units; wind is already m/s.
#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url, http: Client::new() }
    }

    async fn fetch_one_call(&self, point: GeoPoint) -> Result<OwOneCallResponse> {
        let url = format!("{}/data/3.0/onecall", self.base_url.trim_end_matches('/'));

        let res = self
            .http
            .get(&url)
            .query(&[
                ("lat", point.lat.to_string()),
                ("lon", point.lon.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
                ("exclude", "minutely,alerts".to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to OpenWeather (one call)")?;

        let status = res.status();
        let body = res
            .text()
            .await
            .context("Failed to read OpenWeather one call response body")?;

        if !status.is_success() {
            return Err(anyhow!(
                "OpenWeather one call request failed with status {}: {}",
                status,
                truncate_body(&body),
            ));
        }

        serde_json::from_str(&body).context("Failed to parse OpenWeather one call JSON")
    }
}

#[derive(Debug, Deserialize)]
struct OwPrecip {
    #[serde(rename = "1h", default)]
    one_hour: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrent {
    dt: i64,
    temp: f64,
    humidity: f64,
    pressure: f64,
    clouds: f64,
    #[serde(default)]
    uvi: f64,
    wind_speed: f64,
    #[serde(default)]
    rain: Option<OwPrecip>,
}

#[derive(Debug, Deserialize)]
struct OwHourly {
    #[serde(default)]
    pop: f64,
}

#[derive(Debug, Deserialize)]
struct OwDailyTemp {
    min: f64,
    max: f64,
}

#[derive(Debug, Deserialize)]
struct OwDaily {
    dt: i64,
    temp: OwDailyTemp,
    humidity: f64,
    wind_speed: f64,
    #[serde(default)]
    pop: f64,
    #[serde(default)]
    rain: Option<f64>,
    #[serde(default)]
    uvi: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwOneCallResponse {
    current: OwCurrent,
    #[serde(default)]
    hourly: Vec<OwHourly>,
    #[serde(default)]
    daily: Vec<OwDaily>,
}

impl OwOneCallResponse {
    fn current_observation(&self) -> WeatherObservation {
        let c = &self.current;
        // `pop` is a 0..1 fraction on the next hour.
        let pop = self.hourly.first().map(|h| h.pop).unwrap_or(0.0);

        WeatherObservation {
            timestamp: unix_to_utc(c.dt).unwrap_or_else(Utc::now),
            temperature: c.temp,
            humidity: c.humidity,
            precipitation_probability: pop * 100.0,
            precipitation: c.rain.as_ref().and_then(|r| r.one_hour).unwrap_or(0.0),
            wind_speed: c.wind_speed,
            pressure: c.pressure,
            cloud_cover: c.clouds,
            uv_index: c.uvi,
            soil_moisture: None,
            solar_radiation: None,
        }
    }

    fn daily_forecast(&self, days: u32) -> Result<Vec<DailyForecast>> {
        self.daily
            .iter()
            .take(days as usize)
            .map(|d| {
                let date = unix_to_utc(d.dt)
                    .ok_or_else(|| anyhow!("OpenWeather daily entry has invalid timestamp {}", d.dt))?
                    .date_naive();
                Ok(DailyForecast {
                    date,
                    temperature_max: d.temp.max,
                    temperature_min: d.temp.min,
                    precipitation: d.rain.unwrap_or(0.0),
                    precipitation_probability: d.pop * 100.0,
                    humidity: Some(d.humidity),
                    wind_speed: Some(d.wind_speed),
                    uv_index: d.uvi,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    async fn fetch_current(&self, point: GeoPoint) -> CoreResult<WeatherObservation> {
        let parsed = self.fetch_one_call(point).await.map_err(unavailable)?;
        Ok(parsed.current_observation())
    }

    async fn fetch_forecast(&self, point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>> {
        let parsed = self.fetch_one_call(point).await.map_err(unavailable)?;
        parsed.daily_forecast(days).map_err(unavailable)
    }

    // One Call carries both blocks; a single request serves the pair.
    async fn fetch(&self, point: GeoPoint, days: u32) -> CoreResult<ProviderForecast> {
        let parsed = self.fetch_one_call(point).await.map_err(unavailable)?;
        Ok(ProviderForecast {
            provider: ProviderId::OpenWeather,
            current: parsed.current_observation(),
            daily: parsed.daily_forecast(days).map_err(unavailable)?,
        })
    }
}

fn unavailable(err: anyhow::Error) -> CoreError {
    CoreError::unavailable(ProviderId::OpenWeather, format!("{err:#}"))
}

fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}
