use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::{CoreError, CoreResult},
    model::{DailyForecast, ProviderForecast, WeatherObservation},
    provider::{ProviderId, kph_to_mps, truncate_body},
    spatial::GeoPoint,
};

use super::WeatherProvider;

const DEFAULT_BASE_URL: &str = "http://api.weatherapi.com";

/// WeatherAPI.com client. Wind arrives in km/h and is converted to m/s.
#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WeatherApiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url, http: Client::new() }
    }

    async fn fetch_forecast_json(&self, point: GeoPoint, days: u32) -> Result<WaForecastResponse> {
        let url = format!("{}/v1/forecast.json", self.base_url.trim_end_matches('/'));
        let q = format!("{},{}", point.lat, point.lon);

        let res = self
            .http
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", q.as_str()),
                ("days", &days.max(1).to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to WeatherAPI.com (forecast)")?;

        let status = res.status();
        let body = res.text().await.context("Failed to read WeatherAPI forecast response body")?;

        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "WeatherAPI forecast request failed with status {}: {}",
                status,
                truncate_body(&body),
            ));
        }

        serde_json::from_str(&body).context("Failed to parse WeatherAPI forecast JSON")
    }
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    last_updated_epoch: Option<i64>,
    temp_c: f64,
    humidity: f64,
    wind_kph: f64,
    pressure_mb: f64,
    #[serde(default)]
    precip_mm: f64,
    cloud: f64,
    #[serde(default)]
    uv: f64,
}

#[derive(Debug, Deserialize)]
struct WaForecastHour {
    time_epoch: i64,
    #[serde(default)]
    chance_of_rain: f64,
}

#[derive(Debug, Deserialize)]
struct WaDay {
    maxtemp_c: f64,
    mintemp_c: f64,
    #[serde(default)]
    totalprecip_mm: f64,
    #[serde(default)]
    daily_chance_of_rain: f64,
    avghumidity: Option<f64>,
    maxwind_kph: Option<f64>,
    uv: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WaForecastDay {
    date: String,
    day: WaDay,
    #[serde(default)]
    hour: Vec<WaForecastHour>,
}

#[derive(Debug, Deserialize)]
struct WaForecast {
    forecastday: Vec<WaForecastDay>,
}

#[derive(Debug, Deserialize)]
struct WaForecastResponse {
    current: WaCurrent,
    forecast: WaForecast,
}

impl WaForecastResponse {
    fn current_observation(&self) -> WeatherObservation {
        let c = &self.current;
        let observation_time =
            c.last_updated_epoch.and_then(unix_to_utc).unwrap_or_else(Utc::now);
        let target_ts = observation_time.timestamp();

        // The current block has no rain chance; take the nearest forecast hour.
        let chance_of_rain = self
            .forecast
            .forecastday
            .iter()
            .flat_map(|d| d.hour.iter())
            .min_by_key(|h| (h.time_epoch - target_ts).abs())
            .map(|h| h.chance_of_rain)
            .unwrap_or(0.0);

        WeatherObservation {
            timestamp: observation_time,
            temperature: c.temp_c,
            humidity: c.humidity,
            precipitation_probability: chance_of_rain,
            precipitation: c.precip_mm,
            wind_speed: kph_to_mps(c.wind_kph),
            pressure: c.pressure_mb,
            cloud_cover: c.cloud,
            uv_index: c.uv,
            soil_moisture: None,
            solar_radiation: None,
        }
    }

    fn daily_forecast(&self, days: u32) -> Result<Vec<DailyForecast>> {
        self.forecast
            .forecastday
            .iter()
            .take(days as usize)
            .map(|d| {
                let date = NaiveDate::parse_from_str(&d.date, "%Y-%m-%d")
                    .with_context(|| format!("WeatherAPI returned invalid date '{}'", d.date))?;
                Ok(DailyForecast {
                    date,
                    temperature_max: d.day.maxtemp_c,
                    temperature_min: d.day.mintemp_c,
                    precipitation: d.day.totalprecip_mm,
                    precipitation_probability: d.day.daily_chance_of_rain,
                    humidity: d.day.avghumidity,
                    wind_speed: d.day.maxwind_kph.map(kph_to_mps),
                    uv_index: d.day.uv,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherApi
    }

    async fn fetch_current(&self, point: GeoPoint) -> CoreResult<WeatherObservation> {
        let parsed = self.fetch_forecast_json(point, 1).await.map_err(unavailable)?;
        Ok(parsed.current_observation())
    }

    async fn fetch_forecast(&self, point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>> {
        let parsed = self.fetch_forecast_json(point, days).await.map_err(unavailable)?;
        parsed.daily_forecast(days).map_err(unavailable)
    }

    async fn fetch(&self, point: GeoPoint, days: u32) -> CoreResult<ProviderForecast> {
        let parsed = self.fetch_forecast_json(point, days).await.map_err(unavailable)?;
        Ok(ProviderForecast {
            provider: ProviderId::WeatherApi,
            current: parsed.current_observation(),
            daily: parsed.daily_forecast(days).map_err(unavailable)?,
        })
    }
}

fn unavailable(err: anyhow::Error) -> CoreError {
    CoreError::unavailable(ProviderId::WeatherApi, format!("{err:#}"))
}

fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}
