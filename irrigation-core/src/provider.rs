use crate::{
    Config,
    error::CoreResult,
    model::{DailyForecast, ProviderForecast, WeatherObservation},
    provider::{
        offline::OfflineProvider, open_meteo::OpenMeteoProvider, openweather::OpenWeatherProvider,
        weatherapi::WeatherApiProvider,
    },
    spatial::GeoPoint,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt::Debug, sync::Arc};

pub mod offline;
pub mod open_meteo;
pub mod openweather;
pub mod weatherapi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenWeather,
    WeatherApi,
    OpenMeteo,
    Offline,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
            ProviderId::OpenMeteo => "openmeteo",
            ProviderId::Offline => "offline",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenWeather, ProviderId::WeatherApi, ProviderId::OpenMeteo, ProviderId::Offline]
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, ProviderId::OpenWeather | ProviderId::WeatherApi)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(ProviderId::OpenWeather),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            "openmeteo" | "open-meteo" => Ok(ProviderId::OpenMeteo),
            "offline" => Ok(ProviderId::Offline),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: openweather, weatherapi, openmeteo, offline."
            )),
        }
    }
}

/// One external weather source, normalized to metric units and m/s wind.
///
/// Implementations must map every transport or decoding failure to
/// [`CoreError::ProviderUnavailable`](crate::CoreError::ProviderUnavailable).
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    async fn fetch_current(&self, point: GeoPoint) -> CoreResult<WeatherObservation>;

    async fn fetch_forecast(&self, point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>>;

    /// Current conditions plus `days` of forecast for one point.
    async fn fetch(&self, point: GeoPoint, days: u32) -> CoreResult<ProviderForecast> {
        let (current, daily) =
            tokio::try_join!(self.fetch_current(point), self.fetch_forecast(point, days))?;
        Ok(ProviderForecast { provider: self.id(), current, daily })
    }
}

/// Construct a provider from config and explicit ProviderId.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    let api_key = match config.provider_api_key(id) {
        Some(key) if !key.is_empty() => key.to_owned(),
        _ if id.requires_api_key() => {
            return Err(anyhow::anyhow!(
                "No API key configured for provider '{id}'.\n\
                 Hint: run `irrigate configure {id}` and enter your API key."
            ));
        }
        _ => String::new(),
    };

    let provider: Arc<dyn WeatherProvider> = match id {
        ProviderId::OpenWeather => Arc::new(OpenWeatherProvider::new(api_key)),
        ProviderId::WeatherApi => Arc::new(WeatherApiProvider::new(api_key)),
        ProviderId::OpenMeteo => Arc::new(OpenMeteoProvider::new()),
        ProviderId::Offline => Arc::new(OfflineProvider::new()),
    };

    Ok(provider)
}

/// Every configured provider, default provider first. A keyed provider
/// whose entry has no key is skipped. Falls back to Open-Meteo alone when
/// nothing is configured.
pub fn providers_from_config(config: &Config) -> anyhow::Result<Vec<Arc<dyn WeatherProvider>>> {
    let mut ids: Vec<ProviderId> = ProviderId::all()
        .iter()
        .copied()
        .filter(|id| config.is_provider_configured(*id))
        .collect();

    if ids.is_empty() {
        ids.push(ProviderId::OpenMeteo);
    }

    if let Ok(default) = config.default_provider_id() {
        ids.sort_by_key(|id| *id != default);
    }

    ids.into_iter().map(|id| provider_from_config(id, config)).collect()
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

pub(crate) fn kph_to_mps(kph: f64) -> f64 {
    kph / 3.6
}
