//! Raw remote-sensing scenes and the band-ratio indices computed from them.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, time::Duration};

use crate::{provider::truncate_body, spatial::GeoPolygon};

/// Surface reflectance of one pixel: blue (B2), green (B3), red (B4),
/// near-infrared (B8).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPixel {
    pub blue: f64,
    pub green: f64,
    pub red: f64,
    pub nir: f64,
}

impl BandPixel {
    pub fn ndvi(&self) -> f64 {
        normalized_difference(self.nir, self.red)
    }

    pub fn ndwi(&self) -> f64 {
        normalized_difference(self.green, self.nir)
    }

    pub fn evi(&self) -> f64 {
        let denom = self.nir + 6.0 * self.red - 7.5 * self.blue + 1.0;
        if denom == 0.0 { f64::NAN } else { 2.5 * (self.nir - self.red) / denom }
    }
}

/// NaN when both bands are zero; callers skip non-finite pixels.
fn normalized_difference(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum == 0.0 { f64::NAN } else { (a - b) / sum }
}

/// Land-surface temperature product scale: raw × 0.02 = Kelvin.
pub const LST_SCALE: f64 = 0.02;

pub fn lst_raw_to_celsius(raw: f64) -> f64 {
    raw * LST_SCALE - 273.15
}

/// One scene clipped to a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneData {
    pub pixels: Vec<BandPixel>,
    /// Volumetric soil moisture samples, percent.
    #[serde(default)]
    pub soil_moisture: Vec<f64>,
    /// Raw land-surface-temperature samples, see [`LST_SCALE`].
    #[serde(default)]
    pub land_surface_temp_raw: Vec<f64>,
    /// Net radiation, W/m².
    pub net_radiation: f64,
}

/// Live source of remote-sensing scenes.
#[async_trait]
pub trait SceneSource: Send + Sync + Debug {
    async fn fetch_scene(&self, zone_id: &str, polygon: &GeoPolygon) -> Result<SceneData>;
}

/// Scene service reached over HTTP: `POST {endpoint}/v1/scenes`.
#[derive(Debug, Clone)]
pub struct HttpSceneSource {
    endpoint: String,
    timeout: Duration,
    http: Client,
}

#[derive(Serialize)]
struct SceneRequest<'a> {
    zone_id: &'a str,
    geometry: &'a GeoPolygon,
}

impl HttpSceneSource {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self { endpoint, timeout, http: Client::new() }
    }
}

#[async_trait]
impl SceneSource for HttpSceneSource {
    async fn fetch_scene(&self, zone_id: &str, polygon: &GeoPolygon) -> Result<SceneData> {
        let url = format!("{}/v1/scenes", self.endpoint.trim_end_matches('/'));

        let res = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&SceneRequest { zone_id, geometry: polygon })
            .send()
            .await
            .context("Failed to send request to scene service")?;

        let status = res.status();
        let body = res.text().await.context("Failed to read scene service response body")?;

        if !status.is_success() {
            return Err(anyhow!(
                "Scene request failed with status {}: {}",
                status,
                truncate_body(&body),
            ));
        }

        serde_json::from_str(&body).context("Failed to parse scene JSON")
    }
}
