//! Zone vegetation snapshots with a three-tier fallback.
//!
//! 1. live: fetch a scene and compute indices;
//! 2. cached: the last live snapshot, while younger than `cache_max_age`;
//! 3. synthetic: plausible values for moderately healthy vegetation, at most
//!    one new draw per zone per `synthetic_window`.
//!
//! The returned snapshot's `status` names the tier that served it. Concurrent
//! requests for one zone share a single resolution.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    convert::Infallible,
    ops::Range,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    Config,
    cache::{SingleFlight, TtlCache},
    config::VegetationSettings,
    model::{IndexStats, VegetationSnapshot, VegetationStatus, WaterStress},
    spatial::GeoPolygon,
};

pub mod scene;

pub use scene::{BandPixel, HttpSceneSource, SceneData, SceneSource};

/// W/m² to MJ/m²/day.
const RADIATION_TO_MJ_DAY: f64 = 0.0864;

/// Crop coefficient applied to net radiation for potential ET.
const POTENTIAL_ET_FACTOR: f64 = 1.2;

/// Synthetic soil moisture mean, percent.
const SYNTHETIC_SOIL_MOISTURE: Range<f64> = 25.0..45.0;

/// Indices and statistics for one live scene. Band pixels are required;
/// soil moisture and land surface temperature are reported when present.
pub fn snapshot_from_scene(zone_id: &str, scene: &SceneData, now: DateTime<Utc>) -> Result<VegetationSnapshot> {
    let ndvi = IndexStats::from_values(scene.pixels.iter().map(BandPixel::ndvi))
        .ok_or_else(|| anyhow!("scene has no valid pixels"))?;
    let ndwi = IndexStats::from_values(scene.pixels.iter().map(BandPixel::ndwi))
        .ok_or_else(|| anyhow!("scene has no valid NDWI pixels"))?;
    let evi = IndexStats::from_values(scene.pixels.iter().map(BandPixel::evi))
        .ok_or_else(|| anyhow!("scene has no valid EVI pixels"))?;
    let soil_moisture = IndexStats::from_values(scene.soil_moisture.iter().copied());
    let land_surface_temp =
        IndexStats::from_values(scene.land_surface_temp_raw.iter().copied().map(scene::lst_raw_to_celsius));

    let (actual_et, stress_index) = evapotranspiration(ndvi.mean, scene.net_radiation);

    Ok(VegetationSnapshot {
        zone_id: zone_id.to_string(),
        ndvi,
        ndwi,
        evi,
        soil_moisture,
        land_surface_temp,
        evapotranspiration: actual_et,
        water_stress: WaterStress::from_index(stress_index),
        timestamp: now,
        status: VegetationStatus::Live,
    })
}

/// Actual ET (mm/day) and water stress index `1 - actual/potential` in [0, 1].
pub fn evapotranspiration(ndvi_mean: f64, net_radiation: f64) -> (f64, f64) {
    let radiation = net_radiation * RADIATION_TO_MJ_DAY;
    let actual = (0.8 * ndvi_mean + 0.1) * radiation;
    let potential = POTENTIAL_ET_FACTOR * radiation;

    let stress = if potential > 0.0 { (1.0 - actual / potential).clamp(0.0, 1.0) } else { 0.0 };
    (actual.max(0.0), stress)
}

type SnapshotCache = TtlCache<String, VegetationSnapshot>;

#[derive(Debug)]
pub struct VegetationProvider {
    source: Option<Arc<dyn SceneSource>>,
    settings: VegetationSettings,
    live: SnapshotCache,
    synthetic: SnapshotCache,
    inflight: SingleFlight<String, VegetationSnapshot>,
    rng: Mutex<StdRng>,
}

impl VegetationProvider {
    /// `source = None` skips the live tier.
    pub fn new(source: Option<Arc<dyn SceneSource>>, settings: VegetationSettings) -> Self {
        Self {
            source,
            settings,
            live: SnapshotCache::new(),
            synthetic: SnapshotCache::new(),
            inflight: SingleFlight::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let settings = config.vegetation.clone();
        let source = settings.scene_endpoint.clone().map(|endpoint| {
            Arc::new(HttpSceneSource::new(endpoint, settings.request_timeout())) as Arc<dyn SceneSource>
        });
        Self::new(source, settings)
    }

    /// Deterministic synthetic draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub async fn snapshot(&self, zone_id: &str, polygon: &GeoPolygon) -> VegetationSnapshot {
        self.snapshot_at(zone_id, polygon, Utc::now()).await
    }

    /// Best available snapshot at `now`. Never fails.
    pub async fn snapshot_at(&self, zone_id: &str, polygon: &GeoPolygon, now: DateTime<Utc>) -> VegetationSnapshot {
        let (snapshot, shared) = self
            .inflight
            .run(zone_id.to_string(), || self.resolve(zone_id, polygon, now))
            .await;
        if shared {
            debug!(zone_id, status = ?snapshot.status, "joined in-flight vegetation request");
        }
        snapshot
    }

    /// Soil moisture mean from the synthetic tier, for snapshots that carry
    /// none.
    pub async fn synthetic_soil_moisture(&self, zone_id: &str, now: DateTime<Utc>) -> f64 {
        self.synthetic_at(zone_id, now)
            .await
            .soil_moisture
            .map_or(SYNTHETIC_SOIL_MOISTURE.start, |stats| stats.mean)
    }

    async fn resolve(&self, zone_id: &str, polygon: &GeoPolygon, now: DateTime<Utc>) -> VegetationSnapshot {
        let key = zone_id.to_string();

        if let Some(source) = &self.source {
            match self.fetch_live(source.as_ref(), zone_id, polygon, now).await {
                Ok(snapshot) => {
                    self.live.put(key, snapshot.clone(), now, self.settings.cache_max_age());
                    return snapshot;
                }
                Err(err) => warn!(zone_id, error = %format!("{err:#}"), "live vegetation data unavailable"),
            }
        }

        if let Some(entry) = self.live.get(&key, now) {
            debug!(zone_id, age_secs = entry.age(now).as_secs(), "serving cached vegetation snapshot");
            let mut snapshot = entry.value;
            snapshot.status = VegetationStatus::Cached;
            return snapshot;
        }

        self.synthetic_at(zone_id, now).await
    }

    async fn synthetic_at(&self, zone_id: &str, now: DateTime<Utc>) -> VegetationSnapshot {
        let drawn = self
            .synthetic
            .get_or_try_insert_with(zone_id.to_string(), now, self.settings.synthetic_window(), || async {
                warn!(zone_id, "no recent live vegetation data, drawing synthetic snapshot");
                Ok::<_, Infallible>(self.synthesize(zone_id, now))
            })
            .await;

        match drawn {
            Ok((entry, _)) => entry.value,
            Err(never) => match never {},
        }
    }

    async fn fetch_live(
        &self,
        source: &dyn SceneSource,
        zone_id: &str,
        polygon: &GeoPolygon,
        now: DateTime<Utc>,
    ) -> Result<VegetationSnapshot> {
        let scene = timeout(self.settings.request_timeout(), source.fetch_scene(zone_id, polygon))
            .await
            .map_err(|_| anyhow!("scene request timed out"))??;
        snapshot_from_scene(zone_id, &scene, now)
    }

    fn synthesize(&self, zone_id: &str, now: DateTime<Utc>) -> VegetationSnapshot {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let ndvi = rng.gen_range(0.3..0.8);
        let ndwi = rng.gen_range(-0.1..0.3);
        let evi = 0.8 * ndvi;
        let soil_moisture = rng.gen_range(SYNTHETIC_SOIL_MOISTURE);
        let soil_temp = 25.0 - rng.gen_range(2.0..5.0);
        let et = rng.gen_range(2.0..5.0);
        let stress = round2(rng.gen_range(0.1..0.4));

        VegetationSnapshot {
            zone_id: zone_id.to_string(),
            ndvi: spread(ndvi, 0.1, 0.0, 1.0, round2),
            ndwi: spread(ndwi, 0.1, -1.0, 1.0, round2),
            evi: spread(evi, 0.1, 0.0, 1.0, round2),
            soil_moisture: Some(spread(soil_moisture, 5.0, 0.0, 100.0, round1)),
            land_surface_temp: Some(spread(soil_temp, 2.0, f64::NEG_INFINITY, f64::INFINITY, round1)),
            evapotranspiration: round2(et),
            water_stress: WaterStress::from_index(stress),
            timestamp: now,
            status: VegetationStatus::Synthetic,
        }
    }
}

fn spread(mean: f64, half_width: f64, floor: f64, ceil: f64, round: fn(f64) -> f64) -> IndexStats {
    IndexStats {
        mean: round(mean),
        min: round((mean - half_width).max(floor)),
        max: round((mean + half_width).min(ceil)),
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
