//! Zone-level orchestration: weather, vegetation and device readings in,
//! one irrigation decision out.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    aggregator::WeatherAggregator,
    decision::{DecisionInputs, EXPECTED_RAIN_DAYS, IrrigationDecision, MoistureSource, decide},
    device::DeviceHealthMonitor,
    error::{CoreError, CoreResult},
    model::{AggregatedForecast, VegetationSnapshot, ZoneRecord},
    ports::ZoneDirectory,
    vegetation::VegetationProvider,
};

#[derive(Debug)]
pub struct IrrigationAdvisor {
    zones: Arc<dyn ZoneDirectory>,
    weather: Arc<WeatherAggregator>,
    vegetation: Arc<VegetationProvider>,
    devices: Option<Arc<DeviceHealthMonitor>>,
}

impl IrrigationAdvisor {
    pub fn new(
        zones: Arc<dyn ZoneDirectory>,
        weather: Arc<WeatherAggregator>,
        vegetation: Arc<VegetationProvider>,
    ) -> Self {
        Self { zones, weather, vegetation, devices: None }
    }

    /// Use direct soil readings from Online devices.
    pub fn with_devices(mut self, devices: Arc<DeviceHealthMonitor>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub async fn advise(&self, zone_id: &str) -> CoreResult<IrrigationDecision> {
        self.advise_at(zone_id, Utc::now()).await
    }

    /// Decision for `zone_id` at `now`. Fails only for an unknown zone;
    /// missing weather or device data degrades to the next source.
    pub async fn advise_at(&self, zone_id: &str, now: DateTime<Utc>) -> CoreResult<IrrigationDecision> {
        let zone = self
            .zones
            .zone(zone_id)
            .await
            .ok_or_else(|| CoreError::ZoneNotFound(zone_id.to_string()))?;

        let (forecast, snapshot) = tokio::join!(
            self.weather.forecast_at(&zone.geometry, now),
            self.vegetation.snapshot_at(zone_id, &zone.geometry, now),
        );

        let forecast = match forecast {
            Ok(forecast) => Some(forecast),
            Err(err) => {
                warn!(zone_id, error = %err, "deciding without a weather forecast");
                None
            }
        };

        let (current_moisture, moisture_source) = self.current_moisture(&zone, &snapshot, now).await;

        let inputs = DecisionInputs {
            current_moisture,
            moisture_source,
            target_moisture: zone.target_moisture(),
            rain_probability: forecast.as_ref().map_or(0.0, |f| f.current.precipitation_probability),
            expected_rain: forecast.as_ref().map_or(0.0, |f| f.expected_rain(EXPECTED_RAIN_DAYS)),
            weather_available: forecast.is_some(),
        };

        let mut decision = decide(zone_id, &inputs, now);
        decision.vegetation_status = Some(snapshot.status);
        decision.weather = forecast.map(|f: AggregatedForecast| f.provenance);

        info!(
            zone_id,
            should_irrigate = decision.should_irrigate,
            deficit = decision.moisture_deficit,
            reason = ?decision.reason,
            vegetation_degraded = snapshot.status.is_degraded(),
            "irrigation decision"
        );

        Ok(decision)
    }

    /// The Online device's recent reading, else the snapshot's mean, else
    /// the synthetic estimate.
    async fn current_moisture(
        &self,
        zone: &ZoneRecord,
        snapshot: &VegetationSnapshot,
        now: DateTime<Utc>,
    ) -> (f64, MoistureSource) {
        if let (Some(devices), Some(device_id)) = (&self.devices, &zone.device_id) {
            match devices.require_online(device_id).await {
                Ok(record) => {
                    let max_age = devices.settings().offline_after();
                    if let Some(moisture) = record.recent_soil_moisture(now, max_age) {
                        return (moisture, MoistureSource::Sensor);
                    }
                    debug!(zone_id = %zone.zone_id, device_id = %device_id, "no recent sensor reading");
                }
                Err(err) => warn!(zone_id = %zone.zone_id, error = %err, "using vegetation soil moisture"),
            }
        }

        match snapshot.soil_moisture {
            Some(stats) => (stats.mean, snapshot.status.into()),
            None => {
                let moisture = self.vegetation.synthetic_soil_moisture(&zone.zone_id, now).await;
                (moisture, MoistureSource::VegetationSynthetic)
            }
        }
    }
}
