//! The irrigation decision rule.
//!
//! Irrigate when there is a moisture deficit, rain is not likely, and the
//! rain expected over the next three days does not cover the deficit. A
//! positive decision yields a single watering slot at 06:00 UTC the next day.

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Provenance, VegetationStatus};

/// Target used when a zone has no moisture thresholds configured, percent.
pub const DEFAULT_TARGET_MOISTURE: f64 = 30.0;

/// Irrigation is deferred at or above this rain probability, percent.
pub const RAIN_PROBABILITY_LIMIT: f64 = 60.0;

/// Forecast days whose precipitation counts as expected rain.
pub const EXPECTED_RAIN_DAYS: usize = 3;

/// Watering minutes per percentage point of deficit.
const MINUTES_PER_POINT: f64 = 2.0;
const MIN_DURATION_MINUTES: u32 = 5;
const START_HOUR: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrigationReason {
    IrrigationNeeded,
    MoistureAdequate,
    RainLikely,
    RainCoversDeficit,
    WeatherUnavailable,
}

impl IrrigationReason {
    pub fn explanation(&self) -> &'static str {
        match self {
            IrrigationReason::IrrigationNeeded => "Irrigation needed and no significant rain expected",
            IrrigationReason::MoistureAdequate => "Soil moisture is at or above target",
            IrrigationReason::RainLikely => "Rain is likely, irrigation deferred",
            IrrigationReason::RainCoversDeficit => "Expected rain covers the moisture deficit",
            IrrigationReason::WeatherUnavailable => {
                "Irrigation needed; no weather forecast available to rule out rain"
            }
        }
    }
}

impl std::fmt::Display for IrrigationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.explanation())
    }
}

/// Where the current soil moisture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoistureSource {
    Sensor,
    VegetationLive,
    VegetationCached,
    VegetationSynthetic,
}

impl From<VegetationStatus> for MoistureSource {
    fn from(status: VegetationStatus) -> Self {
        match status {
            VegetationStatus::Live => MoistureSource::VegetationLive,
            VegetationStatus::Cached => MoistureSource::VegetationCached,
            VegetationStatus::Synthetic => MoistureSource::VegetationSynthetic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub start_time: DateTime<Utc>,
    pub duration_minutes: u32,
    /// Moisture to restore, percentage points.
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionInputs {
    pub current_moisture: f64,
    pub moisture_source: MoistureSource,
    /// `None` when the zone has no thresholds.
    pub target_moisture: Option<f64>,
    pub rain_probability: f64,
    pub expected_rain: f64,
    pub weather_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationDecision {
    pub zone_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_moisture: f64,
    pub moisture_source: MoistureSource,
    pub target_moisture: f64,
    pub moisture_deficit: f64,
    pub expected_rain: f64,
    pub rain_probability: f64,
    pub should_irrigate: bool,
    pub schedule: Vec<ScheduleEntry>,
    pub reason: IrrigationReason,
    /// Tier that served the vegetation snapshot, when one was consulted.
    pub vegetation_status: Option<VegetationStatus>,
    /// Provenance of the forecast, `None` when no forecast was available.
    pub weather: Option<Provenance>,
}

pub fn moisture_deficit(current_moisture: f64, target_moisture: Option<f64>) -> f64 {
    (target_moisture.unwrap_or(DEFAULT_TARGET_MOISTURE) - current_moisture).max(0.0)
}

/// Apply the decision rule at `now`.
pub fn decide(zone_id: &str, inputs: &DecisionInputs, now: DateTime<Utc>) -> IrrigationDecision {
    let target = inputs.target_moisture.unwrap_or(DEFAULT_TARGET_MOISTURE);
    let deficit = moisture_deficit(inputs.current_moisture, inputs.target_moisture);

    let reason = if deficit <= 0.0 {
        IrrigationReason::MoistureAdequate
    } else if inputs.rain_probability >= RAIN_PROBABILITY_LIMIT {
        IrrigationReason::RainLikely
    } else if inputs.expected_rain >= deficit {
        IrrigationReason::RainCoversDeficit
    } else if !inputs.weather_available {
        IrrigationReason::WeatherUnavailable
    } else {
        IrrigationReason::IrrigationNeeded
    };

    let should_irrigate =
        matches!(reason, IrrigationReason::IrrigationNeeded | IrrigationReason::WeatherUnavailable);

    let schedule = if should_irrigate { vec![schedule_entry(deficit, now)] } else { Vec::new() };

    IrrigationDecision {
        zone_id: zone_id.to_string(),
        timestamp: now,
        current_moisture: inputs.current_moisture,
        moisture_source: inputs.moisture_source,
        target_moisture: target,
        moisture_deficit: deficit,
        expected_rain: inputs.expected_rain,
        rain_probability: inputs.rain_probability,
        should_irrigate,
        schedule,
        reason,
        vegetation_status: None,
        weather: None,
    }
}

fn schedule_entry(deficit: f64, now: DateTime<Utc>) -> ScheduleEntry {
    let tomorrow = now.date_naive().checked_add_days(Days::new(1)).unwrap_or(now.date_naive());
    let start = NaiveTime::from_hms_opt(START_HOUR, 0, 0).unwrap_or_default();
    let minutes = (deficit * MINUTES_PER_POINT).ceil() as u32;

    ScheduleEntry {
        start_time: tomorrow.and_time(start).and_utc(),
        duration_minutes: minutes.max(MIN_DURATION_MINUTES),
        volume: deficit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 14, 30, 0).unwrap()
    }

    fn inputs(moisture: f64, target: Option<f64>, rain_probability: f64, expected_rain: f64) -> DecisionInputs {
        DecisionInputs {
            current_moisture: moisture,
            moisture_source: MoistureSource::Sensor,
            target_moisture: target,
            rain_probability,
            expected_rain,
            weather_available: true,
        }
    }

    #[test]
    fn dry_zone_without_rain_is_irrigated() {
        let d = decide("z", &inputs(20.0, Some(30.0), 40.0, 2.0), now());

        assert!(d.should_irrigate);
        assert_eq!(d.moisture_deficit, 10.0);
        assert_eq!(d.reason, IrrigationReason::IrrigationNeeded);
        assert_eq!(d.schedule.len(), 1);

        let slot = &d.schedule[0];
        assert_eq!(slot.start_time, Utc.with_ymd_and_hms(2024, 6, 22, 6, 0, 0).unwrap());
        assert_eq!(slot.duration_minutes, 20);
        assert_eq!(slot.volume, 10.0);
    }

    #[test]
    fn moist_zone_is_never_irrigated() {
        for (probability, rain) in [(0.0, 0.0), (90.0, 50.0), (10.0, 0.0)] {
            let d = decide("z", &inputs(35.0, Some(30.0), probability, rain), now());
            assert_eq!(d.moisture_deficit, 0.0);
            assert!(!d.should_irrigate);
            assert!(d.schedule.is_empty());
            assert_eq!(d.reason, IrrigationReason::MoistureAdequate);
        }
    }

    #[test]
    fn likely_rain_defers() {
        let d = decide("z", &inputs(20.0, Some(30.0), 60.0, 0.0), now());
        assert!(!d.should_irrigate);
        assert_eq!(d.reason, IrrigationReason::RainLikely);
    }

    #[test]
    fn expected_rain_covering_deficit_defers() {
        let d = decide("z", &inputs(25.0, Some(30.0), 30.0, 5.0), now());
        assert!(!d.should_irrigate);
        assert_eq!(d.reason, IrrigationReason::RainCoversDeficit);
    }

    #[test]
    fn missing_thresholds_use_conservative_default() {
        let d = decide("z", &inputs(27.5, None, 0.0, 0.0), now());
        assert_eq!(d.target_moisture, DEFAULT_TARGET_MOISTURE);
        assert_eq!(d.moisture_deficit, 2.5);
        // 2.5 points would be 5 minutes; the floor keeps it there.
        assert_eq!(d.schedule[0].duration_minutes, 5);
    }

    #[test]
    fn irrigation_without_weather_discloses_it() {
        let mut i = inputs(10.0, Some(30.0), 0.0, 0.0);
        i.weather_available = false;
        let d = decide("z", &i, now());
        assert!(d.should_irrigate);
        assert_eq!(d.reason, IrrigationReason::WeatherUnavailable);
    }

    #[test]
    fn reasons_serialize_as_snake_case() {
        let json = serde_json::to_string(&IrrigationReason::RainCoversDeficit).unwrap();
        assert_eq!(json, "\"rain_covers_deficit\"");
        assert_eq!(MoistureSource::from(VegetationStatus::Cached), MoistureSource::VegetationCached);
    }
}
