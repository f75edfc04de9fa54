//! Agronomic formulas over weather values.
//!
//! Everything here is pure. Units: temperature °C, relative humidity %,
//! wind m/s at 2 m, radiation MJ/m²/day, pressures kPa.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{CoreError, CoreResult};
use crate::model::{DailyForecast, WeatherObservation};

/// Psychrometric constant, kPa/°C.
pub const PSYCHROMETRIC_CONSTANT: f64 = 0.067;
/// Stefan-Boltzmann constant, MJ/K⁴/m²/day.
pub const STEFAN_BOLTZMANN: f64 = 4.903e-9;
/// Reference grass albedo.
pub const ALBEDO: f64 = 0.23;
/// Fixed relative-shortwave factor applied to net longwave radiation in
/// place of the measured `1.35·Rs/Rso − 0.35` term.
pub const LONGWAVE_CLOUD_FACTOR: f64 = 0.1;
/// Default base temperature for growing degree days, °C.
pub const DEFAULT_BASE_TEMPERATURE: f64 = 10.0;
/// Upper temperature cap for growing degree days, °C.
pub const GDD_TEMPERATURE_CAP: f64 = 30.0;

const MAGNUS_A: f64 = 17.27;
const MAGNUS_B: f64 = 237.7;

const SOLAR_CONSTANT: f64 = 1367.0;
const ATMOSPHERIC_TRANSMISSION: f64 = 0.7;
const W_M2_TO_MJ_DAY: f64 = 0.0864;

/// Saturation vapour pressure `es`, kPa.
pub fn saturation_vapor_pressure(temperature: f64) -> f64 {
    0.6108 * (17.27 * temperature / (temperature + 237.3)).exp()
}

/// Actual vapour pressure `ea`, kPa.
pub fn actual_vapor_pressure(temperature: f64, humidity: f64) -> f64 {
    saturation_vapor_pressure(temperature) * humidity / 100.0
}

/// Vapour pressure deficit `es − ea`, kPa.
pub fn vapor_pressure_deficit(temperature: f64, humidity: f64) -> f64 {
    saturation_vapor_pressure(temperature) - actual_vapor_pressure(temperature, humidity)
}

/// Inputs for [`reference_evapotranspiration`]. All are required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EtoInputs {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub solar_radiation: Option<f64>,
}

/// Reference evapotranspiration ETo, mm/day, by the simplified FAO
/// Penman-Monteith equation on a daily timestep (soil heat flux G = 0).
///
/// ```text
/// ETo = [0.408 Δ (Rn − G) + γ (900 / (T + 273)) u (es − ea)] / [Δ + γ (1 + 0.34 u)]
/// ```
///
/// Clamped at zero.
pub fn reference_evapotranspiration(inputs: EtoInputs) -> CoreResult<f64> {
    let t = inputs.temperature.ok_or(CoreError::MissingInput("temperature"))?;
    let rh = inputs.humidity.ok_or(CoreError::MissingInput("humidity"))?;
    let u = inputs.wind_speed.ok_or(CoreError::MissingInput("wind_speed"))?;
    let rs = inputs.solar_radiation.ok_or(CoreError::MissingInput("solar_radiation"))?;

    let es = saturation_vapor_pressure(t);
    let ea = es * rh / 100.0;
    let delta = 4098.0 * es / (t + 237.3).powi(2);
    let gamma = PSYCHROMETRIC_CONSTANT;

    let t_kelvin = t + 273.16;
    let rns = (1.0 - ALBEDO) * rs;
    let rnl = STEFAN_BOLTZMANN * t_kelvin.powi(4) * (0.34 - 0.14 * ea.sqrt()) * LONGWAVE_CLOUD_FACTOR;
    let rn = rns - rnl;
    let g = 0.0;

    let numerator = 0.408 * delta * (rn - g) + gamma * (900.0 / (t + 273.0)) * u * (es - ea);
    let denominator = delta + gamma * (1.0 + 0.34 * u);

    Ok((numerator / denominator).max(0.0))
}

/// Growing degree days for one day, with the maximum capped at 30 °C and
/// the minimum floored at `base_temperature`.
pub fn growing_degree_days(temperature_max: f64, temperature_min: f64, base_temperature: f64) -> f64 {
    let t_max = temperature_max.min(GDD_TEMPERATURE_CAP);
    let t_min = temperature_min.max(base_temperature);
    ((t_max + t_min) / 2.0 - base_temperature).max(0.0)
}

/// Dew point by the Magnus approximation. `None` for non-positive humidity.
pub fn dew_point(temperature: f64, humidity: f64) -> Option<f64> {
    if humidity <= 0.0 {
        return None;
    }
    let gamma = MAGNUS_A * temperature / (MAGNUS_B + temperature) + (humidity / 100.0).ln();
    Some(MAGNUS_B * gamma / (MAGNUS_A - gamma))
}

// Heat index regression coefficients (Celsius form).
const HI_C: [f64; 9] = [
    -8.784695,
    1.61139411,
    2.338549,
    -0.14611605,
    -0.012308094,
    -0.016424828,
    0.002211732,
    0.00072546,
    -0.000003582,
];

/// Empirical heat stress index. `None` when either input is missing.
pub fn heat_stress_index(temperature: Option<f64>, humidity: Option<f64>) -> Option<f64> {
    let t = temperature?;
    let h = humidity?;
    Some(
        HI_C[0]
            + HI_C[1] * t
            + HI_C[2] * h
            + HI_C[3] * t * h
            + HI_C[4] * t * t
            + HI_C[5] * h * h
            + HI_C[6] * t * t * h
            + HI_C[7] * t * h * h
            + HI_C[8] * t * t * h * h,
    )
}

/// Clear-sky shortwave estimate, MJ/m²/day, for when no sensor value exists.
///
/// Zero outside 06:00–18:00 and whenever the sun is below the horizon.
pub fn estimate_solar_radiation(latitude: f64, day_of_year: u32, hour: u32) -> f64 {
    if !(6..=18).contains(&hour) {
        return 0.0;
    }

    let lat = latitude.to_radians();
    let declination = 0.409 * (2.0 * PI * day_of_year as f64 / 365.0 - 1.39).sin();
    let hour_angle = PI * (hour as f64 - 12.0) / 12.0;
    let elevation = (lat.sin() * declination.sin()
        + lat.cos() * declination.cos() * hour_angle.cos())
    .asin();

    if elevation <= 0.0 {
        return 0.0;
    }

    (SOLAR_CONSTANT * ATMOSPHERIC_TRANSMISSION * elevation.sin() * W_M2_TO_MJ_DAY).max(0.0)
}

/// [`estimate_solar_radiation`] at a given instant.
pub fn estimate_solar_radiation_at(latitude: f64, at: DateTime<Utc>) -> f64 {
    estimate_solar_radiation(latitude, at.ordinal(), at.hour())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDegreeDays {
    pub date: chrono::NaiveDate,
    pub gdd: f64,
}

/// Agronomic metrics derived from an aggregated forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgronomicSummary {
    pub vpd: f64,
    pub dew_point: Option<f64>,
    pub heat_stress_index: Option<f64>,
    pub eto: Option<f64>,
    pub solar_radiation_estimated: bool,
    pub gdd: Vec<DailyDegreeDays>,
}

/// Compute the agronomic summary for current conditions plus forecast days.
///
/// ETo falls back to the clear-sky solar estimate when the observation has
/// no radiation value; a failed ETo leaves that metric empty.
pub fn summarize(
    current: &WeatherObservation,
    daily: &[DailyForecast],
    latitude: f64,
    base_temperature: f64,
    now: DateTime<Utc>,
) -> AgronomicSummary {
    let estimated = current.solar_radiation.is_none();
    let solar = current
        .solar_radiation
        .unwrap_or_else(|| estimate_solar_radiation_at(latitude, now));

    let eto = match reference_evapotranspiration(EtoInputs {
        temperature: Some(current.temperature),
        humidity: Some(current.humidity),
        wind_speed: Some(current.wind_speed),
        solar_radiation: Some(solar),
    }) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::warn!(error = %err, "ETo not computed");
            None
        }
    };

    let gdd = daily
        .iter()
        .map(|d| DailyDegreeDays {
            date: d.date,
            gdd: growing_degree_days(d.temperature_max, d.temperature_min, base_temperature),
        })
        .collect();

    AgronomicSummary {
        vpd: vapor_pressure_deficit(current.temperature, current.humidity),
        dew_point: dew_point(current.temperature, current.humidity),
        heat_stress_index: heat_stress_index(Some(current.temperature), Some(current.humidity)),
        eto,
        solar_radiation_estimated: estimated,
        gdd,
    }
}
