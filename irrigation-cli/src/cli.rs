use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::TryFrom, fs, path::Path, path::PathBuf, sync::Arc};
use tracing::debug;

use irrigation_core::{
    Config, DeviceHealthMonitor, GeoPoint, GeoPolygon, Heartbeat, IrrigationAdvisor, ProviderId,
    VegetationProvider, WeatherAggregator,
    agronomy::{self, EtoInputs},
    ports::{LogAlertSink, StaticZones, ZoneDirectory},
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "irrigate", version, about = "Irrigation advisory CLI")]
pub struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name: openweather, weatherapi, openmeteo or offline.
        provider: String,
    },

    /// Aggregated forecast and agronomic metrics for a polygon.
    Forecast {
        /// Vertices as "lat,lon;lat,lon;lat,lon".
        #[arg(long)]
        polygon: String,

        /// Sample grid spacing in degrees.
        #[arg(long)]
        resolution: Option<f64>,

        /// Forecast days to request.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Agronomic metrics for one set of conditions.
    Metrics {
        /// Air temperature, °C.
        #[arg(long)]
        temperature: f64,

        /// Relative humidity, %.
        #[arg(long)]
        humidity: f64,

        /// Wind speed, m/s.
        #[arg(long)]
        wind: Option<f64>,

        /// Solar radiation, MJ/m²/day. Estimated from --latitude when absent.
        #[arg(long)]
        solar: Option<f64>,

        #[arg(long)]
        tmax: Option<f64>,

        #[arg(long)]
        tmin: Option<f64>,

        /// Crop base temperature for degree days, °C.
        #[arg(long)]
        base_temp: Option<f64>,

        #[arg(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
    },

    /// Irrigation decision for one zone.
    Advise {
        /// TOML file with `[[zone]]` tables.
        #[arg(long)]
        zones: PathBuf,

        #[arg(long)]
        zone: String,

        /// TOML file with `[[heartbeat]]` tables for the zone devices.
        #[arg(long)]
        devices: Option<PathBuf>,
    },

    /// Run one device liveness sweep over recorded heartbeats.
    Sweep {
        /// TOML file with `[[heartbeat]]` tables.
        #[arg(long)]
        devices: PathBuf,

        /// Sweep time (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::Forecast { polygon, resolution, days } => forecast(&polygon, resolution, days).await,
            Command::Metrics { temperature, humidity, wind, solar, tmax, tmin, base_temp, latitude } => {
                metrics(MetricsArgs { temperature, humidity, wind, solar, tmax, tmin, base_temp, latitude })
            }
            Command::Advise { zones, zone, devices } => advise(&zones, &zone, devices.as_deref()).await,
            Command::Sweep { devices, at } => sweep(&devices, at).await,
        }
    }
}

fn configure(provider: &str) -> Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    let api_key = if id.requires_api_key() {
        let key = inquire::Password::new(&format!("API key for {id}:"))
            .without_confirmation()
            .with_display_mode(inquire::PasswordDisplayMode::Masked)
            .prompt()
            .context("Failed to read API key")?;
        if key.trim().is_empty() {
            bail!("API key for '{id}' must not be empty");
        }
        key.trim().to_string()
    } else {
        String::new()
    };

    config.upsert_provider_api_key(id, api_key);

    let current_default = config.default_provider_id().ok();
    if current_default.is_some_and(|d| d != id) {
        let make_default = inquire::Confirm::new(&format!("Make {id} the default provider?"))
            .with_default(false)
            .prompt()
            .context("Failed to read answer")?;
        if make_default {
            config.set_default_provider(id);
        }
    }

    config.save()?;
    println!("Saved {id} to {}", Config::config_file_path()?.display());
    Ok(())
}

async fn forecast(polygon: &str, resolution: Option<f64>, days: Option<u32>) -> Result<()> {
    let polygon = parse_polygon(polygon)?;
    let mut config = Config::load()?;
    if let Some(resolution) = resolution {
        config.aggregator.grid_resolution = resolution;
    }
    if let Some(days) = days {
        config.aggregator.forecast_days = days;
    }

    let aggregator = WeatherAggregator::from_config(&config)?;
    let forecast = aggregator.forecast(&polygon).await?;

    let latitude = polygon.centroid().lat;
    let summary = agronomy::summarize(
        &forecast.current,
        &forecast.daily,
        latitude,
        config.agronomy.base_temperature,
        Utc::now(),
    );

    print_json(&json!({ "forecast": forecast, "agronomy": summary }))
}

struct MetricsArgs {
    temperature: f64,
    humidity: f64,
    wind: Option<f64>,
    solar: Option<f64>,
    tmax: Option<f64>,
    tmin: Option<f64>,
    base_temp: Option<f64>,
    latitude: Option<f64>,
}

fn metrics(args: MetricsArgs) -> Result<()> {
    let solar = args
        .solar
        .or_else(|| args.latitude.map(|lat| agronomy::estimate_solar_radiation_at(lat, Utc::now())));

    let eto = agronomy::reference_evapotranspiration(EtoInputs {
        temperature: Some(args.temperature),
        humidity: Some(args.humidity),
        wind_speed: args.wind,
        solar_radiation: solar,
    });

    let base = args.base_temp.unwrap_or(agronomy::DEFAULT_BASE_TEMPERATURE);
    let gdd = match (args.tmax, args.tmin) {
        (Some(tmax), Some(tmin)) => Some(agronomy::growing_degree_days(tmax, tmin, base)),
        _ => None,
    };

    print_json(&json!({
        "vpd": agronomy::vapor_pressure_deficit(args.temperature, args.humidity),
        "dew_point": agronomy::dew_point(args.temperature, args.humidity),
        "heat_stress_index": agronomy::heat_stress_index(Some(args.temperature), Some(args.humidity)),
        "eto": eto.as_ref().ok(),
        "eto_error": eto.as_ref().err().map(|e| e.to_string()),
        "solar_radiation": solar,
        "gdd": gdd,
    }))
}

async fn advise(zones_path: &Path, zone_id: &str, devices_path: Option<&Path>) -> Result<()> {
    let config = Config::load()?;

    let contents = fs::read_to_string(zones_path)
        .with_context(|| format!("Failed to read zone file: {}", zones_path.display()))?;
    let zones = StaticZones::from_toml_str(&contents)
        .with_context(|| format!("Failed to parse zone file: {}", zones_path.display()))?;
    let zones: Arc<dyn ZoneDirectory> = Arc::new(zones);

    let aggregator = Arc::new(WeatherAggregator::from_config(&config)?);
    let vegetation = Arc::new(VegetationProvider::from_config(&config));
    let mut advisor = IrrigationAdvisor::new(zones, aggregator, vegetation);

    if let Some(path) = devices_path {
        let monitor = Arc::new(DeviceHealthMonitor::new(config.devices.clone(), Arc::new(LogAlertSink)));
        let heartbeats = load_heartbeats(path)?;
        debug!(count = heartbeats.len(), "replaying heartbeats");
        for hb in heartbeats {
            monitor.record_heartbeat(hb).await;
        }
        monitor.tick(Utc::now()).await;
        advisor = advisor.with_devices(monitor);
    }

    let decision = advisor.advise(zone_id).await?;
    print_json(&decision)
}

async fn sweep(devices_path: &Path, at: Option<DateTime<Utc>>) -> Result<()> {
    let config = Config::load()?;
    let monitor = DeviceHealthMonitor::new(config.devices.clone(), Arc::new(LogAlertSink));

    for hb in load_heartbeats(devices_path)? {
        monitor.record_heartbeat(hb).await;
    }

    let report = monitor.tick(at.unwrap_or_else(Utc::now)).await;
    let records = monitor.snapshot().await;
    print_json(&json!({ "report": report, "devices": records }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatFile {
    #[serde(default, rename = "heartbeat")]
    heartbeats: Vec<Heartbeat>,
}

/// Timestamps are quoted RFC 3339 strings.
fn load_heartbeats(path: &Path) -> Result<Vec<Heartbeat>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read device file: {}", path.display()))?;
    let file: HeartbeatFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse device file: {}", path.display()))?;
    Ok(file.heartbeats)
}

/// Parse "lat,lon;lat,lon;..." into a polygon.
fn parse_polygon(s: &str) -> Result<GeoPolygon> {
    let vertices = s
        .split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|vertex| {
            let (lat, lon) = vertex
                .split_once(',')
                .ok_or_else(|| anyhow!("Vertex '{vertex}' is not in 'lat,lon' form"))?;
            let lat: f64 = lat.trim().parse().with_context(|| format!("Invalid latitude in '{vertex}'"))?;
            let lon: f64 = lon.trim().parse().with_context(|| format!("Invalid longitude in '{vertex}'"))?;
            Ok(GeoPoint::new(lat, lon))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GeoPolygon::new(vertices)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_polygon_argument() {
        let polygon = parse_polygon("40.0,-3.0; 40.0,-2.99; 40.01,-2.99;").unwrap();
        assert_eq!(polygon.vertices().len(), 3);
        assert_eq!(polygon.vertices()[1], GeoPoint::new(40.0, -2.99));
    }

    #[test]
    fn rejects_malformed_vertices() {
        assert!(parse_polygon("40.0;-3.0").is_err());
        assert!(parse_polygon("40.0,x;1,1;2,2").is_err());
        assert!(parse_polygon("0,0;1,1").unwrap_err().to_string().contains("polygon"));
    }

    #[test]
    fn heartbeat_file_with_quoted_timestamps() {
        let file: HeartbeatFile = toml::from_str(
            r#"
            [[heartbeat]]
            device_id = "sensor-1"
            timestamp = "2024-06-21T06:00:00Z"
            signal_strength = -72
            soil_moisture = 24.5
            "#,
        )
        .unwrap();
        assert_eq!(file.heartbeats.len(), 1);
        assert_eq!(file.heartbeats[0].signal_strength, Some(-72));
        assert_eq!(file.heartbeats[0].battery_level, None);
    }

    #[test]
    fn cli_parses_advise() {
        let cli = Cli::try_parse_from([
            "irrigate", "advise", "--zones", "zones.toml", "--zone", "orchard", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Advise { ref zone, .. } if zone == "orchard"));
    }
}
