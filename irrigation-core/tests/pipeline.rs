use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use irrigation_core::{
    CoreError, CoreResult, DeviceHealthMonitor, GeoPoint, GeoPolygon, Heartbeat, IrrigationAdvisor,
    IrrigationReason, ProviderId, VegetationProvider, WeatherAggregator, WeatherProvider, ZoneRecord,
    config::{AggregatorSettings, DeviceSettings, VegetationSettings},
    decision::MoistureSource,
    model::{DailyForecast, VegetationStatus, WeatherObservation},
    ports::{MemoryAlertSink, Severity, StaticZones, ZoneDirectory},
};

#[derive(Debug)]
struct StubWeather {
    id: ProviderId,
    rain_probability: f64,
    daily_rain: f64,
    down: bool,
}

#[async_trait]
impl WeatherProvider for StubWeather {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn fetch_current(&self, _point: GeoPoint) -> CoreResult<WeatherObservation> {
        if self.down {
            return Err(CoreError::ProviderUnavailable { provider: self.id, reason: "timeout".into() });
        }
        Ok(WeatherObservation {
            timestamp: t0(),
            temperature: 24.0,
            humidity: 45.0,
            precipitation_probability: self.rain_probability,
            precipitation: 0.0,
            wind_speed: 2.0,
            pressure: 1012.0,
            cloud_cover: 20.0,
            uv_index: 6.0,
            soil_moisture: None,
            solar_radiation: None,
        })
    }

    async fn fetch_forecast(&self, _point: GeoPoint, days: u32) -> CoreResult<Vec<DailyForecast>> {
        if self.down {
            return Err(CoreError::ProviderUnavailable { provider: self.id, reason: "timeout".into() });
        }
        Ok((0..days)
            .map(|i| DailyForecast {
                date: (t0() + Duration::days(i as i64)).date_naive(),
                temperature_max: 29.0,
                temperature_min: 16.0,
                precipitation: self.daily_rain,
                precipitation_probability: self.rain_probability,
                humidity: Some(50.0),
                wind_speed: Some(3.0),
                uv_index: None,
            })
            .collect())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 3, 10, 0, 0).unwrap()
}

fn orchard(target: (f64, f64)) -> ZoneRecord {
    ZoneRecord {
        zone_id: "orchard".into(),
        geometry: GeoPolygon::new(vec![
            GeoPoint::new(38.10, -1.20),
            GeoPoint::new(38.10, -1.18),
            GeoPoint::new(38.12, -1.18),
            GeoPoint::new(38.12, -1.20),
        ])
        .unwrap(),
        target_moisture_min: Some(target.0),
        target_moisture_max: Some(target.1),
        field_capacity: Some(40.0),
        wilting_point: Some(12.0),
        device_id: Some("sensor-7".into()),
    }
}

struct Rig {
    advisor: IrrigationAdvisor,
    devices: Arc<DeviceHealthMonitor>,
    alerts: Arc<MemoryAlertSink>,
}

fn rig(zone: ZoneRecord, weather: Vec<StubWeather>) -> Rig {
    let providers: Vec<Arc<dyn WeatherProvider>> =
        weather.into_iter().map(|w| Arc::new(w) as Arc<dyn WeatherProvider>).collect();
    let aggregator = WeatherAggregator::new(
        providers,
        AggregatorSettings { forecast_days: 5, ..Default::default() },
    );
    let vegetation = VegetationProvider::new(None, VegetationSettings::default()).with_seed(11);
    let alerts = Arc::new(MemoryAlertSink::new());
    let devices = Arc::new(DeviceHealthMonitor::new(DeviceSettings::default(), alerts.clone()));
    let zones: Arc<dyn ZoneDirectory> = Arc::new(StaticZones::new([zone]));

    let advisor = IrrigationAdvisor::new(zones, Arc::new(aggregator), Arc::new(vegetation))
        .with_devices(devices.clone());

    Rig { advisor, devices, alerts }
}

fn dry_weather() -> Vec<StubWeather> {
    vec![
        StubWeather { id: ProviderId::OpenMeteo, rain_probability: 40.0, daily_rain: 0.5, down: false },
        StubWeather { id: ProviderId::WeatherApi, rain_probability: 40.0, daily_rain: 0.9, down: false },
    ]
}

fn sensor_heartbeat(moisture: f64, at: DateTime<Utc>) -> Heartbeat {
    Heartbeat {
        device_id: "sensor-7".into(),
        timestamp: at,
        battery_level: Some(71.0),
        signal_strength: Some(-64),
        soil_moisture: Some(moisture),
    }
}

#[tokio::test]
async fn online_sensor_drives_irrigation() {
    let rig = rig(orchard((25.0, 35.0)), dry_weather());
    rig.devices.record_heartbeat(sensor_heartbeat(20.0, t0())).await;

    let decision = rig.advisor.advise_at("orchard", t0()).await.unwrap();

    assert_eq!(decision.moisture_source, MoistureSource::Sensor);
    assert_eq!(decision.moisture_deficit, 10.0);
    assert!(decision.should_irrigate);
    assert_eq!(decision.reason, IrrigationReason::IrrigationNeeded);
    assert_eq!(decision.schedule.len(), 1);
    // Median of 0.5 and 0.9 per day over three days.
    assert!((decision.expected_rain - 2.1).abs() < 1e-9);
    assert_eq!(decision.rain_probability, 40.0);

    let weather = decision.weather.expect("forecast provenance");
    assert_eq!(weather.provider_count(), 2);
    assert_eq!(decision.vegetation_status, Some(VegetationStatus::Synthetic));
}

#[tokio::test]
async fn offline_device_falls_back_to_vegetation_moisture() {
    let rig = rig(orchard((25.0, 35.0)), dry_weather());
    rig.devices.record_heartbeat(sensor_heartbeat(20.0, t0())).await;

    let later = t0() + Duration::minutes(16);
    let sweep = rig.devices.tick(later).await;
    assert_eq!(sweep.went_offline, vec!["sensor-7".to_string()]);
    assert_eq!(rig.alerts.alerts()[0].severity, Severity::Medium);

    let decision = rig.advisor.advise_at("orchard", later).await.unwrap();

    assert_eq!(decision.moisture_source, MoistureSource::VegetationSynthetic);
    assert!((25.0..=45.0).contains(&decision.current_moisture));
    assert_eq!(decision.moisture_deficit, (30.0 - decision.current_moisture).max(0.0));
}

#[tokio::test]
async fn recovered_device_is_used_again() {
    let rig = rig(orchard((25.0, 35.0)), dry_weather());
    rig.devices.record_heartbeat(sensor_heartbeat(20.0, t0())).await;
    rig.devices.tick(t0() + Duration::minutes(16)).await;
    rig.devices.record_heartbeat(sensor_heartbeat(33.0, t0() + Duration::minutes(17))).await;

    let decision = rig.advisor.advise_at("orchard", t0() + Duration::minutes(17)).await.unwrap();
    assert_eq!(decision.moisture_source, MoistureSource::Sensor);
    assert_eq!(decision.moisture_deficit, 0.0);
    assert_eq!(decision.reason, IrrigationReason::MoistureAdequate);
}

#[tokio::test]
async fn decision_survives_total_weather_outage() {
    let down = vec![
        StubWeather { id: ProviderId::OpenMeteo, rain_probability: 0.0, daily_rain: 0.0, down: true },
        StubWeather { id: ProviderId::OpenWeather, rain_probability: 0.0, daily_rain: 0.0, down: true },
    ];
    // Target above any synthetic moisture so a deficit always exists.
    let rig = rig(orchard((85.0, 95.0)), down);

    let decision = rig.advisor.advise_at("orchard", t0()).await.unwrap();

    assert!(decision.weather.is_none());
    assert_eq!(decision.expected_rain, 0.0);
    assert!(decision.should_irrigate);
    assert_eq!(decision.reason, IrrigationReason::WeatherUnavailable);
    assert_eq!(decision.moisture_source, MoistureSource::VegetationSynthetic);
}

#[tokio::test]
async fn likely_rain_defers_irrigation() {
    let wet = vec![StubWeather { id: ProviderId::OpenMeteo, rain_probability: 75.0, daily_rain: 0.0, down: false }];
    let rig = rig(orchard((25.0, 35.0)), wet);
    rig.devices.record_heartbeat(sensor_heartbeat(20.0, t0())).await;

    let decision = rig.advisor.advise_at("orchard", t0()).await.unwrap();
    assert!(!decision.should_irrigate);
    assert_eq!(decision.reason, IrrigationReason::RainLikely);
    assert!(decision.schedule.is_empty());
}

#[tokio::test]
async fn unknown_zone_is_reported() {
    let rig = rig(orchard((25.0, 35.0)), dry_weather());
    let err = rig.advisor.advise_at("vineyard", t0()).await.unwrap_err();
    assert!(matches!(err, CoreError::ZoneNotFound(id) if id == "vineyard"));
}

#[tokio::test]
async fn old_sensor_reading_is_not_reused() {
    let rig = rig(orchard((25.0, 35.0)), dry_weather());
    rig.devices.record_heartbeat(sensor_heartbeat(20.0, t0())).await;
    // Still alive, but its later heartbeats carry no reading.
    rig.devices
        .record_heartbeat(Heartbeat { soil_moisture: None, ..sensor_heartbeat(0.0, t0() + Duration::minutes(14)) })
        .await;

    let fresh = rig.advisor.advise_at("orchard", t0() + Duration::minutes(14)).await.unwrap();
    assert_eq!(fresh.moisture_source, MoistureSource::Sensor);
    assert_eq!(fresh.current_moisture, 20.0);

    let later = rig.advisor.advise_at("orchard", t0() + Duration::minutes(20)).await.unwrap();
    assert_eq!(later.moisture_source, MoistureSource::VegetationSynthetic);
    assert!(rig.alerts.alerts().is_empty());
}
