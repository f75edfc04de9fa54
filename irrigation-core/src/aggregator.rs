//! Multi-provider weather aggregation over a zone polygon.
//!
//! Every (sample point, provider) pair is one sample. Samples run under a
//! concurrency cap with a per-call timeout; a failed or late sample is
//! dropped. Each metric is the median over the samples that succeeded.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    Config,
    cache::TtlCache,
    config::AggregatorSettings,
    error::{CoreError, CoreResult},
    model::{AggregatedForecast, CacheStatus, DailyForecast, ProviderForecast, Provenance, WeatherObservation},
    provider::{ProviderId, WeatherProvider, providers_from_config},
    spatial::{GeoPoint, GeoPolygon, sample_grid},
};

pub type ForecastCache = TtlCache<String, AggregatedForecast, CoreError>;

#[derive(Debug)]
pub struct WeatherAggregator {
    providers: Vec<Arc<dyn WeatherProvider>>,
    settings: AggregatorSettings,
    request_timeout: Duration,
    cache: Arc<ForecastCache>,
}

impl WeatherAggregator {
    pub fn new(providers: Vec<Arc<dyn WeatherProvider>>, settings: AggregatorSettings) -> Self {
        let request_timeout = settings.request_timeout();
        Self { providers, settings, request_timeout, cache: Arc::new(ForecastCache::new()) }
    }

    /// Aggregator over every configured provider.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(providers_from_config(config)?, config.aggregator.clone()))
    }

    /// Share a cache between aggregator instances.
    pub fn with_cache(mut self, cache: Arc<ForecastCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub async fn forecast(&self, polygon: &GeoPolygon) -> CoreResult<AggregatedForecast> {
        self.forecast_at(polygon, Utc::now()).await
    }

    /// Cached aggregate for `polygon`, computed on a miss. Concurrent misses
    /// for the same polygon share one computation and its outcome.
    ///
    /// When no provider answers and an expired aggregate exists, that
    /// aggregate is returned with [`CacheStatus::Stale`].
    pub async fn forecast_at(
        &self,
        polygon: &GeoPolygon,
        now: DateTime<Utc>,
    ) -> CoreResult<AggregatedForecast> {
        let key = polygon.cache_key(self.settings.key_precision);
        let ttl = self.settings.cache_ttl();

        let result = self
            .cache
            .get_or_try_insert_with(key.clone(), now, ttl, || self.collect(polygon, now))
            .await;

        match result {
            Ok((entry, status)) => {
                let mut forecast = entry.value;
                forecast.provenance.cache_status = status;
                Ok(forecast)
            }
            Err(CoreError::NoDataAvailable { attempted }) => match self.cache.get_any(&key) {
                Some(entry) => {
                    warn!(
                        key = %key,
                        age_secs = entry.age(now).as_secs(),
                        "no provider answered, serving expired forecast"
                    );
                    let mut forecast = entry.value;
                    forecast.provenance.cache_status = CacheStatus::Stale;
                    Ok(forecast)
                }
                None => Err(CoreError::NoDataAvailable { attempted }),
            },
            Err(err) => Err(err),
        }
    }

    async fn collect(&self, polygon: &GeoPolygon, now: DateTime<Utc>) -> CoreResult<AggregatedForecast> {
        let grid = sample_grid(polygon, self.settings.grid_resolution)?
            .thin(self.settings.max_sample_points);
        let days = self.settings.forecast_days;
        let request_timeout = self.request_timeout;

        let jobs: Vec<_> = grid
            .points()
            .iter()
            .flat_map(|point| {
                self.providers
                    .iter()
                    .map(move |p| fetch_sample(Arc::clone(p), *point, days, request_timeout))
            })
            .collect();
        let attempted = jobs.len();

        let samples: Vec<ProviderForecast> = stream::iter(jobs)
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .filter_map(|sample| async move { sample })
            .collect()
            .await;

        if samples.is_empty() {
            warn!(points = grid.len(), attempted, "no usable weather samples");
            return Err(CoreError::NoDataAvailable { attempted });
        }

        let mut providers: Vec<ProviderId> = samples.iter().map(|s| s.provider).collect();
        providers.sort();
        providers.dedup();

        let forecast = AggregatedForecast {
            current: combine_current(&samples),
            daily: combine_daily(&samples, days as usize),
            provenance: Provenance {
                providers,
                sample_points: grid.len(),
                attempted_samples: attempted,
                successful_samples: samples.len(),
                generated_at: now,
                cache_status: CacheStatus::Fresh,
            },
        };

        info!(
            points = grid.len(),
            successful = samples.len(),
            attempted,
            centroid_fallback = grid.is_centroid_fallback(),
            "aggregated forecast"
        );

        Ok(forecast)
    }
}

async fn fetch_sample(
    provider: Arc<dyn WeatherProvider>,
    point: GeoPoint,
    days: u32,
    request_timeout: Duration,
) -> Option<ProviderForecast> {
    let id = provider.id();
    match timeout(request_timeout, provider.fetch(point, days)).await {
        Ok(Ok(sample)) => {
            debug!(provider = %id, lat = point.lat, lon = point.lon, "weather sample");
            Some(sample)
        }
        Ok(Err(err)) => {
            warn!(provider = %id, lat = point.lat, lon = point.lon, error = %err, "sample excluded");
            None
        }
        Err(_) => {
            warn!(
                provider = %id,
                lat = point.lat,
                lon = point.lon,
                timeout_ms = request_timeout.as_millis() as u64,
                "provider call timed out"
            );
            None
        }
    }
}

/// Median of a non-empty set; `None` when `values` is empty.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn median_of<T>(items: &[&T], field: impl Fn(&T) -> f64) -> f64 {
    median(items.iter().map(|item| field(item))).unwrap_or(0.0)
}

fn median_opt<T>(items: &[&T], field: impl Fn(&T) -> Option<f64>) -> Option<f64> {
    median(items.iter().filter_map(|item| field(item)))
}

fn combine_current(samples: &[ProviderForecast]) -> WeatherObservation {
    let obs: Vec<&WeatherObservation> = samples.iter().map(|s| &s.current).collect();
    let timestamp = obs.iter().map(|o| o.timestamp).max().unwrap_or_else(Utc::now);

    WeatherObservation {
        timestamp,
        temperature: median_of(&obs, |o| o.temperature),
        humidity: median_of(&obs, |o| o.humidity),
        precipitation_probability: median_of(&obs, |o| o.precipitation_probability),
        precipitation: median_of(&obs, |o| o.precipitation),
        wind_speed: median_of(&obs, |o| o.wind_speed),
        pressure: median_of(&obs, |o| o.pressure),
        cloud_cover: median_of(&obs, |o| o.cloud_cover),
        uv_index: median_of(&obs, |o| o.uv_index),
        soil_moisture: median_opt(&obs, |o| o.soil_moisture),
        solar_radiation: median_opt(&obs, |o| o.solar_radiation),
    }
}

/// Days are aligned by calendar date; each day combines whichever samples
/// cover it.
fn combine_daily(samples: &[ProviderForecast], days: usize) -> Vec<DailyForecast> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&DailyForecast>> = BTreeMap::new();
    for day in samples.iter().flat_map(|s| s.daily.iter()) {
        by_date.entry(day.date).or_default().push(day);
    }

    by_date
        .into_iter()
        .take(days)
        .map(|(date, entries)| DailyForecast {
            date,
            temperature_max: median_of(&entries, |d| d.temperature_max),
            temperature_min: median_of(&entries, |d| d.temperature_min),
            precipitation: median_of(&entries, |d| d.precipitation),
            precipitation_probability: median_of(&entries, |d| d.precipitation_probability),
            humidity: median_opt(&entries, |d| d.humidity),
            wind_speed: median_opt(&entries, |d| d.wind_speed),
            uv_index: median_opt(&entries, |d| d.uv_index),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FixedProvider {
        id: ProviderId,
        temperature: f64,
        rain: f64,
        delay: Option<Duration>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(id: ProviderId, temperature: f64, rain: f64) -> Self {
            Self { id, temperature, rain, delay: None, fail: false, calls: AtomicUsize::new(0) }
        }

        fn failing(id: ProviderId) -> Self {
            Self { fail: true, ..Self::new(id, 0.0, 0.0) }
        }

        fn slow(id: ProviderId, delay: Duration) -> Self {
            Self { delay: Some(delay), ..Self::new(id, 0.0, 0.0) }
        }

        fn slow_failing(id: ProviderId, delay: Duration) -> Self {
            Self { fail: true, ..Self::slow(id, delay) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherProvider for FixedProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch_current(&self, _point: GeoPoint) -> CoreResult<WeatherObservation> {
            unreachable!("aggregator uses fetch")
        }

        async fn fetch_forecast(&self, _point: GeoPoint, _days: u32) -> CoreResult<Vec<DailyForecast>> {
            unreachable!("aggregator uses fetch")
        }

        async fn fetch(&self, _point: GeoPoint, days: u32) -> CoreResult<ProviderForecast> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(CoreError::unavailable(self.id, "status 503"));
            }
            let now = now();
            Ok(ProviderForecast {
                provider: self.id,
                current: WeatherObservation {
                    timestamp: now,
                    temperature: self.temperature,
                    humidity: 50.0,
                    precipitation_probability: 20.0,
                    precipitation: 0.0,
                    wind_speed: 2.0,
                    pressure: 1013.0,
                    cloud_cover: 10.0,
                    uv_index: 5.0,
                    soil_moisture: None,
                    solar_radiation: Some(15.0),
                },
                daily: (0..days)
                    .map(|i| DailyForecast {
                        date: (now + ChronoDuration::days(i as i64)).date_naive(),
                        temperature_max: self.temperature + 5.0,
                        temperature_min: self.temperature - 5.0,
                        precipitation: self.rain,
                        precipitation_probability: 30.0,
                        humidity: None,
                        wind_speed: None,
                        uv_index: None,
                    })
                    .collect(),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap()
    }

    /// Too small for the 0.01° lattice: a single centroid sample.
    fn tiny_field() -> GeoPolygon {
        GeoPolygon::new(vec![
            GeoPoint::new(40.0001, -3.0001),
            GeoPoint::new(40.0002, -3.0009),
            GeoPoint::new(40.0009, -3.0002),
        ])
        .unwrap()
    }

    fn field() -> GeoPolygon {
        GeoPolygon::new(vec![
            GeoPoint::new(40.0, -3.0),
            GeoPoint::new(40.0, -2.97),
            GeoPoint::new(40.03, -2.97),
            GeoPoint::new(40.03, -3.0),
        ])
        .unwrap()
    }

    fn aggregator(providers: Vec<Arc<dyn WeatherProvider>>) -> WeatherAggregator {
        WeatherAggregator::new(providers, AggregatorSettings { forecast_days: 3, ..Default::default() })
    }

    #[test]
    fn median_of_odd_and_even_sets() {
        assert_eq!(median([3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median([4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median([1.0, 1.0, 100.0]), Some(1.0));
        assert_eq!(median(Vec::<f64>::new()), None);
    }

    #[tokio::test]
    async fn combined_metrics_stay_within_provider_range() {
        let temps = [12.0, 18.5, 31.0];
        let providers: Vec<Arc<dyn WeatherProvider>> = vec![
            Arc::new(FixedProvider::new(ProviderId::OpenWeather, temps[0], 1.0)),
            Arc::new(FixedProvider::new(ProviderId::WeatherApi, temps[1], 4.0)),
            Arc::new(FixedProvider::new(ProviderId::OpenMeteo, temps[2], 9.0)),
        ];

        let forecast = aggregator(providers).forecast_at(&field(), now()).await.unwrap();

        assert!(forecast.current.temperature >= 12.0 && forecast.current.temperature <= 31.0);
        assert_eq!(forecast.current.temperature, 18.5);
        assert_eq!(forecast.daily.len(), 3);
        assert_eq!(forecast.daily[0].precipitation, 4.0);
        assert_eq!(forecast.provenance.provider_count(), 3);
        assert!(forecast.provenance.sample_points > 1);
        assert_eq!(
            forecast.provenance.successful_samples,
            forecast.provenance.sample_points * 3
        );
        assert_eq!(forecast.provenance.cache_status, CacheStatus::Fresh);
    }

    #[tokio::test]
    async fn failed_provider_is_excluded_not_defaulted() {
        let providers: Vec<Arc<dyn WeatherProvider>> = vec![
            Arc::new(FixedProvider::new(ProviderId::OpenMeteo, 22.0, 0.0)),
            Arc::new(FixedProvider::failing(ProviderId::OpenWeather)),
        ];

        let forecast = aggregator(providers).forecast_at(&tiny_field(), now()).await.unwrap();

        assert_eq!(forecast.current.temperature, 22.0);
        assert_eq!(forecast.provenance.providers, vec![ProviderId::OpenMeteo]);
        assert_eq!(forecast.provenance.attempted_samples, 2);
        assert_eq!(forecast.provenance.successful_samples, 1);
    }

    #[tokio::test]
    async fn timed_out_provider_is_excluded() {
        let providers: Vec<Arc<dyn WeatherProvider>> = vec![
            Arc::new(FixedProvider::new(ProviderId::OpenMeteo, 22.0, 0.0)),
            Arc::new(FixedProvider::slow(ProviderId::WeatherApi, Duration::from_secs(5))),
        ];

        let forecast = aggregator(providers)
            .with_request_timeout(Duration::from_millis(50))
            .forecast_at(&tiny_field(), now())
            .await
            .unwrap();

        assert_eq!(forecast.provenance.providers, vec![ProviderId::OpenMeteo]);
    }

    #[tokio::test]
    async fn all_failures_is_no_data_available() {
        let providers: Vec<Arc<dyn WeatherProvider>> = vec![
            Arc::new(FixedProvider::failing(ProviderId::OpenMeteo)),
            Arc::new(FixedProvider::failing(ProviderId::WeatherApi)),
        ];

        let err = aggregator(providers).forecast_at(&tiny_field(), now()).await.unwrap_err();
        assert!(matches!(err, CoreError::NoDataAvailable { attempted: 2 }));
    }

    #[tokio::test]
    async fn second_request_within_ttl_is_cached() {
        let provider = Arc::new(FixedProvider::new(ProviderId::OpenMeteo, 20.0, 0.0));
        let agg = aggregator(vec![provider.clone() as Arc<dyn WeatherProvider>]);

        agg.forecast_at(&tiny_field(), now()).await.unwrap();
        let again = agg.forecast_at(&tiny_field(), now() + ChronoDuration::minutes(29)).await.unwrap();
        assert_eq!(again.provenance.cache_status, CacheStatus::Cached);
        assert_eq!(provider.calls(), 1);

        let expired = agg.forecast_at(&tiny_field(), now() + ChronoDuration::minutes(31)).await.unwrap();
        assert_eq!(expired.provenance.cache_status, CacheStatus::Fresh);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn expired_forecast_is_served_stale_when_providers_fail() {
        let cache = Arc::new(ForecastCache::new());
        let up = aggregator(vec![Arc::new(FixedProvider::new(ProviderId::OpenMeteo, 20.0, 0.0))])
            .with_cache(Arc::clone(&cache));
        up.forecast_at(&tiny_field(), now()).await.unwrap();

        let down = aggregator(vec![Arc::new(FixedProvider::failing(ProviderId::OpenMeteo))])
            .with_cache(cache);
        let stale = down.forecast_at(&tiny_field(), now() + ChronoDuration::hours(2)).await.unwrap();

        assert_eq!(stale.provenance.cache_status, CacheStatus::Stale);
        assert_eq!(stale.provenance.generated_at, now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_fetch_sequence() {
        let provider = Arc::new(FixedProvider::slow(ProviderId::OpenMeteo, Duration::from_millis(100)));
        let agg = Arc::new(aggregator(vec![provider.clone() as Arc<dyn WeatherProvider>]));
        let polygon = tiny_field();

        let requests = (0..10).map(|_| {
            let agg = Arc::clone(&agg);
            let polygon = polygon.clone();
            tokio::spawn(async move { agg.forecast_at(&polygon, now()).await })
        });

        let results = futures::future::join_all(requests).await;
        assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_failed_fetch() {
        let provider = Arc::new(FixedProvider::slow_failing(ProviderId::OpenMeteo, Duration::from_millis(100)));
        let agg = Arc::new(aggregator(vec![provider.clone() as Arc<dyn WeatherProvider>]));
        let polygon = tiny_field();
        let started = std::time::Instant::now();

        let requests = (0..10).map(|_| {
            let agg = Arc::clone(&agg);
            let polygon = polygon.clone();
            tokio::spawn(async move { agg.forecast_at(&polygon, now()).await })
        });

        let results = futures::future::join_all(requests).await;
        for result in results {
            assert!(matches!(result.unwrap(), Err(CoreError::NoDataAvailable { attempted: 1 })));
        }
        assert_eq!(provider.calls(), 1);
        assert!(started.elapsed() < Duration::from_millis(900));
    }
}
