use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cityscope_core::{
    Aggregator, City, Clock, Completeness, FailureKind, ManualClock, ProviderAdapter, ProviderError,
    ProviderKind, ProviderPolicy, ProviderRecord, RecordData, ResolutionError, RetryPolicy,
    SharedClock,
    config::default_city_configs,
    geocode::GeocodingResolver,
    model::{
        AirQualityRecord, AqiCategory, CongestionLevel, ConditionCode, Fallback, Pollutant,
        PollutantUnit, TrafficRecord, WeatherRecord, Wind,
    },
    rate_limit::RateQuota,
};

#[derive(Debug, Clone)]
enum Behaviour {
    Healthy,
    Fail(ProviderError),
    Hang,
}

#[derive(Debug)]
struct StubProvider {
    kind: ProviderKind,
    clock: SharedClock,
    behaviour: Mutex<Behaviour>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl StubProvider {
    fn new(kind: ProviderKind, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            kind,
            clock,
            behaviour: Mutex::new(Behaviour::Healthy),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) -> RecordData {
        match self.kind {
            ProviderKind::Traffic => RecordData::Traffic(TrafficRecord {
                congestion: CongestionLevel::Moderate,
                congestion_pct: 45.0,
                average_speed_kmh: 34.5,
                incident_count: None,
                route_duration_s: 261.0,
                route_distance_m: 2500.0,
                free_flow_duration_s: 180.0,
            }),
            ProviderKind::AirQuality => RecordData::AirQuality(AirQualityRecord {
                aqi: 250,
                category: AqiCategory::from_aqi(250),
                dominant_pollutant: Some(Pollutant::Pm2_5),
                pollutants: BTreeMap::from([(Pollutant::Pm2_5, 250.0), (Pollutant::Pm10, 180.0)]),
                pollutant_unit: PollutantUnit::AqiSubIndex,
                station: Some("Delhi".into()),
                observed_at: None,
            }),
            ProviderKind::Weather => RecordData::Weather(WeatherRecord {
                temperature_c: 31.5,
                feels_like_c: 34.0,
                humidity_pct: 48,
                pressure_hpa: Some(1006.0),
                wind: Wind { speed_mps: 3.1, direction_deg: Some(270.0) },
                condition: ConditionCode::Atmosphere,
                description: "haze".into(),
                observed_at: None,
            }),
        }
    }
}

#[async_trait]
impl ProviderAdapter for StubProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &'static str {
        "stub"
    }

    async fn fetch(&self, _city: &City) -> Result<ProviderRecord, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.behaviour.lock().unwrap().clone();

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match behaviour {
            Behaviour::Healthy => {
                Ok(ProviderRecord::fresh("stub", self.clock.now(), self.record()))
            }
            Behaviour::Fail(err) => Err(err),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ProviderError::Unreachable("hung".into()))
            }
        }
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    traffic: Arc<StubProvider>,
    air: Arc<StubProvider>,
    weather: Arc<StubProvider>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 5, 9, 0, 0).unwrap()));
        let shared: SharedClock = clock.clone();
        Self {
            traffic: StubProvider::new(ProviderKind::Traffic, shared.clone()),
            air: StubProvider::new(ProviderKind::AirQuality, shared.clone()),
            weather: StubProvider::new(ProviderKind::Weather, shared),
            clock,
        }
    }

    fn catalogue() -> Vec<City> {
        default_city_configs().iter().map(|c| c.to_city().unwrap()).collect()
    }

    /// Traffic TTL 120 s, air quality 300 s, weather 600 s, 2 s deadlines.
    fn aggregator(&self) -> Aggregator {
        self.aggregator_with(|builder| builder)
    }

    fn aggregator_with(
        &self,
        tweak: impl FnOnce(cityscope_core::AggregatorBuilder) -> cityscope_core::AggregatorBuilder,
    ) -> Aggregator {
        let policy = |ttl_secs| ProviderPolicy {
            ttl: Duration::from_secs(ttl_secs),
            timeout: Duration::from_secs(2),
        };
        let builder = Aggregator::builder(GeocodingResolver::new(Self::catalogue()), self.clock.clone())
            .retry(RetryPolicy { max_retries: 1, backoff: Duration::from_millis(10) })
            .provider(self.traffic.clone(), policy(120), None)
            .provider(self.air.clone(), policy(300), None)
            .provider(self.weather.clone(), policy(600), None);
        tweak(builder).build().unwrap()
    }
}

#[tokio::test]
async fn healthy_providers_give_a_full_fresh_snapshot() {
    let harness = Harness::new();
    let aggregator = harness.aggregator();

    for name in ["Delhi", "Mumbai", "Chennai"] {
        let snapshot = aggregator.get_snapshot(name).await.unwrap();

        assert_eq!(snapshot.completeness, Completeness::Full);
        assert_eq!(snapshot.records().count(), 3);
        assert!(snapshot.records().all(|r| !r.is_stale));
        assert!(snapshot.diagnostics.is_empty());
        assert_eq!(snapshot.generated_at, harness.clock.now());
    }
}

#[tokio::test]
async fn failing_provider_falls_back_to_stale_cache() {
    let harness = Harness::new();
    let aggregator = harness.aggregator();
    aggregator.get_snapshot("Kolkata").await.unwrap();

    harness.clock.advance(Duration::from_secs(400));
    harness.air.set(Behaviour::Fail(ProviderError::InvalidResponse("missing field `aqi`".into())));

    let snapshot = aggregator.get_snapshot("Kolkata").await.unwrap();

    assert_eq!(snapshot.completeness, Completeness::Partial);
    let air = snapshot.record(ProviderKind::AirQuality).unwrap();
    assert!(air.is_stale);
    assert!(!snapshot.record(ProviderKind::Traffic).unwrap().is_stale);
    assert!(!snapshot.record(ProviderKind::Weather).unwrap().is_stale);

    let diagnostic = snapshot.diagnostic(ProviderKind::AirQuality).unwrap();
    assert_eq!(diagnostic.failure, FailureKind::InvalidResponse);
    assert_eq!(diagnostic.fallback, Fallback::Cached);
    assert_eq!(snapshot.diagnostics.len(), 1);
}

#[tokio::test]
async fn failure_without_cache_leaves_the_slot_empty() {
    let harness = Harness::new();
    harness.weather.set(Behaviour::Fail(ProviderError::NotFound("city not found".into())));
    let aggregator = harness.aggregator();

    let snapshot = aggregator.get_snapshot("Pune").await.unwrap();
    assert!(snapshot.weather().is_none());
    assert_eq!(snapshot.records().count(), 2);
    assert_eq!(snapshot.completeness, Completeness::Partial);
    assert_eq!(snapshot.diagnostic(ProviderKind::Weather).unwrap().fallback, Fallback::Missing);

    harness.traffic.set(Behaviour::Fail(ProviderError::RateLimited { retry_after: None }));
    harness.air.set(Behaviour::Fail(ProviderError::Unreachable("connection refused".into())));

    let snapshot = aggregator.get_snapshot("Jaipur").await.unwrap();
    assert_eq!(snapshot.records().count(), 0);
    assert_eq!(snapshot.completeness, Completeness::Degraded);
    assert_eq!(snapshot.diagnostics.len(), 3);
}

#[tokio::test]
async fn delhi_air_quality_outage() {
    let harness = Harness::new();
    let aggregator = harness.aggregator_with(|builder| {
        let policy = ProviderPolicy { ttl: Duration::from_secs(600), timeout: Duration::from_secs(2) };
        builder.provider(harness.traffic.clone(), policy, None)
    });

    let snapshot = aggregator.get_snapshot("Delhi").await.unwrap();
    assert_eq!(snapshot.air_quality().unwrap().aqi, 250);
    assert!(!snapshot.record(ProviderKind::AirQuality).unwrap().is_stale);

    harness.air.set(Behaviour::Fail(ProviderError::Unreachable("503 Service Unavailable".into())));
    harness.clock.advance(Duration::from_secs(120));

    let snapshot = aggregator.get_snapshot("Delhi").await.unwrap();
    assert_eq!(snapshot.air_quality().unwrap().aqi, 250);
    assert!(!snapshot.record(ProviderKind::AirQuality).unwrap().is_stale);
    assert_eq!(snapshot.completeness, Completeness::Full);

    harness.clock.advance(Duration::from_secs(280));

    let snapshot = aggregator.get_snapshot("Delhi").await.unwrap();
    assert_eq!(snapshot.air_quality().unwrap().aqi, 250);
    assert!(snapshot.record(ProviderKind::AirQuality).unwrap().is_stale);
    assert_eq!(snapshot.completeness, Completeness::Partial);
    assert_eq!(
        snapshot.diagnostic(ProviderKind::AirQuality).unwrap().failure,
        FailureKind::Unreachable
    );
    // The initial fetch, then a failed attempt and its retry at t=400.
    assert_eq!(harness.air.calls(), 3);
}

#[tokio::test]
async fn rate_limited_provider_serves_cache() {
    let harness = Harness::new();
    let aggregator = harness.aggregator_with(|builder| {
        let policy = ProviderPolicy { ttl: Duration::from_secs(10), timeout: Duration::from_secs(2) };
        let quota = RateQuota::new(1, Duration::from_secs(3600)).unwrap();
        builder.provider(harness.weather.clone(), policy, Some(quota))
    });

    aggregator.get_snapshot("Lucknow").await.unwrap();
    harness.clock.advance(Duration::from_secs(20));

    let snapshot = aggregator.get_snapshot("Lucknow").await.unwrap();
    let weather = snapshot.record(ProviderKind::Weather).unwrap();
    assert!(weather.is_stale);

    let diagnostic = snapshot.diagnostic(ProviderKind::Weather).unwrap();
    assert_eq!(diagnostic.failure, FailureKind::RateLimited);
    assert_eq!(diagnostic.fallback, Fallback::Cached);
    assert!(
        diagnostic.message.starts_with("rate limited, retry after 3"),
        "{}",
        diagnostic.message
    );
    assert_eq!(harness.weather.calls(), 1);
}

#[tokio::test]
async fn repeated_snapshots_within_ttl_are_identical() {
    let harness = Harness::new();
    let aggregator = harness.aggregator();

    let first = aggregator.get_snapshot("Ahmedabad").await.unwrap();
    harness.clock.advance(Duration::from_secs(5));
    let second = aggregator.get_snapshot("Ahmedabad").await.unwrap();

    assert_eq!(first.records().collect::<Vec<_>>(), second.records().collect::<Vec<_>>());
    assert_eq!(second.completeness, Completeness::Full);
    for stub in [&harness.traffic, &harness.air, &harness.weather] {
        assert_eq!(stub.calls(), 1);
    }
}

#[tokio::test]
async fn slow_provider_times_out_without_holding_back_the_others() {
    let harness = Harness::new();
    harness.traffic.set(Behaviour::Hang);
    let aggregator = harness.aggregator_with(|builder| {
        let policy = ProviderPolicy { ttl: Duration::from_secs(120), timeout: Duration::from_millis(150) };
        builder.provider(harness.traffic.clone(), policy, None)
    });

    let started = std::time::Instant::now();
    let snapshot = aggregator.get_snapshot("Hyderabad").await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(snapshot.traffic().is_none());
    assert!(snapshot.air_quality().is_some());
    assert!(snapshot.weather().is_some());

    let diagnostic = snapshot.diagnostic(ProviderKind::Traffic).unwrap();
    assert_eq!(diagnostic.failure, FailureKind::Unreachable);
    assert_eq!(harness.traffic.calls(), 1, "no time left in the deadline for a retry");
}

#[tokio::test]
async fn fetch_pool_caps_concurrent_upstream_calls() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 5, 9, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let stub = |kind| {
        Arc::new(StubProvider {
            kind,
            clock: shared.clone(),
            behaviour: Mutex::new(Behaviour::Healthy),
            delay: Duration::from_millis(40),
            calls: AtomicUsize::new(0),
            in_flight: in_flight.clone(),
            peak: peak.clone(),
        })
    };
    let policy = ProviderPolicy { ttl: Duration::from_secs(60), timeout: Duration::from_secs(2) };

    let aggregator = Aggregator::builder(GeocodingResolver::new(Harness::catalogue()), clock)
        .provider(stub(ProviderKind::Traffic), policy, None)
        .provider(stub(ProviderKind::AirQuality), policy, None)
        .provider(stub(ProviderKind::Weather), policy, None)
        .max_concurrent_fetches(1)
        .build()
        .unwrap();

    let snapshot = aggregator.get_snapshot("Bangalore").await.unwrap();

    assert_eq!(snapshot.completeness, Completeness::Full);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolution_errors_reach_the_caller() {
    let harness = Harness::new();
    let aggregator = harness.aggregator();

    let err = aggregator.get_snapshot("Springfield").await.unwrap_err();
    assert_eq!(err, ResolutionError::UnknownCity("Springfield".into()));

    let mut cities = Harness::catalogue();
    let mut twin = cities[0].clone();
    twin.id = "delhi-cantonment".into();
    cities.push(twin);
    let aggregator = Aggregator::builder(GeocodingResolver::new(cities), harness.clock.clone())
        .build()
        .unwrap();

    let err = aggregator.get_snapshot("New Delhi").await.unwrap_err();
    assert!(matches!(err, ResolutionError::AmbiguousCity { .. }));
    for stub in [&harness.traffic, &harness.air, &harness.weather] {
        assert_eq!(stub.calls(), 0);
    }
}
