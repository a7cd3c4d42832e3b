//! Builds per-city snapshots from the three provider slots.
//!
//! Each slot is filled independently: a fresh cache entry short-circuits the
//! upstream call, otherwise the rate limiter, the shared fetch pool and the
//! provider deadline gate a fetch whose failure falls back to whatever the
//! cache still holds. Provider failures never leave this module; they become
//! [`ProviderDiagnostic`]s on the snapshot.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use reqwest::Client;
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, warn};

use crate::{
    cache::{FreshnessCache, PutOutcome},
    clock::{SharedClock, SystemClock},
    config::Config,
    error::{ProviderError, ResolutionError},
    geocode::{GeocodingResolver, OpenWeatherGeocoder},
    model::{City, Fallback, ProviderDiagnostic, ProviderKind, ProviderRecord, Snapshot},
    provider::{ProviderAdapter, adapter_from_settings},
    rate_limit::{RateLimiter, RateQuota},
};

/// Freshness and deadline for one provider slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub ttl: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1, backoff: Duration::from_millis(250) }
    }
}

#[derive(Debug)]
struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    policy: ProviderPolicy,
}

/// What one slot contributes to a snapshot.
#[derive(Debug, Default)]
struct SlotOutcome {
    record: Option<ProviderRecord>,
    diagnostic: Option<ProviderDiagnostic>,
}

pub struct AggregatorBuilder {
    resolver: GeocodingResolver,
    clock: SharedClock,
    slots: BTreeMap<ProviderKind, ProviderSlot>,
    quotas: HashMap<ProviderKind, RateQuota>,
    retry: RetryPolicy,
    rate_limit_wait: Option<Duration>,
    max_concurrent_fetches: usize,
}

impl AggregatorBuilder {
    /// Registers the adapter for its kind, replacing any earlier one.
    /// Without a quota the provider is not throttled locally.
    pub fn provider(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        policy: ProviderPolicy,
        quota: Option<RateQuota>,
    ) -> Self {
        let kind = adapter.kind();
        match quota {
            Some(quota) => self.quotas.insert(kind, quota),
            None => self.quotas.remove(&kind),
        };
        self.slots.insert(kind, ProviderSlot { adapter, policy });
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wait up to `wait` for a rate-limit slot instead of failing over at once.
    pub fn rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = (!wait.is_zero()).then_some(wait);
        self
    }

    pub fn max_concurrent_fetches(mut self, permits: usize) -> Self {
        self.max_concurrent_fetches = permits;
        self
    }

    pub fn build(self) -> anyhow::Result<Aggregator> {
        if self.max_concurrent_fetches == 0 {
            anyhow::bail!("max_concurrent_fetches must be > 0");
        }
        let limiter = RateLimiter::new(&self.quotas)?;

        Ok(Aggregator {
            resolver: self.resolver,
            cache: FreshnessCache::new(self.clock.clone()),
            clock: self.clock,
            slots: self.slots,
            limiter,
            fetch_permits: Semaphore::new(self.max_concurrent_fetches),
            retry: self.retry,
            rate_limit_wait: self.rate_limit_wait,
        })
    }
}

#[derive(Debug)]
pub struct Aggregator {
    resolver: GeocodingResolver,
    slots: BTreeMap<ProviderKind, ProviderSlot>,
    cache: FreshnessCache,
    limiter: RateLimiter,
    fetch_permits: Semaphore,
    retry: RetryPolicy,
    rate_limit_wait: Option<Duration>,
    clock: SharedClock,
}

impl Aggregator {
    pub fn builder(resolver: GeocodingResolver, clock: SharedClock) -> AggregatorBuilder {
        AggregatorBuilder {
            resolver,
            clock,
            slots: BTreeMap::new(),
            quotas: HashMap::new(),
            retry: RetryPolicy::default(),
            rate_limit_wait: None,
            max_concurrent_fetches: 8,
        }
    }

    /// Wires up every configured provider against the real HTTP backends.
    ///
    /// A provider without an API key is left out with a warning; its slot then
    /// only ever serves cached data.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let http = Client::builder()
            .user_agent(concat!("cityscope/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let env = |name: &str| std::env::var(name).ok();
        let mut resolver = GeocodingResolver::new(config.monitored_cities()?);
        if let Some(api_key) = config.geocoding_api_key(env) {
            let geocoder =
                OpenWeatherGeocoder::new(api_key, config.geocoding.base_url.clone(), http.clone());
            resolver = resolver.with_remote(Arc::new(geocoder));
        }

        let tuning = &config.aggregator;
        let mut builder = Self::builder(resolver, clock.clone())
            .retry(RetryPolicy {
                max_retries: tuning.max_retries,
                backoff: Duration::from_millis(tuning.retry_backoff_ms),
            })
            .rate_limit_wait(Duration::from_millis(tuning.rate_limit_wait_ms))
            .max_concurrent_fetches(tuning.max_concurrent_fetches);

        for kind in ProviderKind::all() {
            let settings = config.provider_settings(*kind)?;
            match adapter_from_settings(&settings, &http, clock.clone()) {
                Ok(adapter) => {
                    let policy = ProviderPolicy { ttl: settings.ttl, timeout: settings.timeout };
                    builder = builder.provider(adapter, policy, Some(settings.quota));
                }
                Err(e) => warn!(provider = %kind, error = %e, "Provider disabled"),
            }
        }

        builder.build()
    }

    pub fn resolver(&self) -> &GeocodingResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Resolves `name` and assembles its snapshot. Only resolution can fail.
    pub async fn get_snapshot(&self, name: &str) -> Result<Snapshot, ResolutionError> {
        let city = self.resolver.resolve(name).await?;
        Ok(self.snapshot_for(&city).await)
    }

    #[tracing::instrument(skip(self, city), fields(city = %city.id))]
    pub async fn snapshot_for(&self, city: &City) -> Snapshot {
        let (traffic, air_quality, weather) = tokio::join!(
            self.fill_slot(city, ProviderKind::Traffic),
            self.fill_slot(city, ProviderKind::AirQuality),
            self.fill_slot(city, ProviderKind::Weather),
        );

        let mut records = Vec::with_capacity(3);
        let mut diagnostics = Vec::new();
        for outcome in [traffic, air_quality, weather] {
            records.extend(outcome.record);
            diagnostics.extend(outcome.diagnostic);
        }

        let snapshot = Snapshot::new(city.clone(), self.clock.now(), records, diagnostics);
        debug!(completeness = ?snapshot.completeness, "Snapshot assembled");
        snapshot
    }

    async fn fill_slot(&self, city: &City, kind: ProviderKind) -> SlotOutcome {
        if let Some(record) = self.cache.get(&city.id, kind).filter(|r| !r.is_stale) {
            debug!(provider = %kind, fetched_at = %record.fetched_at, "Serving fresh cached record");
            return SlotOutcome { record: Some(record), diagnostic: None };
        }

        let Some(slot) = self.slots.get(&kind) else {
            debug!(provider = %kind, "No adapter configured");
            let err = ProviderError::Unreachable("provider not configured".into());
            return self.fall_back(city, kind, err);
        };

        match self.fetch_with_retry(city, kind, slot).await {
            Ok(record) => {
                if self.cache.put(&city.id, kind, record.clone(), slot.policy.ttl)
                    == PutOutcome::RejectedOlder
                {
                    debug!(provider = %kind, "A newer record was cached concurrently");
                }
                SlotOutcome { record: Some(record), diagnostic: None }
            }
            Err(err) => {
                warn!(provider = %kind, backend = slot.adapter.name(), error = %err, "Provider fetch failed");
                self.fall_back(city, kind, err)
            }
        }
    }

    fn fall_back(&self, city: &City, kind: ProviderKind, err: ProviderError) -> SlotOutcome {
        let record = self.cache.get(&city.id, kind);
        let fallback = if record.is_some() { Fallback::Cached } else { Fallback::Missing };

        SlotOutcome {
            record,
            diagnostic: Some(ProviderDiagnostic {
                provider: kind,
                failure: err.kind(),
                message: err.to_string(),
                fallback,
            }),
        }
    }

    async fn fetch_with_retry(
        &self,
        city: &City,
        kind: ProviderKind,
        slot: &ProviderSlot,
    ) -> Result<ProviderRecord, ProviderError> {
        let deadline = Instant::now() + slot.policy.timeout;
        let mut attempt = 0;

        loop {
            self.admit(kind, deadline).await?;

            match self.fetch_once(city, kind, slot, deadline).await {
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for(attempt);
                    if Instant::now() + backoff >= deadline {
                        debug!(provider = %kind, ?backoff, "No time left to retry");
                        return Err(err);
                    }
                    debug!(provider = %kind, attempt, ?backoff, error = %err, "Retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn admit(&self, kind: ProviderKind, deadline: Instant) -> Result<(), ProviderError> {
        match self.rate_limit_wait {
            None => self.limiter.try_acquire(kind).map_err(ProviderError::from),
            Some(wait) => {
                let budget = wait.min(deadline.saturating_duration_since(Instant::now()));
                self.limiter.acquire(kind, budget).await.map_err(ProviderError::from)
            }
        }
    }

    async fn fetch_once(
        &self,
        city: &City,
        kind: ProviderKind,
        slot: &ProviderSlot,
        deadline: Instant,
    ) -> Result<ProviderRecord, ProviderError> {
        let attempt = async {
            let _permit = self
                .fetch_permits
                .acquire()
                .await
                .map_err(|_| ProviderError::Unreachable("fetch pool closed".into()))?;
            slot.adapter.fetch(city).await
        };

        let record = tokio::time::timeout_at(deadline, attempt).await.map_err(|_| {
            ProviderError::Unreachable(format!("no response within {:?}", slot.policy.timeout))
        })??;

        if record.source_provider() != kind {
            return Err(ProviderError::InvalidResponse(format!(
                "{} returned {} data for the {kind} slot",
                slot.adapter.name(),
                record.source_provider()
            )));
        }
        Ok(record)
    }
}
