//! Last-known-good provider records with per-provider freshness.
//!
//! Uses `DashMap` so concurrent aggregation cycles only contend on the shard
//! that holds the key they touch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

use crate::{
    clock::{SharedClock, to_time_delta},
    model::{ProviderKind, ProviderRecord},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    city_id: String,
    provider: ProviderKind,
}

impl CacheKey {
    fn new(city_id: &str, provider: ProviderKind) -> Self {
        Self { city_id: city_id.to_owned(), provider }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: ProviderRecord,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(record: ProviderRecord, ttl: Duration) -> Self {
        let expires_at = record
            .fetched_at
            .checked_add_signed(to_time_delta(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { record, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The cached record was fetched later than the one offered.
    RejectedOlder,
}

#[derive(Debug)]
pub struct FreshnessCache {
    entries: DashMap<CacheKey, CacheEntry>,
    clock: SharedClock,
}

impl FreshnessCache {
    pub fn new(clock: SharedClock) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    /// Cached record with `is_stale` recomputed against the current time.
    pub fn get(&self, city_id: &str, provider: ProviderKind) -> Option<ProviderRecord> {
        let entry = self.entries.get(&CacheKey::new(city_id, provider))?;
        let mut record = entry.record.clone();
        record.is_stale = entry.is_expired(self.clock.now());
        Some(record)
    }

    /// Stores `record` unless a record with a later `fetched_at` is already cached.
    /// The comparison and the write happen under the same shard lock.
    pub fn put(
        &self,
        city_id: &str,
        provider: ProviderKind,
        record: ProviderRecord,
        ttl: Duration,
    ) -> PutOutcome {
        match self.entries.entry(CacheKey::new(city_id, provider)) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().record.fetched_at;
                if record.fetched_at < current {
                    debug!(
                        city = city_id,
                        %provider,
                        offered = %record.fetched_at,
                        cached = %current,
                        "Rejected cache write older than cached record"
                    );
                    return PutOutcome::RejectedOlder;
                }
                slot.insert(CacheEntry::new(record, ttl));
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(record, ttl));
            }
        }
        PutOutcome::Stored
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;
    use crate::{
        clock::ManualClock,
        model::{AirQualityRecord, AqiCategory, PollutantUnit, RecordData},
    };

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn aqi_record(aqi: u16, fetched_at: DateTime<Utc>) -> ProviderRecord {
        ProviderRecord::fresh(
            "waqi",
            fetched_at,
            RecordData::AirQuality(AirQualityRecord {
                aqi,
                category: AqiCategory::from_aqi(aqi),
                dominant_pollutant: None,
                pollutants: Default::default(),
                pollutant_unit: PollutantUnit::AqiSubIndex,
                station: None,
                observed_at: None,
            }),
        )
    }

    fn aqi_of(record: &ProviderRecord) -> u16 {
        match &record.data {
            RecordData::AirQuality(air) => air.aqi,
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn get_marks_records_stale_after_ttl() {
        let clock = ManualClock::new(start());
        let cache = FreshnessCache::new(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(300);

        cache.put("delhi", ProviderKind::AirQuality, aqi_record(250, start()), ttl);

        clock.advance(Duration::from_secs(300));
        let record = cache.get("delhi", ProviderKind::AirQuality).unwrap();
        assert!(!record.is_stale, "expiry instant itself is still fresh");

        clock.advance(Duration::from_secs(1));
        let record = cache.get("delhi", ProviderKind::AirQuality).unwrap();
        assert!(record.is_stale);
        assert_eq!(aqi_of(&record), 250);
    }

    #[test]
    fn get_misses_other_keys() {
        let cache = FreshnessCache::new(Arc::new(ManualClock::new(start())));
        cache.put("delhi", ProviderKind::AirQuality, aqi_record(90, start()), Duration::from_secs(60));

        assert!(cache.get("delhi", ProviderKind::Weather).is_none());
        assert!(cache.get("mumbai", ProviderKind::AirQuality).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn older_write_is_rejected() {
        let cache = FreshnessCache::new(Arc::new(ManualClock::new(start())));
        let ttl = Duration::from_secs(300);
        let newer = start() + TimeDelta::seconds(10);

        assert_eq!(
            cache.put("delhi", ProviderKind::AirQuality, aqi_record(120, newer), ttl),
            PutOutcome::Stored
        );
        assert_eq!(
            cache.put("delhi", ProviderKind::AirQuality, aqi_record(80, start()), ttl),
            PutOutcome::RejectedOlder
        );

        let record = cache.get("delhi", ProviderKind::AirQuality).unwrap();
        assert_eq!(aqi_of(&record), 120);
        assert_eq!(record.fetched_at, newer);
    }

    #[test]
    fn equal_timestamp_overwrites() {
        let cache = FreshnessCache::new(Arc::new(ManualClock::new(start())));
        let ttl = Duration::from_secs(300);

        cache.put("delhi", ProviderKind::AirQuality, aqi_record(120, start()), ttl);
        let outcome = cache.put("delhi", ProviderKind::AirQuality, aqi_record(121, start()), ttl);

        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(aqi_of(&cache.get("delhi", ProviderKind::AirQuality).unwrap()), 121);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_keep_latest_fetch() {
        let cache = Arc::new(FreshnessCache::new(Arc::new(ManualClock::new(start()))));
        let ttl = Duration::from_secs(300);

        // Newest first, so most writers arrive with an older timestamp.
        let mut handles = Vec::new();
        for offset in (0..64).rev() {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let at = start() + TimeDelta::seconds(offset);
                cache.put("delhi", ProviderKind::AirQuality, aqi_record(offset as u16, at), ttl);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = cache.get("delhi", ProviderKind::AirQuality).unwrap();
        assert_eq!(aqi_of(&record), 63);
        assert_eq!(record.fetched_at, start() + TimeDelta::seconds(63));
    }
}
