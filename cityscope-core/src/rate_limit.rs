//! Per-provider call budgets.
//!
//! Each provider gets a sliding window: at most `max_calls` admissions in
//! any span of `window`. Time comes from a governor clock so tests can drive
//! it with `FakeRelativeClock`.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use dashmap::DashMap;
use governor::clock::{Clock as GovernorClock, DefaultClock, Reference};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::RateLimitExceeded, model::ProviderKind};

/// `max_calls` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuota {
    pub max_calls: u32,
    pub window: Duration,
}

impl RateQuota {
    pub fn new(max_calls: u32, window: Duration) -> anyhow::Result<Self> {
        if max_calls == 0 {
            anyhow::bail!("rate quota must allow at least one call");
        }
        if window.is_zero() {
            anyhow::bail!("rate quota window must be longer than zero");
        }
        Ok(Self { max_calls, window })
    }

    pub fn per_minute(max_calls: u32) -> anyhow::Result<Self> {
        Self::new(max_calls, Duration::from_secs(60))
    }
}

/// Providers without a quota are never throttled.
pub struct RateLimiter<C: GovernorClock = DefaultClock> {
    quotas: HashMap<ProviderKind, RateQuota>,
    admitted: DashMap<ProviderKind, VecDeque<C::Instant>>,
    clock: C,
}

impl<C: GovernorClock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("quotas", &self.quotas).finish()
    }
}

impl RateLimiter<DefaultClock> {
    pub fn new(quotas: &HashMap<ProviderKind, RateQuota>) -> anyhow::Result<Self> {
        Self::with_clock(quotas, DefaultClock::default())
    }
}

impl<C> RateLimiter<C>
where
    C: GovernorClock + Send + Sync,
{
    pub fn with_clock(quotas: &HashMap<ProviderKind, RateQuota>, clock: C) -> anyhow::Result<Self> {
        let mut checked = HashMap::with_capacity(quotas.len());
        for (kind, quota) in quotas {
            checked.insert(*kind, RateQuota::new(quota.max_calls, quota.window)?);
        }
        Ok(Self { quotas: checked, admitted: DashMap::new(), clock })
    }

    /// Takes one call from the provider's budget if one is available right now.
    /// A denial carries the time until the oldest admission leaves the window.
    pub fn try_acquire(&self, provider: ProviderKind) -> Result<(), RateLimitExceeded> {
        let Some(quota) = self.quotas.get(&provider) else {
            return Ok(());
        };

        let now = self.clock.now();
        // The shard lock makes check-and-record atomic per provider.
        let mut admitted = self.admitted.entry(provider).or_default();
        while let Some(oldest) = admitted.front() {
            if Duration::from(now.duration_since(*oldest)) >= quota.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < quota.max_calls as usize {
            admitted.push_back(now);
            return Ok(());
        }

        let oldest_age = admitted
            .front()
            .map(|oldest| Duration::from(now.duration_since(*oldest)))
            .unwrap_or_default();
        let retry_after = quota.window.saturating_sub(oldest_age);
        debug!(%provider, ?retry_after, "Rate limit budget exhausted");
        Err(RateLimitExceeded { provider, retry_after })
    }

    /// Waits for a call slot, but only if one frees up within `timeout`.
    pub async fn acquire(
        &self,
        provider: ProviderKind,
        timeout: Duration,
    ) -> Result<(), RateLimitExceeded> {
        let started = tokio::time::Instant::now();
        loop {
            match self.try_acquire(provider) {
                Ok(()) => return Ok(()),
                Err(denied) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if denied.retry_after > remaining {
                        debug!(%provider, wait = ?denied.retry_after, ?remaining, "Rate limit wait exceeds budget");
                        return Err(denied);
                    }
                    tokio::time::sleep(denied.retry_after).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use governor::clock::FakeRelativeClock;

    use super::*;

    fn quotas(max_calls: u32, window: Duration) -> HashMap<ProviderKind, RateQuota> {
        HashMap::from([(ProviderKind::Traffic, RateQuota::new(max_calls, window).unwrap())])
    }

    #[test]
    fn quota_rejects_zero_calls() {
        assert!(RateQuota::new(0, Duration::from_secs(60)).is_err());
        assert!(RateQuota::new(5, Duration::ZERO).is_err());
    }

    #[test]
    fn try_acquire_denies_past_quota_until_window_advances() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(3, Duration::from_secs(60)), clock.clone()).unwrap();

        for _ in 0..3 {
            assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        }
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_err());
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_err());

        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        }
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_err());
    }

    #[test]
    fn a_full_window_never_admits_more_than_the_quota() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(3, Duration::from_secs(60)), clock.clone()).unwrap();

        let mut admitted = 0;
        for _ in 0..60 {
            while limiter.try_acquire(ProviderKind::Traffic).is_ok() {
                admitted += 1;
            }
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(admitted, 3);

        // Calls made at t=0 have left the window at t=60.
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
    }

    #[test]
    fn spread_calls_stay_within_any_sliding_window() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(2, Duration::from_secs(60)), clock.clone()).unwrap();

        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        clock.advance(Duration::from_secs(40));
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());

        clock.advance(Duration::from_secs(30));
        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        let denied = limiter.try_acquire(ProviderKind::Traffic).unwrap_err();
        assert_eq!(denied.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn denial_reports_when_the_next_slot_frees_up() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(1, Duration::from_secs(60)), clock.clone()).unwrap();

        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        clock.advance(Duration::from_secs(15));

        let denied = limiter.try_acquire(ProviderKind::Traffic).unwrap_err();
        assert_eq!(denied.provider, ProviderKind::Traffic);
        assert_eq!(denied.retry_after, Duration::from_secs(45));
    }

    #[test]
    fn unconfigured_provider_is_not_throttled() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(1, Duration::from_secs(60)), clock).unwrap();

        for _ in 0..10 {
            assert!(limiter.try_acquire(ProviderKind::Weather).is_ok());
        }
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_wait_exceeds_timeout() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::with_clock(&quotas(1, Duration::from_secs(60)), clock).unwrap();

        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        let err = limiter
            .acquire(ProviderKind::Traffic, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(err.provider, ProviderKind::Traffic);
        assert!(err.retry_after > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn acquire_waits_for_the_next_slot() {
        let limiter = RateLimiter::new(&quotas(1, Duration::from_millis(50))).unwrap();

        assert!(limiter.try_acquire(ProviderKind::Traffic).is_ok());
        limiter
            .acquire(ProviderKind::Traffic, Duration::from_secs(2))
            .await
            .expect("a slot frees up well within the timeout");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquisitions_never_exceed_quota() {
        let clock = FakeRelativeClock::default();
        let limiter =
            Arc::new(RateLimiter::with_clock(&quotas(10, Duration::from_secs(60)), clock).unwrap());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire(ProviderKind::Traffic) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
