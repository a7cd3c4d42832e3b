//! Periodic refresh of the monitored cities.

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{aggregator::Aggregator, error::ResolutionError, model::Snapshot};

/// Latest snapshot per city id.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    latest: DashMap<String, Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the city's snapshot unless the stored one was generated later.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        match self.latest.entry(snapshot.city.id.clone()) {
            Entry::Occupied(mut current) => {
                if current.get().generated_at <= snapshot.generated_at {
                    current.insert(snapshot.clone());
                }
                current.get().clone()
            }
            Entry::Vacant(slot) => {
                slot.insert(snapshot.clone());
                snapshot
            }
        }
    }

    pub fn latest(&self, city_id: &str) -> Option<Arc<Snapshot>> {
        self.latest.get(city_id).map(|s| Arc::clone(s.value()))
    }

    pub fn city_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.latest.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Ids of the cities whose snapshot was republished, sorted.
    pub refreshed: Vec<String>,
    /// Requested names that could not be resolved.
    pub failed: Vec<(String, ResolutionError)>,
}

/// Refreshes every named city concurrently and publishes the results.
pub async fn refresh_all(
    aggregator: &Arc<Aggregator>,
    names: &[String],
    store: &SnapshotStore,
) -> RefreshReport {
    let mut tasks = JoinSet::new();
    for name in names {
        let aggregator = Arc::clone(aggregator);
        let name = name.clone();
        tasks.spawn(async move {
            let result = aggregator.get_snapshot(&name).await;
            (name, result)
        });
    }

    let mut report = RefreshReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(snapshot))) => {
                report.refreshed.push(snapshot.city.id.clone());
                store.publish(snapshot);
            }
            Ok((name, Err(e))) => {
                warn!(city = %name, error = %e, "Skipping city");
                report.failed.push((name, e));
            }
            Err(e) => error!(error = %e, "Refresh task panicked"),
        }
    }

    report.refreshed.sort();
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));
    report
}

/// Refreshes `names` every `period` until `shutdown` completes.
///
/// The first cycle starts immediately. A cycle in progress is finished before
/// shutdown is observed.
pub async fn run<F>(
    aggregator: Arc<Aggregator>,
    names: Vec<String>,
    period: Duration,
    store: &SnapshotStore,
    shutdown: F,
    mut on_cycle: impl FnMut(&RefreshReport),
) where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(cities = names.len(), ?period, "Starting refresher");
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = refresh_all(&aggregator, &names, store).await;
                info!(
                    refreshed = report.refreshed.len(),
                    failed = report.failed.len(),
                    "Refresh cycle complete"
                );
                on_cycle(&report);
            }
        }
    }
    info!("Refresher stopped");
}
