//! Periodic refresh of every known (region, category) pair.
//!
//! The scheduler runs one cycle as soon as it starts, then one per period.
//! A cycle refreshes the full cross-product of the source's regions and
//! categories, rebuilds the popular feed and optionally sweeps expired
//! entries. One pair failing never stops the others.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::orchestrator::{Orchestrator, Refreshed};
use crate::cache::SweepReport;
use crate::config::Config;
use crate::error::Error;
use crate::models::{PopularEntry, Record};
use crate::utils::{read, write};

const DEFAULT_PERIOD_HOURS: u64 = 4;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles.
    pub period: Duration,
    /// Fire cycles after the first at multiples of `period` since UTC midnight.
    pub align_to_period: bool,
    /// Sweep expired entries from every tier after each cycle.
    pub sweep_after_refresh: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(DEFAULT_PERIOD_HOURS * 3600),
            align_to_period: false,
            sweep_after_refresh: true,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            period: config.refresh_interval(),
            align_to_period: config.align_refresh,
            sweep_after_refresh: config.sweep_after_refresh,
        }
    }
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub started_at: DateTime<Utc>,
    pub pairs_attempted: usize,
    pub pairs_succeeded: usize,
    /// Records returned by the source, before past listings were dropped.
    pub records_fetched: usize,
    pub records_cached: usize,
    pub elapsed_ms: u64,
    /// One `"{region}/{category}: {error}"` line per failed pair.
    pub errors: Vec<String>,
    pub popular_count: usize,
    pub swept: Option<SweepReport>,
}

impl RefreshSummary {
    pub fn pairs_failed(&self) -> usize {
        self.pairs_attempted - self.pairs_succeeded
    }
}

/// Delay from `now` until the next multiple of `period` since UTC midnight.
/// A `now` exactly on a boundary waits a full period.
pub fn next_aligned_delay(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1);
    let since_midnight_ms = u128::from(now.num_seconds_from_midnight()) * 1000
        + u128::from((now.nanosecond() / 1_000_000).min(999));
    let remaining = period_ms - since_midnight_ms % period_ms;
    Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX))
}

pub struct Scheduler {
    orchestrator: Orchestrator,
    config: SchedulerConfig,
    last_summary: RwLock<Option<RefreshSummary>>,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            last_summary: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn last_summary(&self) -> Option<RefreshSummary> {
        read(&self.last_summary).clone()
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        read(&self.last_summary).as_ref().map(|s| s.started_at)
    }

    /// How long to wait after a cycle that finished at `now`.
    pub fn next_run_delay(&self, now: DateTime<Utc>) -> Duration {
        if self.config.align_to_period {
            next_aligned_delay(now, self.config.period)
        } else {
            self.config.period
        }
    }

    /// Refresh every (region, category) pair once.
    pub async fn run_once(&self) -> RefreshSummary {
        let store = self.orchestrator.store();
        let started_at = store.now();
        let timer = Instant::now();

        let source = self.orchestrator.source();
        let categories = source.supported_categories();
        let pairs: Vec<(String, String)> = source
            .supported_regions()
            .into_iter()
            .flat_map(|region| {
                categories
                    .iter()
                    .map(move |category| (region.clone(), category.clone()))
            })
            .collect();
        info!(pairs = pairs.len(), "Starting refresh cycle");

        // `buffered` keeps results in pair order, so the popular feed is stable
        let results: Vec<((String, String), Result<Refreshed, Error>)> = stream::iter(pairs)
            .map(|(region, category)| async move {
                let result = self.orchestrator.refresh_pair(&region, &category).await;
                ((region, category), result)
            })
            .buffered(self.orchestrator.max_concurrent())
            .collect()
            .await;

        let mut summary = RefreshSummary {
            started_at,
            pairs_attempted: results.len(),
            pairs_succeeded: 0,
            records_fetched: 0,
            records_cached: 0,
            elapsed_ms: 0,
            errors: Vec::new(),
            popular_count: 0,
            swept: None,
        };
        let mut top_records: Vec<Record> = Vec::new();
        let mut cities_crawled: Vec<String> = Vec::new();

        for ((region, category), result) in results {
            match result {
                Ok(refreshed) => {
                    summary.pairs_succeeded += 1;
                    summary.records_fetched += refreshed.fetched;
                    summary.records_cached += refreshed.entry.count();
                    if !cities_crawled.contains(&region) {
                        if let Some(top) = refreshed.entry.records().first() {
                            top_records.push(top.clone());
                            cities_crawled.push(region);
                        }
                    }
                }
                Err(e) => {
                    warn!(region = %region, category = %category, error = %e, "Refresh failed for pair");
                    summary.errors.push(format!("{}/{}: {}", region, category, e));
                }
            }
        }

        if summary.pairs_succeeded > 0 {
            let now = store.now();
            let next_crawl_at = chrono::Duration::from_std(self.next_run_delay(now))
                .ok()
                .map(|delay| now + delay);
            summary.popular_count = top_records.len();
            let popular = PopularEntry::new(top_records, cities_crawled, now, next_crawl_at);
            if let Err(e) = store.put_popular(popular) {
                warn!(error = %e, "Failed to persist popular feed");
            }
        }

        if self.config.sweep_after_refresh {
            summary.swept = Some(store.sweep().await);
        }

        summary.elapsed_ms = timer.elapsed().as_millis() as u64;
        info!(
            attempted = summary.pairs_attempted,
            succeeded = summary.pairs_succeeded,
            failed = summary.pairs_failed(),
            fetched = summary.records_fetched,
            cached = summary.records_cached,
            popular = summary.popular_count,
            elapsed_ms = summary.elapsed_ms,
            "Refresh cycle complete"
        );

        *write(&self.last_summary) = Some(summary.clone());
        summary
    }

    /// Spawn the scheduler loop. The first cycle starts immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        SchedulerHandle { shutdown_tx, task }
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            period_secs = self.config.period.as_secs(),
            aligned = self.config.align_to_period,
            "Refresh scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Refresh scheduler stopping mid-cycle");
                        break;
                    }
                }
                _ = self.run_once() => {}
            }

            let delay = self.next_run_delay(self.orchestrator.store().now());
            debug!(delay_secs = delay.as_secs(), "Next refresh cycle scheduled");

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Refresh scheduler stopped");
    }
}

/// Owner of a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it. A cycle in progress is
    /// abandoned between pairs; each stored entry is already complete.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Refresh scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredStore;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{CacheEntry, CacheKey};
    use crate::test_support::StubSource;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap()
    }

    fn build_scheduler(source: StubSource, config: SchedulerConfig) -> (Arc<Scheduler>, Arc<StubSource>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now()));
        let store = TieredStore::builder(chrono::Duration::hours(1))
            .clock(clock.clone())
            .build()
            .unwrap();
        let source = Arc::new(source);
        let orchestrator =
            Orchestrator::new(Arc::new(store), source.clone(), Duration::from_secs(5), 2);
        (Arc::new(Scheduler::new(orchestrator, config)), source, clock)
    }

    #[tokio::test]
    async fn test_one_failing_pair_does_not_stop_the_cycle() {
        let source = StubSource::new(&["paris", "london", "berlin"], &["music"]);
        source.fail("london", "music");
        let (scheduler, source, _) = build_scheduler(source, SchedulerConfig::default());

        let summary = scheduler.run_once().await;

        assert_eq!(summary.pairs_attempted, 3);
        assert_eq!(summary.pairs_succeeded, 2);
        assert_eq!(summary.pairs_failed(), 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("london/music"));
        assert_eq!(summary.records_fetched, 4);
        assert_eq!(summary.records_cached, 4);
        for region in ["paris", "london", "berlin"] {
            assert_eq!(source.calls_for(region, "music"), 1);
        }

        let store = scheduler.orchestrator().store();
        assert!(store.contains_valid(&CacheKey::new("paris", Some("music")).unwrap()).await);
        assert!(store.get(&CacheKey::new("london", Some("music")).unwrap()).await.is_none());
        assert_eq!(scheduler.last_refresh_at(), Some(now()));
    }

    #[tokio::test]
    async fn test_cycle_builds_popular_feed() {
        let source = StubSource::new(&["paris", "london", "rome"], &["music", "food"]);
        source.set_records("paris", "music", vec![]);
        source.fail("rome", "music");
        source.fail("rome", "food");
        let (scheduler, _, _) = build_scheduler(source, SchedulerConfig::default());

        let summary = scheduler.run_once().await;
        assert_eq!(summary.popular_count, 2);

        let popular = scheduler.orchestrator().popular().await.unwrap();
        assert_eq!(popular.cities_crawled, vec!["paris", "london"]);
        assert_eq!(popular.records[0], StubSource::default_records("paris", "food")[0]);
        assert_eq!(popular.records[1], StubSource::default_records("london", "music")[0]);
        assert_eq!(popular.count, 2);
        assert_eq!(popular.cached_at, now());
        assert_eq!(popular.next_crawl_at, Some(now() + chrono::Duration::hours(4)));
    }

    #[tokio::test]
    async fn test_sweep_after_refresh() {
        let (scheduler, _, clock) = build_scheduler(
            StubSource::new(&["paris"], &["music"]),
            SchedulerConfig::default(),
        );
        let store = scheduler.orchestrator().store();
        let rome = CacheKey::new("rome", None).unwrap();
        store
            .put(
                &rome,
                CacheEntry::with_timestamp("rome", "all", vec![], clock.now() - chrono::Duration::hours(2)),
            )
            .unwrap();

        let summary = scheduler.run_once().await;
        assert_eq!(summary.swept.map(|s| s.memory), Some(1));
        assert!(store.get(&rome).await.is_none());

        let no_sweep = SchedulerConfig {
            sweep_after_refresh: false,
            ..SchedulerConfig::default()
        };
        let (scheduler, _, _) = scheduler_with(no_sweep);
        assert!(scheduler.run_once().await.swept.is_none());
    }

    fn scheduler_with(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<StubSource>, Arc<ManualClock>) {
        build_scheduler(StubSource::new(&["paris"], &["music"]), config)
    }

    #[tokio::test]
    async fn test_start_runs_immediately_and_stops() {
        let (scheduler, source, _) = scheduler_with(SchedulerConfig::default());
        let handle = Arc::clone(&scheduler).start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.last_summary().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("startup cycle should run without waiting a period");
        assert_eq!(source.calls(), 1);

        // The next cycle is hours away; stop must not wait for it
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should cancel the pending timer");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_abandons_cycle_in_progress() {
        let (scheduler, source, _) = build_scheduler(
            StubSource::new(&["paris"], &["music"]).gated(),
            SchedulerConfig::default(),
        );
        let handle = Arc::clone(&scheduler).start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should cancel the running cycle");
        assert!(scheduler.last_summary().is_none());
        let key = CacheKey::new("paris", Some("music")).unwrap();
        assert!(scheduler.orchestrator().store().get(&key).await.is_none());
    }

    #[test]
    fn test_next_aligned_delay() {
        let six_hours = Duration::from_secs(6 * 3600);

        let at = Utc.with_ymd_and_hms(2026, 10, 15, 13, 30, 0).unwrap();
        assert_eq!(next_aligned_delay(at, six_hours), Duration::from_secs(4 * 3600 + 1800));

        let on_boundary = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        assert_eq!(next_aligned_delay(on_boundary, six_hours), six_hours);

        let before_midnight = Utc.with_ymd_and_hms(2026, 10, 15, 23, 59, 59).unwrap();
        assert_eq!(next_aligned_delay(before_midnight, six_hours), Duration::from_secs(1));
    }

    #[test]
    fn test_next_run_delay_honors_alignment() {
        let aligned = SchedulerConfig {
            period: Duration::from_secs(6 * 3600),
            align_to_period: true,
            sweep_after_refresh: false,
        };
        let (scheduler, _, _) = scheduler_with(aligned);
        let at = Utc.with_ymd_and_hms(2026, 10, 15, 17, 0, 0).unwrap();
        assert_eq!(scheduler.next_run_delay(at), Duration::from_secs(3600));

        let (plain, _, _) = scheduler_with(SchedulerConfig::default());
        assert_eq!(plain.next_run_delay(at), Duration::from_secs(4 * 3600));
    }
}
