//! Rate-limited read-through cache
//!
//! Owns the latest upstream reading and decides, per request, whether the
//! upstream source may be contacted. Guarantees:
//! - at most one upstream fetch is in flight at any time
//! - no fetch happens within `min_interval` of the last successful one
//! - callers with cached data are never blocked by an in-flight fetch
//! - callers without cached data wait for the in-flight fetch and share its
//!   outcome, success or failure
//! - once any reading exists, fetch failures degrade to stale data
//!
//! The state lock is held only to read or publish state, never across the
//! upstream call. The fetch gate serializes the decide-fetch-update sequence.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::CacheSettings;
use crate::error::{AppError, AppResult};
use crate::models::GlucoseReading;
use crate::upstream::{UpstreamError, UpstreamReadingSource};
use crate::usage::{seconds_until_next_fetch, UsageStats, UsageTracker};

/// Timing knobs for the cache
#[derive(Debug, Clone, Copy)]
pub struct CacheTiming {
    /// Minimum interval between successful upstream fetches
    pub min_interval: Duration,
    /// Upper bound on a single upstream fetch
    pub fetch_timeout: std::time::Duration,
    /// Cooldown after a failed fetch
    pub failure_backoff: Duration,
}

impl CacheTiming {
    pub fn from_settings(settings: &CacheSettings, fetch_timeout_secs: u64) -> Self {
        Self {
            min_interval: Duration::seconds(settings.min_interval_secs as i64),
            fetch_timeout: std::time::Duration::from_secs(fetch_timeout_secs),
            failure_backoff: Duration::seconds(settings.failure_backoff_secs as i64),
        }
    }
}

impl Default for CacheTiming {
    fn default() -> Self {
        Self {
            min_interval: Duration::seconds(300),
            fetch_timeout: std::time::Duration::from_secs(15),
            failure_backoff: Duration::seconds(60),
        }
    }
}

/// A reading together with the time it was fetched.
/// Keeps "last reading" and "last fetch time" set or unset together.
#[derive(Debug, Clone, PartialEq)]
struct CachedReading {
    reading: GlucoseReading,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    latest: Option<CachedReading>,
    /// Reading held before the most recent successful fetch
    previous: Option<GlucoseReading>,
    last_failure: Option<DateTime<Utc>>,
    /// Error of the most recent fetch, cleared by a success
    last_error: Option<String>,
    /// Bumped once per completed fetch, successful or not
    generation: u64,
}

/// What `get` should do after inspecting the state
enum Decision {
    Serve(CacheLookup),
    /// A fetch is allowed; `generation` is the state the caller saw
    Fetch { generation: u64 },
}

/// Read-only copy of the cache timing state
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub last_reading: Option<GlucoseReading>,
    pub previous_reading: Option<GlucoseReading>,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub min_interval: Duration,
}

impl CacheSnapshot {
    /// Refresh countdown in [0, 1]: 0 right after a fetch, 1 when a fetch is allowed.
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        let Some(last_fetch) = self.last_fetch_time else {
            return 1.0;
        };

        let interval_ms = self.min_interval.num_milliseconds();
        if interval_ms <= 0 {
            return 1.0;
        }

        let elapsed_ms = (now - last_fetch).num_milliseconds();
        (elapsed_ms as f64 / interval_ms as f64).clamp(0.0, 1.0)
    }

    pub fn seconds_until_next_fetch(&self, now: DateTime<Utc>) -> u64 {
        seconds_until_next_fetch(self.last_fetch_time, self.min_interval, now)
    }

    pub fn next_fetch_at(&self) -> Option<DateTime<Utc>> {
        self.last_fetch_time.map(|t| t + self.min_interval)
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub reading: GlucoseReading,
    /// True when this call performed the upstream fetch
    pub is_fresh: bool,
    pub snapshot: CacheSnapshot,
}

pub struct ReadingCache {
    source: Arc<dyn UpstreamReadingSource>,
    state: RwLock<CacheState>,
    fetch_gate: Mutex<()>,
    tracker: UsageTracker,
    timing: CacheTiming,
}

impl ReadingCache {
    pub fn new(source: Arc<dyn UpstreamReadingSource>, timing: CacheTiming) -> Self {
        info!(
            source = source.name(),
            min_interval_secs = timing.min_interval.num_seconds(),
            fetch_timeout_ms = timing.fetch_timeout.as_millis() as u64,
            failure_backoff_secs = timing.failure_backoff.num_seconds(),
            "Initializing reading cache"
        );

        Self {
            source,
            state: RwLock::new(CacheState::default()),
            fetch_gate: Mutex::new(()),
            tracker: UsageTracker::new(),
            timing,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn min_interval(&self) -> Duration {
        self.timing.min_interval
    }

    /// Best available reading at `now`.
    ///
    /// Fails with `UpstreamUnavailable` only when nothing is cached and the
    /// fetch this call performed, or waited on, failed.
    pub async fn get(&self, now: DateTime<Utc>) -> AppResult<CacheLookup> {
        self.tracker.record_request();

        let generation = match self.decide(now).await {
            Decision::Serve(lookup) => return Ok(lookup),
            Decision::Fetch { generation } => generation,
        };

        let _gate = match self.fetch_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                // A fetch is in flight: stale data beats waiting for it
                if let Some(stale) = self.stale().await {
                    debug!("Fetch in flight, serving cached reading");
                    self.tracker.record_cache_hit();
                    return Ok(stale);
                }
                self.fetch_gate.lock().await
            }
        };

        // A fetch completed since this call looked at the state: share its outcome
        if let Some(outcome) = self.outcome_since(generation).await {
            return outcome;
        }

        self.fetch(now).await
    }

    /// Cached reading that may be served at `now` without a fetch, and
    /// whether it is being held by the failure backoff.
    /// Backoff only applies while a reading is cached.
    fn servable<'a>(&self, state: &'a CacheState, now: DateTime<Utc>) -> Option<(&'a CachedReading, bool)> {
        let cached = state.latest.as_ref()?;

        let in_backoff = state
            .last_failure
            .is_some_and(|failed_at| now - failed_at < self.timing.failure_backoff);

        (now - cached.fetched_at < self.timing.min_interval || in_backoff).then_some((cached, in_backoff))
    }

    async fn decide(&self, now: DateTime<Utc>) -> Decision {
        let state = self.state.read().await;

        match self.servable(&state, now) {
            Some((cached, in_backoff)) => {
                self.tracker.record_cache_hit();
                debug!(
                    value = cached.reading.value,
                    seconds_until_next_fetch =
                        seconds_until_next_fetch(Some(cached.fetched_at), self.timing.min_interval, now),
                    in_backoff,
                    "Serving cached reading"
                );
                Decision::Serve(self.lookup(&state, cached.reading.clone(), false))
            }
            None => Decision::Fetch {
                generation: state.generation,
            },
        }
    }

    async fn outcome_since(&self, generation: u64) -> Option<AppResult<CacheLookup>> {
        let state = self.state.read().await;
        if state.generation == generation {
            return None;
        }

        match &state.latest {
            Some(cached) => {
                self.tracker.record_cache_hit();
                Some(Ok(self.lookup(&state, cached.reading.clone(), false)))
            }
            None => {
                let reason = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Upstream fetch failed".to_string());
                debug!(error = %reason, "Sharing failed fetch outcome with waiting caller");
                Some(Err(AppError::UpstreamUnavailable(reason)))
            }
        }
    }

    async fn stale(&self) -> Option<CacheLookup> {
        let state = self.state.read().await;
        let reading = state.latest.as_ref()?.reading.clone();
        Some(self.lookup(&state, reading, false))
    }

    /// Cached reading at `now` if serving it needs no fetch.
    /// Leaves the usage counters untouched.
    pub async fn peek(&self, now: DateTime<Utc>) -> Option<CacheLookup> {
        let state = self.state.read().await;
        let (cached, _) = self.servable(&state, now)?;
        Some(self.lookup(&state, cached.reading.clone(), false))
    }

    /// Contact upstream and publish the outcome. Caller holds the fetch gate.
    async fn fetch(&self, now: DateTime<Utc>) -> AppResult<CacheLookup> {
        self.tracker.record_attempt();
        debug!(source = self.source.name(), "Fetching reading from upstream");

        let outcome = match tokio::time::timeout(self.timing.fetch_timeout, self.source.fetch_latest()).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timing.fetch_timeout.as_millis() as u64)),
        };

        let mut state = self.state.write().await;
        state.generation += 1;

        match outcome {
            Ok(reading) => {
                self.tracker.record_success();

                if let Some(replaced) = state.latest.take() {
                    // Same sample seen again: keep the real predecessor
                    if replaced.reading.timestamp != reading.timestamp {
                        state.previous = Some(replaced.reading);
                    }
                }

                state.latest = Some(CachedReading {
                    reading: reading.clone(),
                    fetched_at: now,
                });
                state.last_failure = None;
                state.last_error = None;

                info!(
                    value = reading.value,
                    previous = ?state.previous.as_ref().map(|r| r.value),
                    reading_time = %reading.timestamp,
                    "Fetched glucose reading"
                );

                Ok(self.lookup(&state, reading, true))
            }
            Err(upstream_error) => {
                self.tracker.record_failure();
                state.last_failure = Some(now);
                state.last_error = Some(upstream_error.to_string());

                match state.latest.as_ref().map(|cached| cached.reading.clone()) {
                    Some(reading) => {
                        warn!(
                            error = %upstream_error,
                            value = reading.value,
                            "Upstream degraded, serving last known reading"
                        );
                        Ok(self.lookup(&state, reading, false))
                    }
                    None => {
                        error!(error = %upstream_error, "Upstream fetch failed with empty cache");
                        Err(AppError::UpstreamUnavailable(upstream_error.to_string()))
                    }
                }
            }
        }
    }

    fn lookup(&self, state: &CacheState, reading: GlucoseReading, is_fresh: bool) -> CacheLookup {
        CacheLookup {
            reading,
            is_fresh,
            snapshot: self.snapshot_of(state),
        }
    }

    fn snapshot_of(&self, state: &CacheState) -> CacheSnapshot {
        CacheSnapshot {
            last_reading: state.latest.as_ref().map(|c| c.reading.clone()),
            previous_reading: state.previous.clone(),
            last_fetch_time: state.latest.as_ref().map(|c| c.fetched_at),
            min_interval: self.timing.min_interval,
        }
    }

    /// Current timing state without contacting upstream
    pub async fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.read().await;
        self.snapshot_of(&state)
    }

    /// Usage statistics at `now`
    pub async fn statistics(&self, now: DateTime<Utc>) -> UsageStats {
        let last_fetch = self.snapshot().await.last_fetch_time;
        UsageStats::derive(self.tracker.snapshot(), last_fetch, self.timing.min_interval, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::MockSource;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn timing() -> CacheTiming {
        CacheTiming {
            min_interval: Duration::seconds(300),
            fetch_timeout: std::time::Duration::from_millis(500),
            failure_backoff: Duration::zero(),
        }
    }

    fn cache_with(source: Arc<MockSource>, timing: CacheTiming) -> ReadingCache {
        ReadingCache::new(source, timing)
    }

    #[tokio::test]
    async fn test_cold_start_fetches() {
        let source = Arc::new(MockSource::returning(120));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        let lookup = assert_ok!(cache.get(t0).await);

        assert_eq!(lookup.reading.value, 120);
        assert!(lookup.is_fresh);
        assert_eq!(lookup.snapshot.last_fetch_time, Some(t0));
        assert_eq!(lookup.snapshot.progress(t0), 0.0);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_within_interval_serves_cache() {
        let source = Arc::new(MockSource::returning(120));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        let t1 = t0 + Duration::seconds(30);
        let lookup = cache.get(t1).await.unwrap();

        assert!(!lookup.is_fresh);
        assert_eq!(lookup.reading.value, 120);
        assert_eq!(source.calls(), 1);
        assert!((lookup.snapshot.progress(t1) - 0.10).abs() < 1e-9);
        assert_eq!(lookup.snapshot.seconds_until_next_fetch(t1), 270);
    }

    #[tokio::test]
    async fn test_expired_interval_refetches_and_keeps_previous() {
        let source = Arc::new(MockSource::returning(149).then(vec![Ok(160)]));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        let t1 = t0 + Duration::seconds(300);
        let lookup = cache.get(t1).await.unwrap();

        assert!(lookup.is_fresh);
        assert_eq!(lookup.reading.value, 149);
        assert_eq!(lookup.snapshot.previous_reading.map(|r| r.value), Some(160));
        assert_eq!(lookup.snapshot.last_fetch_time, Some(t1));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_repeated_get_is_idempotent() {
        let source = Arc::new(MockSource::returning(120));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        let first = cache.get(t0).await.unwrap();
        let second = cache.get(t0).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_prior_reading() {
        let source = Arc::new(MockSource::failing().then(vec![Ok(130)]));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        let t1 = t0 + Duration::seconds(301);
        let lookup = assert_ok!(cache.get(t1).await);

        assert_eq!(lookup.reading.value, 130);
        assert!(!lookup.is_fresh);
        // Failed fetch leaves the last successful fetch time alone
        assert_eq!(lookup.snapshot.last_fetch_time, Some(t0));

        let stats = cache.statistics(t1).await;
        assert_eq!(stats.upstream_fetch_attempts, 2);
        assert_eq!(stats.upstream_fetch_successes, 1);
        assert_eq!(stats.upstream_fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_cold_start_failure_is_unavailable() {
        let source = Arc::new(MockSource::failing());
        let cache = cache_with(source.clone(), timing());

        let error = assert_err!(cache.get(Utc::now()).await);
        assert!(matches!(error, AppError::UpstreamUnavailable(_)));

        let snapshot = cache.snapshot().await;
        assert!(snapshot.last_reading.is_none());
        assert!(snapshot.last_fetch_time.is_none());
    }

    #[tokio::test]
    async fn test_timeout_treated_as_failure() {
        let source = Arc::new(
            MockSource::returning(120).with_delay(std::time::Duration::from_millis(200)),
        );
        let cache = cache_with(
            source.clone(),
            CacheTiming {
                fetch_timeout: std::time::Duration::from_millis(20),
                ..timing()
            },
        );

        let error = assert_err!(cache.get(Utc::now()).await);
        assert!(matches!(error, AppError::UpstreamUnavailable(msg) if msg.contains("timeout")));
        assert_eq!(cache.statistics(Utc::now()).await.upstream_fetch_failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_gets_fetch_once() {
        let source = Arc::new(
            MockSource::returning(120).with_delay(std::time::Duration::from_millis(50)),
        );
        let cache = Arc::new(cache_with(source.clone(), timing()));
        let now = Utc::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get(now).await })
            })
            .collect();

        for result in join_all(handles).await {
            let lookup = result.unwrap().unwrap();
            assert_eq!(lookup.reading.value, 120);
        }

        assert_eq!(source.calls(), 1);

        let stats = cache.statistics(now).await;
        assert_eq!(stats.total_requests, 32);
        assert_eq!(stats.upstream_fetch_attempts, 1);
        assert_eq!(stats.cache_hits, 31);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_expired_gets_fetch_once() {
        let source = Arc::new(
            MockSource::returning(140)
                .then(vec![Ok(120)])
                .with_delay(std::time::Duration::from_millis(50)),
        );
        let cache = Arc::new(cache_with(source.clone(), timing()));
        let t0 = Utc::now();
        cache.get(t0).await.unwrap();

        let t1 = t0 + Duration::seconds(600);
        let results = join_all((0..32).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(t1).await })
        }))
        .await;

        let fresh = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|lookup| lookup.is_fresh)
            .count();

        assert_eq!(fresh, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_fetch_does_not_block_stale_reads() {
        let source = Arc::new(
            MockSource::returning(150)
                .then(vec![Ok(120)])
                .with_delay(std::time::Duration::from_millis(100)),
        );
        let cache = Arc::new(cache_with(source.clone(), timing()));
        let t0 = Utc::now();
        cache.get(t0).await.unwrap();

        let t1 = t0 + Duration::seconds(301);
        let refresher = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(t1).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        let stale = cache.get(t1).await.unwrap();

        assert!(started.elapsed() < std::time::Duration::from_millis(80));
        assert!(!stale.is_fresh);
        assert_eq!(stale.reading.value, 120);

        let refreshed = refresher.await.unwrap().unwrap();
        assert!(refreshed.is_fresh);
        assert_eq!(refreshed.reading.value, 150);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_backoff_suppresses_retries() {
        let source = Arc::new(MockSource::returning(110).then(vec![
            Ok(100),
            Err(UpstreamError::NoReading),
        ]));
        let cache = cache_with(
            source.clone(),
            CacheTiming {
                failure_backoff: Duration::seconds(60),
                ..timing()
            },
        );
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        let t1 = t0 + Duration::seconds(300);
        assert!(!cache.get(t1).await.unwrap().is_fresh);
        assert_eq!(source.calls(), 2);

        // Inside the backoff window: no upstream contact
        let lookup = cache.get(t1 + Duration::seconds(30)).await.unwrap();
        assert_eq!(lookup.reading.value, 100);
        assert_eq!(source.calls(), 2);

        // Backoff elapsed: retried and refreshed
        let lookup = cache.get(t1 + Duration::seconds(60)).await.unwrap();
        assert!(lookup.is_fresh);
        assert_eq!(lookup.reading.value, 110);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_cold_call_during_backoff_still_fetches() {
        let source = Arc::new(MockSource::returning(120).then(vec![Err(UpstreamError::NoReading)]));
        let cache = cache_with(source.clone(), CacheTiming::default());
        let t0 = Utc::now();

        assert_err!(cache.get(t0).await);

        // Nothing cached, so the backoff does not hold the caller back
        let lookup = assert_ok!(cache.get(t0 + Duration::seconds(10)).await);
        assert!(lookup.is_fresh);
        assert_eq!(lookup.reading.value, 120);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_failures_fetch_once() {
        let source = Arc::new(MockSource::failing().with_delay(std::time::Duration::from_millis(100)));
        let cache = Arc::new(cache_with(source.clone(), timing()));
        let now = Utc::now();

        let results = join_all((0..8).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(now).await })
        }))
        .await;

        for result in results {
            let error = result.unwrap().unwrap_err();
            assert!(matches!(error, AppError::UpstreamUnavailable(msg) if msg.contains("connection refused")));
        }

        assert_eq!(source.calls(), 1);

        let stats = cache.statistics(now).await;
        assert_eq!(stats.total_requests, 8);
        assert_eq!(stats.upstream_fetch_attempts, 1);
        assert_eq!(stats.upstream_fetch_failures, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_peek_needs_no_fetch_and_counts_nothing() {
        let source = Arc::new(MockSource::returning(120));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        assert!(cache.peek(t0).await.is_none());
        cache.get(t0).await.unwrap();

        let peeked = cache.peek(t0 + Duration::seconds(30)).await.unwrap();
        assert_eq!(peeked.reading.value, 120);
        assert!(!peeked.is_fresh);
        assert!(cache.peek(t0 + Duration::seconds(300)).await.is_none());

        let stats = cache.statistics(t0).await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_same_sample_does_not_shift_previous() {
        let sample_time = Utc::now() - Duration::minutes(2);
        let source = Arc::new(
            MockSource::returning(125)
                .then(vec![Ok(140), Ok(130)])
                .at_fixed_time_after(2, sample_time),
        );
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();

        cache.get(t0).await.unwrap();
        cache.get(t0 + Duration::seconds(300)).await.unwrap();
        let third = cache.get(t0 + Duration::seconds(600)).await.unwrap();
        let fourth = cache.get(t0 + Duration::seconds(900)).await.unwrap();

        assert_eq!(third.reading.value, 125);
        assert_eq!(third.snapshot.previous_reading.map(|r| r.value), Some(130));
        // Same sample as the third fetch: predecessor stays 130
        assert_eq!(fourth.snapshot.previous_reading.map(|r| r.value), Some(130));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_within_window() {
        let source = Arc::new(MockSource::returning(120));
        let cache = cache_with(source.clone(), timing());
        let t0 = Utc::now();
        cache.get(t0).await.unwrap();

        let mut last = 0.0;
        for secs in (0..=330).step_by(15) {
            let now = t0 + Duration::seconds(secs);
            let progress = cache.snapshot().await.progress(now);
            assert!(progress >= last, "progress fell at {}s", secs);
            assert!((0.0..=1.0).contains(&progress));
            last = progress;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_progress_without_fetch_is_ready() {
        let snapshot = CacheSnapshot {
            last_reading: None,
            previous_reading: None,
            last_fetch_time: None,
            min_interval: Duration::seconds(300),
        };

        assert_eq!(snapshot.progress(Utc::now()), 1.0);
        assert_eq!(snapshot.seconds_until_next_fetch(Utc::now()), 0);
        assert!(snapshot.next_fetch_at().is_none());
    }
}
