//! Usage tracking
//!
//! Lock-free counters for requests, upstream fetches and cache hits since
//! process start. Each counter is an independent atomic, so increments are
//! never lost under contention.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct UsageTracker {
    total_requests: AtomicU64,
    fetch_attempts: AtomicU64,
    fetch_successes: AtomicU64,
    fetch_failures: AtomicU64,
    cache_hits: AtomicU64,
}

/// Point-in-time copy of the raw counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageCounters {
    pub total_requests: u64,
    pub upstream_fetch_attempts: u64,
    pub upstream_fetch_successes: u64,
    pub upstream_fetch_failures: u64,
    pub cache_hits: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.fetch_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageCounters {
        UsageCounters {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            upstream_fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            upstream_fetch_successes: self.fetch_successes.load(Ordering::Relaxed),
            upstream_fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Usage statistics with derived fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub upstream_fetch_attempts: u64,
    pub upstream_fetch_successes: u64,
    pub upstream_fetch_failures: u64,
    pub cache_hits: u64,
    /// cache_hits / total_requests, 0 before the first request
    pub hit_ratio: f64,
    pub seconds_until_next_fetch: u64,
}

impl UsageStats {
    pub fn derive(
        counters: UsageCounters,
        last_fetch: Option<DateTime<Utc>>,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let hit_ratio = if counters.total_requests == 0 {
            0.0
        } else {
            counters.cache_hits as f64 / counters.total_requests as f64
        };

        Self {
            total_requests: counters.total_requests,
            upstream_fetch_attempts: counters.upstream_fetch_attempts,
            upstream_fetch_successes: counters.upstream_fetch_successes,
            upstream_fetch_failures: counters.upstream_fetch_failures,
            cache_hits: counters.cache_hits,
            hit_ratio,
            seconds_until_next_fetch: seconds_until_next_fetch(last_fetch, min_interval, now),
        }
    }
}

/// max(0, min_interval - (now - last_fetch)), rounded up to whole seconds
pub fn seconds_until_next_fetch(
    last_fetch: Option<DateTime<Utc>>,
    min_interval: Duration,
    now: DateTime<Utc>,
) -> u64 {
    let Some(last_fetch) = last_fetch else {
        return 0;
    };

    let remaining = min_interval - (now - last_fetch);
    if remaining <= Duration::zero() {
        return 0;
    }

    let millis = remaining.num_milliseconds() as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_tracker_is_zeroed() {
        let tracker = UsageTracker::new();
        assert_eq!(tracker.snapshot(), UsageCounters::default());
    }

    #[test]
    fn test_counters_are_independent() {
        let tracker = UsageTracker::new();

        tracker.record_request();
        tracker.record_request();
        tracker.record_attempt();
        tracker.record_success();
        tracker.record_cache_hit();

        let counters = tracker.snapshot();
        assert_eq!(counters.total_requests, 2);
        assert_eq!(counters.upstream_fetch_attempts, 1);
        assert_eq!(counters.upstream_fetch_successes, 1);
        assert_eq!(counters.upstream_fetch_failures, 0);
        assert_eq!(counters.cache_hits, 1);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let tracker = Arc::new(UsageTracker::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        tracker.record_request();
                        tracker.record_cache_hit();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let counters = tracker.snapshot();
        assert_eq!(counters.total_requests, 80_000);
        assert_eq!(counters.cache_hits, 80_000);
    }

    #[test]
    fn test_hit_ratio() {
        let now = Utc::now();
        let interval = Duration::seconds(300);

        let stats = UsageStats::derive(UsageCounters::default(), None, interval, now);
        assert_eq!(stats.hit_ratio, 0.0);

        let counters = UsageCounters {
            total_requests: 4,
            cache_hits: 3,
            ..Default::default()
        };
        let stats = UsageStats::derive(counters, None, interval, now);
        assert_eq!(stats.hit_ratio, 0.75);
    }

    #[test]
    fn test_seconds_until_next_fetch() {
        let t0 = Utc::now();
        let interval = Duration::seconds(300);

        assert_eq!(seconds_until_next_fetch(None, interval, t0), 0);
        assert_eq!(seconds_until_next_fetch(Some(t0), interval, t0), 300);
        assert_eq!(
            seconds_until_next_fetch(Some(t0), interval, t0 + Duration::seconds(30)),
            270
        );
        assert_eq!(
            seconds_until_next_fetch(Some(t0), interval, t0 + Duration::milliseconds(30_500)),
            270
        );
        assert_eq!(
            seconds_until_next_fetch(Some(t0), interval, t0 + Duration::seconds(300)),
            0
        );
        assert_eq!(
            seconds_until_next_fetch(Some(t0), interval, t0 + Duration::seconds(900)),
            0
        );
    }
}
