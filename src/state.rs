//! Application state management
//!
//! Shared container handed to every handler and websocket session. The
//! cache carries its own locking, so the state is shared as a plain `Arc`.

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::cache::{CacheLookup, ReadingCache};
use crate::config::DisplaySettings;
use crate::display::{self, DisplayPayload};
use crate::error::AppResult;
use crate::models::TrendResult;
use crate::policy::ColorThresholdPolicy;
use crate::trend::classify_reading;

/// A cache lookup with its trend and rendered payload
#[derive(Debug, Clone)]
pub struct CurrentGlucose {
    pub lookup: CacheLookup,
    pub trend: TrendResult,
    pub payload: DisplayPayload,
}

pub struct AppState {
    cache: ReadingCache,
    policy: ColorThresholdPolicy,
    display: DisplaySettings,
    start_time: DateTime<Utc>,
    /// Connected WebSocket clients
    connected_clients: RwLock<Vec<String>>,
}

impl AppState {
    pub fn new(cache: ReadingCache, policy: ColorThresholdPolicy, display: DisplaySettings) -> Self {
        info!("Initializing application state");
        Self {
            cache,
            policy,
            display,
            start_time: Utc::now(),
            connected_clients: RwLock::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &ReadingCache {
        &self.cache
    }

    pub fn display_settings(&self) -> &DisplaySettings {
        &self.display
    }

    /// Read through the cache, classify against the previous reading and
    /// build the display payload
    pub async fn current(&self, now: DateTime<Utc>) -> AppResult<CurrentGlucose> {
        let lookup = self.cache.get(now).await?;
        Ok(self.render(lookup, now))
    }

    /// Like `current`, but answers from the cache without touching the usage
    /// counters when no fetch is due. Used by periodic websocket pushes.
    pub async fn current_for_push(&self, now: DateTime<Utc>) -> AppResult<CurrentGlucose> {
        match self.cache.peek(now).await {
            Some(lookup) => Ok(self.render(lookup, now)),
            None => self.current(now).await,
        }
    }

    fn render(&self, lookup: CacheLookup, now: DateTime<Utc>) -> CurrentGlucose {
        let trend = classify_reading(
            &lookup.reading,
            lookup.snapshot.previous_reading.as_ref(),
            self.policy.trend_thresholds(),
        );
        let payload = display::build(&lookup.reading, &trend, &lookup.snapshot, &self.policy, now);

        CurrentGlucose {
            lookup,
            trend,
            payload,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.start_time).num_seconds().max(0) as u64
    }

    pub async fn add_client(&self, client_id: String) {
        info!(client_id = %client_id, "WebSocket client connected");
        self.connected_clients.write().await.push(client_id);
    }

    pub async fn remove_client(&self, client_id: &str) {
        info!(client_id = %client_id, "WebSocket client disconnected");
        self.connected_clients.write().await.retain(|id| id != client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.connected_clients.read().await.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::state_with;
    use super::*;
    use crate::models::TrendCategory;
    use crate::upstream::mock::MockSource;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_current_classifies_against_previous() {
        let source = Arc::new(MockSource::returning(149).then(vec![Ok(160)]));
        let state = state_with(source.clone());
        let t0 = Utc::now();

        let first = state.current(t0).await.unwrap();
        assert_eq!(first.trend.category, TrendCategory::Unknown);
        assert_eq!(first.payload.delta_text, "");

        let second = state.current(t0 + Duration::seconds(300)).await.unwrap();
        assert_eq!(second.trend.delta, Some(-11));
        assert_eq!(second.payload.delta_text, "-11");
        assert_eq!(second.payload.arrow, "↘");
        assert_eq!(second.payload.progress, 0.0);
    }

    #[tokio::test]
    async fn test_cached_reading_keeps_its_trend() {
        let source = Arc::new(MockSource::returning(149).then(vec![Ok(160)]));
        let state = state_with(source.clone());
        let t0 = Utc::now();

        state.current(t0).await.unwrap();
        state.current(t0 + Duration::seconds(300)).await.unwrap();
        let cached = state.current(t0 + Duration::seconds(330)).await.unwrap();

        assert!(!cached.lookup.is_fresh);
        assert_eq!(cached.payload.delta_text, "-11");
        assert!((cached.payload.progress - 0.10).abs() < 1e-9);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_push_reads_do_not_skew_statistics() {
        let source = Arc::new(MockSource::returning(120));
        let state = state_with(source.clone());
        let t0 = Utc::now();

        // Cold: the push has to fetch, which counts as a request
        let first = state.current_for_push(t0).await.unwrap();
        assert!(first.lookup.is_fresh);

        for secs in [10, 20, 30] {
            let pushed = state.current_for_push(t0 + Duration::seconds(secs)).await.unwrap();
            assert_eq!(pushed.payload.value, 120);
        }

        let stats = state.cache().statistics(t0).await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(source.calls(), 1);

        // Interval elapsed: the push refreshes through the cache
        let refreshed = state.current_for_push(t0 + Duration::seconds(300)).await.unwrap();
        assert!(refreshed.lookup.is_fresh);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_client_tracking() {
        let state = state_with(Arc::new(MockSource::returning(120)));

        state.add_client("client-1".to_string()).await;
        state.add_client("client-2".to_string()).await;
        assert_eq!(state.client_count().await, 2);

        state.remove_client("client-1").await;
        assert_eq!(state.client_count().await, 1);
    }
}
