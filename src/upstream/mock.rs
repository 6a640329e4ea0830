//! Scriptable source for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{UpstreamError, UpstreamReadingSource};
use crate::models::GlucoseReading;

/// Returns scripted outcomes in order, then repeats the fallback value.
/// Counts every call so tests can assert on upstream traffic.
pub struct MockSource {
    script: Mutex<VecDeque<Result<i32, UpstreamError>>>,
    fallback: Result<i32, UpstreamError>,
    delay: Duration,
    /// After this many calls, readings carry the given timestamp
    fixed_time: Option<(usize, DateTime<Utc>)>,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn returning(value: i32) -> Self {
        Self::with_fallback(Ok(value))
    }

    pub fn failing() -> Self {
        Self::with_fallback(Err(UpstreamError::Network("connection refused".into())))
    }

    fn with_fallback(fallback: Result<i32, UpstreamError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            fixed_time: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes served before the fallback
    pub fn then(self, outcomes: Vec<Result<i32, UpstreamError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            ..self
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Repeat the same sample timestamp once `after` calls have been made
    pub fn at_fixed_time_after(self, after: usize, timestamp: DateTime<Utc>) -> Self {
        Self {
            fixed_time: Some((after, timestamp)),
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamReadingSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_latest(&self) -> Result<GlucoseReading, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let timestamp = match self.fixed_time {
            Some((after, timestamp)) if call > after => timestamp,
            _ => Utc::now(),
        };

        outcome.map(|value| GlucoseReading::new(value, timestamp))
    }
}
