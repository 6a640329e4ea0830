//! Upstream reading sources
//!
//! A source returns the single most recent glucose reading or fails. The
//! cache treats every failure mode the same way, so the error variants only
//! matter for logging.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{SettingsError, SourceKind, UpstreamSettings};
use crate::models::GlucoseReading;

pub mod dexcom;
pub mod simulated;

#[cfg(test)]
pub(crate) mod mock;

pub use dexcom::DexcomShareSource;
pub use simulated::SimulatedSource;

/// Errors that can occur while fetching from upstream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// Connectivity failure (DNS, connection refused, TLS, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Fetch exceeded its deadline
    #[error("Upstream timeout after {0}ms")]
    Timeout(u64),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Session expired or unknown; a new login is required
    #[error("Session expired")]
    SessionExpired,

    /// Upstream answered with an error status
    #[error("Upstream error {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Upstream answered but had no reading to give
    #[error("No glucose reading available")]
    NoReading,

    /// Response body doesn't match the expected format
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Reading outside the plausible glucose range
    #[error("Invalid reading: {0}")]
    InvalidReading(String),
}

/// Source of the latest glucose reading
#[async_trait]
pub trait UpstreamReadingSource: Send + Sync + 'static {
    /// Human-readable name for logs and health output
    fn name(&self) -> &str;

    /// Fetch the most recent reading. May block for an unspecified time.
    async fn fetch_latest(&self) -> Result<GlucoseReading, UpstreamError>;
}

/// Build the configured source
pub fn build_source(
    settings: &UpstreamSettings,
) -> Result<Arc<dyn UpstreamReadingSource>, SettingsError> {
    let source: Arc<dyn UpstreamReadingSource> = match settings.source {
        SourceKind::Dexcom => Arc::new(DexcomShareSource::from_settings(
            &settings.dexcom,
            Duration::from_secs(settings.timeout_secs),
        )?),
        SourceKind::Simulated => Arc::new(SimulatedSource::new()),
    };

    info!(source = source.name(), "Upstream source configured");
    Ok(source)
}
