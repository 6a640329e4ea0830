//! Data models for glucose readings and related structures
//!
//! Defines the core value types shared by the cache, the classifier,
//! the display formatter and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::display::DisplayPayload;
use crate::usage::UsageStats;

/// mg/dL to mmol/L conversion factor used by CGM vendors
pub const MMOL_L_CONVERSION_FACTOR: f64 = 0.0555;

/// Discrete classification of the glucose rate of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendCategory {
    Stable,
    ModerateUp,
    ModerateDown,
    RapidUp,
    RapidDown,
    Unknown,
}

impl TrendCategory {
    /// Arrow glyph rendered on the display
    pub fn arrow(&self) -> &'static str {
        match self {
            TrendCategory::Stable => "→",
            TrendCategory::ModerateUp => "↗",
            TrendCategory::ModerateDown => "↘",
            TrendCategory::RapidUp => "↑",
            TrendCategory::RapidDown => "↓",
            TrendCategory::Unknown => "?",
        }
    }
}

impl fmt::Display for TrendCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrendCategory::Stable => "stable",
            TrendCategory::ModerateUp => "moderate_up",
            TrendCategory::ModerateDown => "moderate_down",
            TrendCategory::RapidUp => "rapid_up",
            TrendCategory::RapidDown => "rapid_down",
            TrendCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A single glucose reading as seen by the rest of the application.
///
/// Upstream payloads are converted into this type at the source boundary,
/// so nothing past the upstream module depends on the provider's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GlucoseReading {
    /// Glucose value in mg/dL
    #[validate(range(min = 20, max = 600, message = "Glucose must be between 20 and 600 mg/dL"))]
    pub value: i32,

    /// Reading time as reported upstream, or the fetch time when unreported
    pub timestamp: DateTime<Utc>,

    /// Trend category reported by the upstream provider, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendCategory>,
}

impl GlucoseReading {
    pub fn new(value: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp,
            trend: None,
        }
    }

    pub fn with_trend(mut self, trend: TrendCategory) -> Self {
        self.trend = Some(trend);
        self
    }

    /// Value in mmol/L rounded to one decimal
    pub fn mmol_l(&self) -> f64 {
        (self.value as f64 * MMOL_L_CONVERSION_FACTOR * 10.0).round() / 10.0
    }
}

/// Output of the trend classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendResult {
    /// current - previous, absent without a previous reading
    pub delta: Option<i32>,
    pub category: TrendCategory,
}

/// RGB color triple, serialized as `[r, g, b]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const RED: Rgb = Rgb(255, 0, 0);
    pub const GREEN: Rgb = Rgb(0, 255, 0);
    pub const YELLOW: Rgb = Rgb(255, 255, 0);
    pub const ORANGE: Rgb = Rgb(255, 128, 0);
    pub const WHITE: Rgb = Rgb(255, 255, 255);
    pub const CYAN: Rgb = Rgb(0, 255, 255);
    pub const DARK_GRAY: Rgb = Rgb(32, 32, 32);

    /// Hex form without a leading `#`, e.g. `FF8000`
    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0, self.1, self.2)
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parses `"r,g,b"` with each component in 0..=255
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("expected 'r,g,b', got '{}'", s));
        }

        let component = |p: &str| {
            p.parse::<u8>()
                .map_err(|_| format!("invalid color component '{}' in '{}'", p, s))
        };

        Ok(Rgb(component(parts[0])?, component(parts[1])?, component(parts[2])?))
    }
}

/// Raw glucose response for debugging and custom integrations
#[derive(Debug, Serialize, Deserialize)]
pub struct GlucoseResponse {
    pub value: i32,
    pub mmol_l: f64,
    pub trend: TrendCategory,
    pub trend_arrow: String,
    pub delta: Option<i32>,
    pub previous_value: Option<i32>,
    pub timestamp: DateTime<Utc>,
    /// Whether this request triggered the upstream fetch
    pub fresh: bool,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Cache and rate-limit status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub seconds_until_next_refresh: u64,
    pub refresh_progress_percent: u8,
    pub can_refresh_now: bool,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub statistics: UsageStats,
}

/// WebSocket message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// New display payload available
    DisplayUpdate(DisplayPayload),
    /// Connection acknowledgment
    Connected { client_id: String },
    /// Error message
    Error { message: String },
    /// Heartbeat/ping
    Ping,
    /// Heartbeat/pong response
    Pong,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub source: String,
    pub last_fetch: Option<DateTime<Utc>>,
    pub connected_clients: usize,
}
