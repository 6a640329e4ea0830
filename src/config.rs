//! Configuration management module
//!
//! Loads environment-based configuration (optionally seeded from a `.env`
//! file). Values are parsed here; semantic validation of the color and
//! threshold policy happens in `policy`.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;
use validator::Validate;

use crate::models::Rgb;

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for environment variable {0}")]
    ParseError(String),

    #[error("Invalid color in {var}: {reason}")]
    InvalidColor { var: String, reason: String },

    #[error("Unknown upstream source '{0}' (expected 'dexcom' or 'simulated')")]
    UnknownSource(String),

    #[error("Dexcom source requires DEXCOM_PASSWORD and DEXCOM_USERNAME or DEXCOM_ACCOUNT_ID")]
    MissingCredentials,
}

/// Which upstream reading source to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Dexcom,
    Simulated,
}

impl FromStr for SourceKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dexcom" => Ok(SourceKind::Dexcom),
            "simulated" | "fake" => Ok(SourceKind::Simulated),
            other => Err(SettingsError::UnknownSource(other.to_string())),
        }
    }
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Dexcom Share account settings
#[derive(Debug, Clone, Deserialize)]
pub struct DexcomSettings {
    pub username: Option<String>,
    pub account_id: Option<String>,
    pub password: Option<String>,
    /// One of `us`, `ous`, `jp`
    pub region: String,
}

/// Upstream source settings
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    pub source: SourceKind,
    pub dexcom: DexcomSettings,
    /// Upper bound on a single upstream fetch
    pub timeout_secs: u64,
}

/// Read-through cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Minimum interval between upstream fetches
    pub min_interval_secs: u64,
    /// Cooldown after a failed fetch before upstream is tried again
    pub failure_backoff_secs: u64,
}

/// Display app settings
#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySettings {
    pub icon: Option<String>,
    /// Seconds the app stays on screen per rotation
    pub duration_secs: u32,
    /// Seconds before the device drops the app if not updated
    pub lifetime_secs: u32,
    /// Push cadence for websocket display clients
    pub ws_push_interval_secs: u64,
}

/// Colors per glucose band and fixed display role
#[derive(Debug, Clone, Deserialize)]
pub struct ColorSettings {
    pub low: Rgb,
    pub normal: Rgb,
    pub high: Rgb,
    pub very_high: Rgb,
    pub delta: Rgb,
    pub progress: Rgb,
    pub progress_background: Rgb,
}

/// Glucose band boundaries and trend thresholds (mg/dL)
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ThresholdSettings {
    #[validate(range(min = 20, max = 600, message = "GLUCOSE_CRITICAL_LOW must be between 20 and 600"))]
    pub critical_low: i32,
    #[validate(range(min = 20, max = 600, message = "GLUCOSE_LOW must be between 20 and 600"))]
    pub low: i32,
    #[validate(range(min = 20, max = 600, message = "GLUCOSE_HIGH must be between 20 and 600"))]
    pub high: i32,
    #[validate(range(min = 20, max = 600, message = "GLUCOSE_VERY_HIGH must be between 20 and 600"))]
    pub very_high: i32,
    #[validate(range(min = 0, max = 200, message = "TREND_STABLE_THRESHOLD must be between 0 and 200"))]
    pub trend_stable: i32,
    #[validate(range(min = 1, max = 200, message = "TREND_RAPID_THRESHOLD must be between 1 and 200"))]
    pub trend_rapid: i32,
    pub colors: ColorSettings,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub display: DisplaySettings,
    pub thresholds: ThresholdSettings,
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from a map of variables (used by tests)
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, SettingsError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let text = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let number = |key: &str, default: i64| -> Result<i64, SettingsError> {
            match var(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| SettingsError::ParseError(key.to_string())),
                None => Ok(default),
            }
        };

        let color = |key: &str, default: Rgb| -> Result<Rgb, SettingsError> {
            match var(key) {
                Some(raw) => raw.parse().map_err(|reason| SettingsError::InvalidColor {
                    var: key.to_string(),
                    reason,
                }),
                None => Ok(default),
            }
        };

        let dexcom = DexcomSettings {
            username: var("DEXCOM_USERNAME"),
            account_id: var("DEXCOM_ACCOUNT_ID"),
            password: var("DEXCOM_PASSWORD"),
            region: text("DEXCOM_REGION", "us").to_lowercase(),
        };

        let source = match var("UPSTREAM_SOURCE") {
            Some(raw) => raw.parse::<SourceKind>()?,
            None if dexcom.password.is_some() => SourceKind::Dexcom,
            None => SourceKind::Simulated,
        };

        if source == SourceKind::Dexcom
            && (dexcom.password.is_none()
                || (dexcom.username.is_none() && dexcom.account_id.is_none()))
        {
            return Err(SettingsError::MissingCredentials);
        }

        let port = u16::try_from(number("SERVER_PORT", 8080)?)
            .map_err(|_| SettingsError::ParseError("SERVER_PORT".into()))?;

        let unsigned = |key: &str, default: i64| -> Result<u64, SettingsError> {
            u64::try_from(number(key, default)?).map_err(|_| SettingsError::ParseError(key.into()))
        };

        let signed = |key: &str, default: i64| -> Result<i32, SettingsError> {
            i32::try_from(number(key, default)?).map_err(|_| SettingsError::ParseError(key.into()))
        };

        Ok(Self {
            server: ServerSettings {
                host: text("SERVER_HOST", "0.0.0.0"),
                port,
            },
            upstream: UpstreamSettings {
                source,
                dexcom,
                timeout_secs: unsigned("UPSTREAM_TIMEOUT_SECS", 15)?,
            },
            cache: CacheSettings {
                min_interval_secs: unsigned("CACHE_MIN_INTERVAL_SECS", 300)?,
                failure_backoff_secs: unsigned("CACHE_FAILURE_BACKOFF_SECS", 60)?,
            },
            display: DisplaySettings {
                icon: var("AWTRIX_ICON"),
                duration_secs: u32::try_from(unsigned("AWTRIX_DURATION", 10)?)
                    .map_err(|_| SettingsError::ParseError("AWTRIX_DURATION".into()))?,
                lifetime_secs: u32::try_from(unsigned("AWTRIX_LIFETIME", 120)?)
                    .map_err(|_| SettingsError::ParseError("AWTRIX_LIFETIME".into()))?,
                ws_push_interval_secs: unsigned("WS_PUSH_INTERVAL_SECS", 10)?,
            },
            thresholds: ThresholdSettings {
                critical_low: signed("GLUCOSE_CRITICAL_LOW", 55)?,
                low: signed("GLUCOSE_LOW", 70)?,
                high: signed("GLUCOSE_HIGH", 180)?,
                very_high: signed("GLUCOSE_VERY_HIGH", 240)?,
                trend_stable: signed("TREND_STABLE_THRESHOLD", 5)?,
                trend_rapid: signed("TREND_RAPID_THRESHOLD", 15)?,
                colors: ColorSettings {
                    low: color("COLOR_LOW", Rgb::RED)?,
                    normal: color("COLOR_NORMAL", Rgb::GREEN)?,
                    high: color("COLOR_HIGH", Rgb::YELLOW)?,
                    very_high: color("COLOR_VERY_HIGH", Rgb::ORANGE)?,
                    delta: color("COLOR_DELTA", Rgb::WHITE)?,
                    progress: color("COLOR_PROGRESS", Rgb::CYAN)?,
                    progress_background: color("COLOR_PROGRESS_BACKGROUND", Rgb::DARK_GRAY)?,
                },
            },
        })
    }
}
