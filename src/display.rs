//! Display payload formatting
//!
//! `build` turns a reading, its trend and the cache timing state into a
//! device-agnostic `DisplayPayload`. `DisplayPayload::to_awtrix` renders that
//! payload as an AWTRIX3 custom app.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheSnapshot;
use crate::config::DisplaySettings;
use crate::models::{GlucoseReading, Rgb, TrendCategory, TrendResult};
use crate::policy::{ColorThresholdPolicy, GlucoseBand};

/// Blink period for critically low values, in milliseconds
pub const CRITICAL_BLINK_MS: u32 = 500;

/// Colors by display role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayColors {
    pub value: Rgb,
    pub delta: Rgb,
    pub progress_bar: Rgb,
    pub progress_background: Rgb,
}

/// Everything a display needs to render one glucose frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPayload {
    pub value: i32,
    pub value_text: String,
    pub arrow: String,
    pub trend: TrendCategory,
    /// Signed delta ("+3", "-11", "+0"), empty without a previous reading
    pub delta_text: String,
    pub band: GlucoseBand,
    pub colors: DisplayColors,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<Rgb>,
    pub blink: bool,
    /// Refresh countdown in [0, 1]
    pub progress: f64,
}

/// Build the display payload for `reading`
pub fn build(
    reading: &GlucoseReading,
    trend: &TrendResult,
    cache: &CacheSnapshot,
    policy: &ColorThresholdPolicy,
    now: DateTime<Utc>,
) -> DisplayPayload {
    let rule = policy.band_rule(reading.value);

    DisplayPayload {
        value: reading.value,
        value_text: reading.value.to_string(),
        arrow: trend.category.arrow().to_string(),
        trend: trend.category,
        delta_text: format_delta(trend.delta),
        band: rule.band,
        colors: DisplayColors {
            value: rule.color,
            delta: policy.delta_color,
            progress_bar: policy.progress_color,
            progress_background: policy.progress_background,
        },
        background: policy.background_for(reading.value),
        blink: policy.is_critical_low(reading.value),
        progress: cache.progress(now),
    }
}

fn format_delta(delta: Option<i32>) -> String {
    match delta {
        Some(d) => format!("{:+}", d),
        None => String::new(),
    }
}

/// Progress fraction as a whole percentage, truncated
pub fn progress_percent(progress: f64) -> u8 {
    // Nudge past float noise so 0.29 renders as 29, not 28
    ((progress * 100.0 + 1e-9).floor()).clamp(0.0, 100.0) as u8
}

/// One colored run of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    #[serde(rename = "t")]
    pub text: String,
    /// Hex color without `#`
    #[serde(rename = "c")]
    pub color: String,
}

/// AWTRIX3 custom app body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwtrixApp {
    pub text: Vec<TextFragment>,
    pub color: Rgb,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub duration: u32,
    pub no_scroll: bool,
    pub center: bool,
    pub lifetime: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<Rgb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blink_text: Option<u32>,
    pub progress: u8,
    #[serde(rename = "progressC")]
    pub progress_color: Rgb,
    #[serde(rename = "progressBC")]
    pub progress_background: Rgb,
}

impl DisplayPayload {
    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.progress)
    }

    /// Whether `other` renders the same frame: equal in everything but
    /// progress, with progress in the same tenth of the refresh interval
    pub fn same_frame(&self, other: &DisplayPayload) -> bool {
        let without_progress = |p: &DisplayPayload| DisplayPayload {
            progress: 0.0,
            ..p.clone()
        };

        without_progress(self) == without_progress(other)
            && self.progress_percent() / 10 == other.progress_percent() / 10
    }

    /// Render as an AWTRIX3 custom app
    pub fn to_awtrix(&self, settings: &DisplaySettings) -> AwtrixApp {
        let mut text = vec![TextFragment {
            text: format!("{}{}", self.value_text, self.arrow),
            color: self.colors.value.to_hex(),
        }];

        if !self.delta_text.is_empty() {
            text.push(TextFragment {
                text: format!(" {}", self.delta_text),
                color: self.colors.delta.to_hex(),
            });
        }

        AwtrixApp {
            text,
            color: self.colors.value,
            icon: settings.icon.clone(),
            duration: settings.duration_secs,
            no_scroll: true,
            center: true,
            lifetime: settings.lifetime_secs,
            background: self.background,
            blink_text: self.blink.then_some(CRITICAL_BLINK_MS),
            progress: self.progress_percent(),
            progress_color: self.colors.progress_bar,
            progress_background: self.colors.progress_background,
        }
    }
}
