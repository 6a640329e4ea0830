//! Color and threshold policy
//!
//! Built once at startup from `ThresholdSettings` and shared read-only.
//! Glucose bands are an ordered list of `(bound, band, color)` rules
//! evaluated Low -> Normal -> High -> VeryHigh; the first rule whose bound
//! contains the value wins.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ThresholdSettings;
use crate::error::AppResult;
use crate::models::Rgb;
use crate::trend::TrendThresholds;
use crate::validation::validate_threshold_settings;

/// Dim red background behind critically low values
pub const CRITICAL_LOW_BACKGROUND: Rgb = Rgb(64, 0, 0);

/// Dim orange background behind very high values
pub const VERY_HIGH_BACKGROUND: Rgb = Rgb(64, 32, 0);

/// Glucose range classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseBand {
    Low,
    Normal,
    High,
    VeryHigh,
}

/// Upper bound of a band rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// value < n
    Below(i32),
    /// value <= n
    AtMost(i32),
    Unbounded,
}

impl Bound {
    fn contains(self, value: i32) -> bool {
        match self {
            Bound::Below(n) => value < n,
            Bound::AtMost(n) => value <= n,
            Bound::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandRule {
    pub bound: Bound,
    pub band: GlucoseBand,
    pub color: Rgb,
}

/// Validated display policy
#[derive(Debug, Clone)]
pub struct ColorThresholdPolicy {
    bands: Vec<BandRule>,
    critical_low: i32,
    trend: TrendThresholds,
    pub delta_color: Rgb,
    pub progress_color: Rgb,
    pub progress_background: Rgb,
}

impl ColorThresholdPolicy {
    /// Build and validate the policy; any ordering violation fails here
    pub fn from_settings(settings: &ThresholdSettings) -> AppResult<Self> {
        validate_threshold_settings(settings)?;
        let trend = TrendThresholds::new(settings.trend_stable, settings.trend_rapid)?;
        let colors = &settings.colors;

        let policy = Self {
            bands: vec![
                BandRule {
                    bound: Bound::Below(settings.low),
                    band: GlucoseBand::Low,
                    color: colors.low,
                },
                BandRule {
                    bound: Bound::AtMost(settings.high),
                    band: GlucoseBand::Normal,
                    color: colors.normal,
                },
                BandRule {
                    bound: Bound::AtMost(settings.very_high),
                    band: GlucoseBand::High,
                    color: colors.high,
                },
                BandRule {
                    bound: Bound::Unbounded,
                    band: GlucoseBand::VeryHigh,
                    color: colors.very_high,
                },
            ],
            critical_low: settings.critical_low,
            trend,
            delta_color: colors.delta,
            progress_color: colors.progress,
            progress_background: colors.progress_background,
        };

        info!(
            low = settings.low,
            high = settings.high,
            very_high = settings.very_high,
            critical_low = settings.critical_low,
            trend_stable = trend.stable(),
            trend_rapid = trend.rapid(),
            "Display policy loaded"
        );

        Ok(policy)
    }

    /// First band rule containing `value`
    pub fn band_rule(&self, value: i32) -> &BandRule {
        self.bands
            .iter()
            .find(|rule| rule.bound.contains(value))
            .unwrap_or(&self.bands[self.bands.len() - 1])
    }

    pub fn band_for(&self, value: i32) -> GlucoseBand {
        self.band_rule(value).band
    }

    pub fn color_for(&self, value: i32) -> Rgb {
        self.band_rule(value).color
    }

    pub fn is_critical_low(&self, value: i32) -> bool {
        value < self.critical_low
    }

    /// Background highlight for critical values
    pub fn background_for(&self, value: i32) -> Option<Rgb> {
        if self.is_critical_low(value) {
            Some(CRITICAL_LOW_BACKGROUND)
        } else if self.band_for(value) == GlucoseBand::VeryHigh {
            Some(VERY_HIGH_BACKGROUND)
        } else {
            None
        }
    }

    pub fn trend_thresholds(&self) -> &TrendThresholds {
        &self.trend
    }
}

#[cfg(test)]
pub(crate) fn default_policy() -> ColorThresholdPolicy {
    let settings = crate::config::Settings::from_map(&std::collections::HashMap::new())
        .expect("default settings");
    ColorThresholdPolicy::from_settings(&settings.thresholds).expect("default policy")
}
