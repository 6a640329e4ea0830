//! Trend classification
//!
//! Turns the difference between the current and previous reading into a
//! discrete trend category. Thresholds are evaluated as an ordered list of
//! `(bound, magnitude)` rules; a delta on a bound belongs to that bound's
//! rule, so ties resolve toward the less alarming category.

use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::{GlucoseReading, TrendCategory, TrendResult};

/// Default absolute delta (mg/dL) still considered stable
pub const DEFAULT_STABLE_THRESHOLD: i32 = 5;

/// Default absolute delta (mg/dL) still considered moderate
pub const DEFAULT_RAPID_THRESHOLD: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Magnitude {
    Stable,
    Moderate,
    Rapid,
}

/// Validated pair of trend thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendThresholds {
    stable: i32,
    rapid: i32,
}

impl TrendThresholds {
    /// Build thresholds, rejecting a rapid bound that does not exceed the stable bound
    pub fn new(stable: i32, rapid: i32) -> AppResult<Self> {
        if stable < 0 {
            return Err(AppError::InvalidPolicyConfiguration(format!(
                "stable trend threshold must not be negative (got {})",
                stable
            )));
        }

        if rapid <= stable {
            return Err(AppError::InvalidPolicyConfiguration(format!(
                "rapid trend threshold ({}) must exceed stable threshold ({})",
                rapid, stable
            )));
        }

        Ok(Self { stable, rapid })
    }

    pub fn stable(&self) -> i32 {
        self.stable
    }

    pub fn rapid(&self) -> i32 {
        self.rapid
    }

    fn rules(&self) -> [(i32, Magnitude); 2] {
        [(self.stable, Magnitude::Stable), (self.rapid, Magnitude::Moderate)]
    }
}

impl Default for TrendThresholds {
    fn default() -> Self {
        Self {
            stable: DEFAULT_STABLE_THRESHOLD,
            rapid: DEFAULT_RAPID_THRESHOLD,
        }
    }
}

/// Classify the change from `previous` to `current`
pub fn classify(current: i32, previous: Option<i32>, thresholds: &TrendThresholds) -> TrendResult {
    let Some(previous) = previous else {
        return TrendResult {
            delta: None,
            category: TrendCategory::Unknown,
        };
    };

    let delta = current.saturating_sub(previous);
    let magnitude = thresholds
        .rules()
        .iter()
        .find(|(bound, _)| delta.saturating_abs() <= *bound)
        .map(|(_, magnitude)| *magnitude)
        .unwrap_or(Magnitude::Rapid);

    let rising = delta > 0;
    let category = match (magnitude, rising) {
        (Magnitude::Stable, _) => TrendCategory::Stable,
        (Magnitude::Moderate, true) => TrendCategory::ModerateUp,
        (Magnitude::Moderate, false) => TrendCategory::ModerateDown,
        (Magnitude::Rapid, true) => TrendCategory::RapidUp,
        (Magnitude::Rapid, false) => TrendCategory::RapidDown,
    };

    TrendResult {
        delta: Some(delta),
        category,
    }
}

/// Classify a reading against its predecessor.
///
/// Without a predecessor the category reported upstream is used, if any;
/// the delta stays absent either way.
pub fn classify_reading(
    reading: &GlucoseReading,
    previous: Option<&GlucoseReading>,
    thresholds: &TrendThresholds,
) -> TrendResult {
    let result = classify(reading.value, previous.map(|p| p.value), thresholds);

    match (result.delta, reading.trend) {
        (None, Some(reported)) => TrendResult {
            delta: None,
            category: reported,
        },
        _ => result,
    }
}
