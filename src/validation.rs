//! Input validation module
//!
//! Validates the glucose policy configuration at startup and readings
//! arriving from upstream sources.

use crate::config::ThresholdSettings;
use crate::error::{AppError, AppResult};
use crate::models::GlucoseReading;
use crate::upstream::UpstreamError;
use tracing::{debug, warn};
use validator::{Validate, ValidationErrors};

/// Flatten validator errors into `field: message` pairs
fn collect_messages(validation_errors: &ValidationErrors) -> String {
    let mut error_messages: Vec<String> = validation_errors
        .field_errors()
        .iter()
        .map(|(field, errors)| {
            let msgs: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.message.as_ref().map(|c| c.as_ref()))
                .collect();
            format!("{}: {}", field, msgs.join(", "))
        })
        .collect();

    error_messages.sort();
    error_messages.join("; ")
}

/// Validate glucose band boundaries.
///
/// Bands must be ordered `critical_low <= low <= high < very_high` so that
/// every value falls into exactly one band. Trend threshold ordering is
/// checked when the thresholds are constructed.
pub fn validate_threshold_settings(settings: &ThresholdSettings) -> AppResult<()> {
    if let Err(validation_errors) = settings.validate() {
        let message = collect_messages(&validation_errors);
        warn!(errors = %message, "Threshold settings validation failed");
        return Err(AppError::InvalidPolicyConfiguration(message));
    }

    let ordering = [
        ("GLUCOSE_CRITICAL_LOW", settings.critical_low, "GLUCOSE_LOW", settings.low, false),
        ("GLUCOSE_LOW", settings.low, "GLUCOSE_HIGH", settings.high, false),
        ("GLUCOSE_HIGH", settings.high, "GLUCOSE_VERY_HIGH", settings.very_high, true),
    ];

    for (lower_name, lower, upper_name, upper, strict) in ordering {
        let ordered = if strict { lower < upper } else { lower <= upper };
        if !ordered {
            let relation = if strict { "below" } else { "at or below" };
            return Err(AppError::InvalidPolicyConfiguration(format!(
                "{} ({}) must be {} {} ({})",
                lower_name, lower, relation, upper_name, upper
            )));
        }
    }

    debug!("Threshold settings validation passed");
    Ok(())
}

/// Validate a reading converted from an upstream payload
pub fn validate_reading(reading: &GlucoseReading) -> Result<(), UpstreamError> {
    reading
        .validate()
        .map_err(|errors| UpstreamError::InvalidReading(collect_messages(&errors)))
}
