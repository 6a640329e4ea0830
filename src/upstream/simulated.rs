//! Simulated CGM source
//!
//! Generates a plausible glucose trace for development and demos when no
//! Dexcom credentials are configured. Each fetch advances a random walk:
//! - slow sinusoidal drift to mimic meals and fasting periods
//! - Gaussian sensor noise
//! - occasional meal spikes
//!
//! Values stay within the range a real sensor reports (40..=400 mg/dL).

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::Mutex;
use tracing::debug;

use super::{UpstreamError, UpstreamReadingSource};
use crate::models::GlucoseReading;

const SENSOR_MIN: f64 = 40.0;
const SENSOR_MAX: f64 = 400.0;

struct WalkState {
    value: f64,
    drift_phase: f64,
    rng: StdRng,
}

pub struct SimulatedSource {
    /// Resting glucose level the walk oscillates around
    baseline: f64,
    noise: Normal<f64>,
    state: Mutex<WalkState>,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic source for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let baseline = 120.0;
        Self {
            baseline,
            // sigma 4 mg/dL between samples is typical sensor jitter
            noise: Normal::new(0.0, 4.0).expect("valid normal distribution"),
            state: Mutex::new(WalkState {
                value: baseline,
                drift_phase: 0.0,
                rng,
            }),
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamReadingSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn fetch_latest(&self) -> Result<GlucoseReading, UpstreamError> {
        let mut state = self.state.lock().await;

        state.drift_phase += 0.15;
        if state.drift_phase > std::f64::consts::PI * 2.0 {
            state.drift_phase = 0.0;
        }

        // Pull toward the drifting target so the walk doesn't wander off
        let target = self.baseline + state.drift_phase.sin() * 40.0;
        let pull = (target - state.value) * 0.2;
        let noise = self.noise.sample(&mut state.rng);
        let spike = if state.rng.gen::<f64>() < 0.05 {
            state.rng.gen_range(20.0..45.0)
        } else {
            0.0
        };

        state.value = (state.value + pull + noise + spike).clamp(SENSOR_MIN, SENSOR_MAX);
        let value = state.value.round() as i32;

        debug!(value, phase = state.drift_phase, "Generated simulated glucose reading");

        Ok(GlucoseReading::new(value, Utc::now()))
    }
}
