//! Moving-average filter with an outlier gate.
//!
//! Keeps the last `window` accepted positions and outputs their mean. A
//! sample farther than `outlier_threshold` from the current output is not
//! inserted; after `reseed_after` consecutive rejections the window is
//! cleared and re-seeded from the new sample, so a pallet that really moved
//! is picked up again.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use palletmap_types::{FilteredState, Point3, PositionEstimate, Vec3, seconds_between};
use serde::{Deserialize, Serialize};

use super::{UpdateOutcome, advance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingAverageConfig {
    /// Number of accepted positions averaged.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Distance (metres) from the current output beyond which a sample is
    /// rejected.
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
    /// Consecutive rejections after which the window is re-seeded.
    #[serde(default = "default_reseed_after")]
    pub reseed_after: u32,
    /// Growth of the 1-σ uncertainty per second without measurements.
    #[serde(default = "default_drift_rate")]
    pub drift_rate: f64,
}

fn default_window() -> usize {
    5
}
fn default_outlier_threshold() -> f64 {
    2.0
}
fn default_reseed_after() -> u32 {
    3
}
fn default_drift_rate() -> f64 {
    0.5
}

impl Default for MovingAverageConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            outlier_threshold: default_outlier_threshold(),
            reseed_after: default_reseed_after(),
            drift_rate: default_drift_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    position: Point3,
    variance: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MovingAverageFilter {
    config: MovingAverageConfig,
    window: VecDeque<Sample>,
    rejections: u32,
    /// Per-axis variance of the output.
    variance: f64,
    state: Option<FilteredState>,
}

impl MovingAverageFilter {
    pub fn new(config: MovingAverageConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window.max(1)),
            config,
            rejections: 0,
            variance: 0.0,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&FilteredState> {
        self.state.as_ref()
    }

    /// Hold the position and widen the uncertainty.
    pub fn predict(&mut self, dt: f64) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let drift = self.config.drift_rate * dt;
        self.variance += drift * drift;
        state.uncertainty = self.variance.sqrt();
        state.timestamp = advance(state.timestamp, dt);
    }

    pub fn update(&mut self, estimate: &PositionEstimate) -> UpdateOutcome {
        let sample = Sample {
            position: estimate.position,
            variance: estimate.uncertainty().powi(2),
            timestamp: estimate.timestamp,
        };

        let Some(current) = self.state.as_ref().map(|s| s.position) else {
            self.window.push_back(sample);
            self.recompute(estimate.timestamp);
            return UpdateOutcome::Initialised;
        };

        if current.distance(sample.position) > self.config.outlier_threshold {
            self.rejections += 1;
            if self.rejections < self.config.reseed_after {
                return UpdateOutcome::Rejected;
            }
            self.window.clear();
            self.window.push_back(sample);
            self.rejections = 0;
            self.recompute(estimate.timestamp);
            return UpdateOutcome::Reseeded;
        }

        self.rejections = 0;
        self.window.push_back(sample);
        while self.window.len() > self.config.window.max(1) {
            self.window.pop_front();
        }
        self.recompute(estimate.timestamp);
        UpdateOutcome::Fused
    }

    pub fn covariance_trace(&self) -> f64 {
        if self.state.is_some() { 3.0 * self.variance } else { 0.0 }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.rejections = 0;
        self.variance = 0.0;
        self.state = None;
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        let n = self.window.len() as f64;
        if n == 0.0 {
            return;
        }
        let mean = self
            .window
            .iter()
            .fold(Vec3::zero(), |acc, s| acc.add(s.position))
            .scale(1.0 / n);
        let spread = self
            .window
            .iter()
            .map(|s| s.position.sub(mean).dot(s.position.sub(mean)) / 3.0)
            .sum::<f64>()
            / n;
        let measured = self.window.iter().map(|s| s.variance).sum::<f64>() / n;
        self.variance = (measured + spread) / n;

        let velocity = match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) => {
                let dt = seconds_between(first.timestamp, last.timestamp);
                if dt > 1e-6 {
                    last.position.sub(first.position).scale(1.0 / dt)
                } else {
                    Vec3::zero()
                }
            }
            _ => Vec3::zero(),
        };

        self.state = Some(FilteredState {
            position: mean,
            velocity,
            uncertainty: self.variance.sqrt(),
            timestamp: now,
            last_measurement: now,
        });
    }
}
