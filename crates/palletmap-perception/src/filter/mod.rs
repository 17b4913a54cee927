//! Temporal Filter.
//!
//! Smooths the stream of raw [`PositionEstimate`]s of one tag into a
//! velocity-aware [`FilteredState`]. Three strategies are available
//! (see [`FilterKind`]):
//!
//! | Strategy | Module | Notes |
//! |----------|--------|-------|
//! | Moving average | [`moving_average`] | Outlier gate with re-seeding.       |
//! | Kalman         | [`kalman`]         | Constant-velocity, Joseph update.   |
//! | Particle       | [`particle`]       | Obstacle-aware, seeded RNG.         |
//!
//! [`TagTracker`] wraps whichever strategy is configured and enforces the
//! rules shared by all of them: estimates older than the current state are
//! rejected with [`MapError::StaleReport`], and a covariance trace above
//! `divergence_bound` yields [`MapError::FilterDivergence`] (the caller is
//! expected to [`reset`](TagTracker::reset) the tracker).
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use palletmap_perception::filter::{FilterConfig, TagTracker, UpdateOutcome};
//! use palletmap_types::{Point3, PositionEstimate, TagId};
//!
//! let mut tracker = TagTracker::new(TagId::from("pallet-7"), &FilterConfig::default(), None);
//! let estimate = PositionEstimate {
//!     position: Point3::new(1.0, 2.0, 0.0),
//!     covariance: [[0.01, 0.0, 0.0], [0.0, 0.01, 0.0], [0.0, 0.0, 0.01]],
//!     timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
//!     anchors_used: 4,
//!     residual_rms: 0.02,
//! };
//! assert_eq!(tracker.update(&estimate).unwrap(), UpdateOutcome::Initialised);
//! assert_eq!(tracker.state().unwrap().position, Point3::new(1.0, 2.0, 0.0));
//! ```

pub mod kalman;
pub mod moving_average;
pub mod particle;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use palletmap_types::{FilteredState, MapError, PositionEstimate, TagId, delta_from_secs, seconds_between};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::Geometry;

pub use kalman::{KalmanConfig, KalmanFilter};
pub use moving_average::{MovingAverageConfig, MovingAverageFilter};
pub use particle::{ParticleConfig, ParticleFilter};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Filter strategy, selectable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    MovingAverage,
    #[default]
    Kalman,
    Particle,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterKind::MovingAverage => "moving_average",
            FilterKind::Kalman => "kalman",
            FilterKind::Particle => "particle",
        };
        f.write_str(name)
    }
}

/// Filter selection plus per-strategy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub strategy: FilterKind,
    /// Covariance trace (m²) above which a filter is considered diverged.
    ///
    /// A silent tag's trace keeps growing on predict-only steps. Under the
    /// default Kalman settings it reaches about 350 m² after the edge's
    /// default 10 s staleness and crosses this default near 16 s.
    #[serde(default = "default_divergence_bound")]
    pub divergence_bound: f64,
    #[serde(default)]
    pub moving_average: MovingAverageConfig,
    #[serde(default)]
    pub kalman: KalmanConfig,
    #[serde(default)]
    pub particle: ParticleConfig,
}

fn default_divergence_bound() -> f64 {
    1000.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            strategy: FilterKind::default(),
            divergence_bound: default_divergence_bound(),
            moving_average: MovingAverageConfig::default(),
            kalman: KalmanConfig::default(),
            particle: ParticleConfig::default(),
        }
    }
}

/// What a single [`TagTracker::update`] did with the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First estimate; the filter was seeded from it.
    Initialised,
    /// The estimate was fused into the state.
    Fused,
    /// The estimate was discarded as an outlier.
    Rejected,
    /// The filter was re-seeded around the estimate.
    Reseeded,
}

// ────────────────────────────────────────────────────────────────────────────
// TemporalFilter
// ────────────────────────────────────────────────────────────────────────────

/// The closed set of filter strategies.
#[derive(Debug, Clone)]
pub enum TemporalFilter {
    MovingAverage(MovingAverageFilter),
    Kalman(KalmanFilter),
    Particle(ParticleFilter),
}

impl TemporalFilter {
    /// Build the configured strategy. `seed` only affects the particle filter.
    pub fn from_config(config: &FilterConfig, geometry: Option<Arc<Geometry>>, seed: u64) -> Self {
        match config.strategy {
            FilterKind::MovingAverage => {
                TemporalFilter::MovingAverage(MovingAverageFilter::new(config.moving_average.clone()))
            }
            FilterKind::Kalman => TemporalFilter::Kalman(KalmanFilter::new(config.kalman.clone())),
            FilterKind::Particle => {
                TemporalFilter::Particle(ParticleFilter::new(config.particle.clone(), geometry, seed))
            }
        }
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            TemporalFilter::MovingAverage(_) => FilterKind::MovingAverage,
            TemporalFilter::Kalman(_) => FilterKind::Kalman,
            TemporalFilter::Particle(_) => FilterKind::Particle,
        }
    }

    pub fn state(&self) -> Option<&FilteredState> {
        match self {
            TemporalFilter::MovingAverage(f) => f.state(),
            TemporalFilter::Kalman(f) => f.state(),
            TemporalFilter::Particle(f) => f.state(),
        }
    }

    /// Advance the state by `dt` seconds without a measurement.
    pub fn predict(&mut self, dt: f64) {
        match self {
            TemporalFilter::MovingAverage(f) => f.predict(dt),
            TemporalFilter::Kalman(f) => f.predict(dt),
            TemporalFilter::Particle(f) => f.predict(dt),
        }
    }

    /// Fuse an estimate already aligned with the state timestamp.
    pub fn update(&mut self, estimate: &PositionEstimate) -> UpdateOutcome {
        match self {
            TemporalFilter::MovingAverage(f) => f.update(estimate),
            TemporalFilter::Kalman(f) => f.update(estimate),
            TemporalFilter::Particle(f) => f.update(estimate),
        }
    }

    /// Trace of the 3×3 position covariance (m²).
    pub fn covariance_trace(&self) -> f64 {
        match self {
            TemporalFilter::MovingAverage(f) => f.covariance_trace(),
            TemporalFilter::Kalman(f) => f.covariance_trace(),
            TemporalFilter::Particle(f) => f.covariance_trace(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            TemporalFilter::MovingAverage(f) => f.reset(),
            TemporalFilter::Kalman(f) => f.reset(),
            TemporalFilter::Particle(f) => f.reset(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TagTracker
// ────────────────────────────────────────────────────────────────────────────

/// One tag's filter plus the ordering and sanity rules shared by every
/// strategy.
#[derive(Debug, Clone)]
pub struct TagTracker {
    tag: TagId,
    divergence_bound: f64,
    filter: TemporalFilter,
}

impl TagTracker {
    /// Create an empty tracker for `tag`.
    ///
    /// `geometry` lets the particle filter keep particles out of obstacles.
    /// Its RNG seed is derived from the configured seed and the tag id so
    /// that runs are reproducible.
    pub fn new(tag: TagId, config: &FilterConfig, geometry: Option<Arc<Geometry>>) -> Self {
        let seed = config.particle.seed ^ fnv1a(tag.as_str().as_bytes());
        Self {
            filter: TemporalFilter::from_config(config, geometry, seed),
            divergence_bound: config.divergence_bound,
            tag,
        }
    }

    pub fn tag(&self) -> &TagId {
        &self.tag
    }

    pub fn kind(&self) -> FilterKind {
        self.filter.kind()
    }

    pub fn state(&self) -> Option<&FilteredState> {
        self.filter.state()
    }

    /// Predict-only step of `dt` seconds (dropout handling).
    pub fn predict(&mut self, dt: f64) -> Result<(), MapError> {
        if self.filter.state().is_none() || !(dt > 0.0) {
            return Ok(());
        }
        self.filter.predict(dt);
        self.check_divergence()
    }

    /// Predict forward to `now`; a no-op when `now` is not ahead of the state.
    pub fn predict_to(&mut self, now: DateTime<Utc>) -> Result<(), MapError> {
        let Some(state) = self.filter.state() else {
            return Ok(());
        };
        let dt = seconds_between(state.timestamp, now);
        self.predict(dt)
    }

    /// Fuse a new estimate.
    ///
    /// The state is first predicted forward to the estimate's timestamp.
    pub fn update(&mut self, estimate: &PositionEstimate) -> Result<UpdateOutcome, MapError> {
        if let Some(state) = self.filter.state()
            && estimate.timestamp < state.timestamp
        {
            return Err(MapError::StaleReport {
                tag: self.tag.clone(),
                reported: estimate.timestamp,
                accepted: state.timestamp,
            });
        }
        self.predict_to(estimate.timestamp)?;

        let outcome = self.filter.update(estimate);
        match outcome {
            UpdateOutcome::Rejected => warn!(
                tag = %self.tag,
                x = estimate.position.x,
                y = estimate.position.y,
                z = estimate.position.z,
                "rejected outlier estimate"
            ),
            UpdateOutcome::Reseeded => debug!(tag = %self.tag, "filter re-seeded"),
            UpdateOutcome::Initialised | UpdateOutcome::Fused => {}
        }
        self.check_divergence()?;
        Ok(outcome)
    }

    /// Drop all state; the next estimate re-initialises the filter.
    pub fn reset(&mut self) {
        self.filter.reset();
    }

    fn check_divergence(&self) -> Result<(), MapError> {
        let trace = self.filter.covariance_trace();
        if !trace.is_finite() || trace > self.divergence_bound {
            return Err(MapError::FilterDivergence {
                tag: self.tag.clone(),
                trace,
            });
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ────────────────────────────────────────────────────────────────────────────

/// Advance a state timestamp by a fractional number of seconds.
pub(crate) fn advance(ts: DateTime<Utc>, dt: f64) -> DateTime<Utc> {
    ts + delta_from_secs(dt)
}

/// Stable 64-bit FNV-1a hash, used to derive per-tag RNG seeds.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use palletmap_types::Point3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    pub(crate) fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + delta_from_secs(secs)
    }

    pub(crate) fn estimate(position: Point3, sigma: f64, secs: f64) -> PositionEstimate {
        let v = sigma * sigma;
        PositionEstimate {
            position,
            covariance: [[v, 0.0, 0.0], [0.0, v, 0.0], [0.0, 0.0, v]],
            timestamp: t(secs),
            anchors_used: 4,
            residual_rms: sigma,
        }
    }

    /// Final position error after a constant-position Gaussian stream.
    fn final_error(config: FilterConfig, sigma: f64) -> f64 {
        let truth = Point3::new(5.0, 3.0, 1.0);
        let noise = Normal::new(0.0, sigma).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut tracker = TagTracker::new(TagId::from("pallet-1"), &config, None);
        for i in 0..60 {
            let p = Point3::new(
                truth.x + noise.sample(&mut rng),
                truth.y + noise.sample(&mut rng),
                truth.z + noise.sample(&mut rng),
            );
            tracker.update(&estimate(p, sigma, i as f64 * 0.5)).unwrap();
        }
        tracker.state().unwrap().position.distance(truth)
    }

    #[test]
    fn every_strategy_converges_below_sigma() {
        let sigma = 0.3;

        let mut ma = FilterConfig {
            strategy: FilterKind::MovingAverage,
            ..FilterConfig::default()
        };
        ma.moving_average.window = 20;
        assert!(final_error(ma, sigma) < sigma);

        let mut kf = FilterConfig::default();
        kf.kalman.process_noise = 1e-3;
        assert!(final_error(kf, sigma) < sigma);

        let mut pf = FilterConfig {
            strategy: FilterKind::Particle,
            ..FilterConfig::default()
        };
        pf.particle.motion_noise = 0.02;
        pf.particle.velocity_noise = 0.01;
        pf.particle.measurement_noise = sigma;
        assert!(final_error(pf, sigma) < sigma);
    }

    #[test]
    fn older_estimate_is_stale() {
        let mut tracker = TagTracker::new(TagId::from("pallet-2"), &FilterConfig::default(), None);
        tracker
            .update(&estimate(Point3::new(1.0, 1.0, 0.0), 0.1, 10.0))
            .unwrap();
        let err = tracker
            .update(&estimate(Point3::new(1.0, 1.0, 0.0), 0.1, 9.0))
            .unwrap_err();
        assert!(matches!(err, MapError::StaleReport { .. }), "{err:?}");
        // Equal timestamps are not older.
        tracker
            .update(&estimate(Point3::new(1.1, 1.0, 0.0), 0.1, 10.0))
            .unwrap();
    }

    #[test]
    fn default_kalman_survives_ten_seconds_of_silence() {
        let mut tracker = TagTracker::new(TagId::from("pallet-4"), &FilterConfig::default(), None);
        tracker
            .update(&estimate(Point3::new(1.0, 1.0, 0.0), 0.1, 0.0))
            .unwrap();
        // Edge-sized predict-only steps across the default staleness window.
        for _ in 0..50 {
            tracker.predict(0.2).unwrap();
        }
        assert!(tracker.state().unwrap().uncertainty > 1.0);

        // Much longer silences still count as divergence.
        let mut gone = false;
        for _ in 0..100 {
            if tracker.predict(0.2).is_err() {
                gone = true;
                break;
            }
        }
        assert!(gone);
    }

    #[test]
    fn long_dropout_diverges_and_reset_recovers() {
        let config = FilterConfig {
            divergence_bound: 1.0,
            ..FilterConfig::default()
        };
        let mut tracker = TagTracker::new(TagId::from("pallet-3"), &config, None);
        tracker
            .update(&estimate(Point3::new(1.0, 1.0, 0.0), 0.1, 0.0))
            .unwrap();
        let err = tracker.predict(60.0).unwrap_err();
        assert!(matches!(err, MapError::FilterDivergence { .. }), "{err:?}");

        tracker.reset();
        assert!(tracker.state().is_none());
        let outcome = tracker
            .update(&estimate(Point3::new(2.0, 2.0, 0.0), 0.1, 61.0))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Initialised);
    }

    #[test]
    fn predict_without_state_is_noop() {
        let mut tracker = TagTracker::new(TagId::from("pallet-4"), &FilterConfig::default(), None);
        tracker.predict(5.0).unwrap();
        tracker.predict_to(t(3.0)).unwrap();
        assert!(tracker.state().is_none());
    }

    #[test]
    fn predict_advances_state_timestamp() {
        let mut tracker = TagTracker::new(TagId::from("pallet-5"), &FilterConfig::default(), None);
        tracker
            .update(&estimate(Point3::new(1.0, 1.0, 0.0), 0.1, 0.0))
            .unwrap();
        let before = tracker.state().unwrap().uncertainty;
        tracker.predict_to(t(2.0)).unwrap();
        let state = tracker.state().unwrap();
        assert_eq!(state.timestamp, t(2.0));
        assert_eq!(state.last_measurement, t(0.0));
        assert!(state.uncertainty > before);
    }

    #[test]
    fn per_tag_seeds_differ() {
        assert_ne!(fnv1a(b"pallet-1"), fnv1a(b"pallet-2"));
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn filter_config_fills_missing_sections_with_defaults() {
        let cfg: FilterConfig = serde_json::from_str(
            r#"{"strategy":"moving_average","moving_average":{"window":8}}"#,
        )
        .unwrap();
        assert_eq!(cfg.strategy, FilterKind::MovingAverage);
        assert_eq!(cfg.moving_average.window, 8);
        assert_eq!(cfg.divergence_bound, 1000.0);
    }
}
