//! Trilateration Engine.
//!
//! Turns a set of simultaneous anchor-to-tag ranges into a single 3-D
//! [`PositionEstimate`] with a propagated covariance.
//!
//! Three interchangeable strategies are available (see [`Strategy`]):
//!
//! - **Linear** – subtracts the mean squared-range equation from every
//!   equation (centroid form), which removes the quadratic term and leaves a
//!   linear system `A·p = b` solved by QR decomposition.
//! - **Nonlinear** – Levenberg–Marquardt on the weighted range residuals
//!   `Σ (‖p − aₖ‖ − dₖ)² / eₖ²`, seeded with the linear solution.
//! - **Multilateral** – runs both and blends them, each weighted inversely by
//!   its normalised residual plus propagated variance.
//!
//! Anchors that share a plane (every set of three, and the usual
//! ceiling-mounted layout) cannot observe the direction along the plane
//! normal. In that case the linear step returns the in-plane least-squares
//! point lifted by `±u` along the normal and picks one of the two mirror
//! candidates: inside the warehouse bounds first, then closest to the
//! previous position, then the positive-normal side.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use palletmap_perception::trilateration::{RangeSample, TrilaterationConfig, Trilaterator};
//! use palletmap_types::Point3;
//!
//! let truth = Point3::new(3.0, 4.0, 1.5);
//! let anchors = [
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(10.0, 0.0, 0.5),
//!     Point3::new(0.0, 10.0, 2.0),
//!     Point3::new(10.0, 10.0, 4.0),
//! ];
//! let samples: Vec<RangeSample> = anchors
//!     .iter()
//!     .map(|a| RangeSample::new(*a, a.distance(truth), 0.1))
//!     .collect();
//!
//! let solver = Trilaterator::new(TrilaterationConfig::default());
//! let estimate = solver.solve(&samples, None, Utc::now()).unwrap();
//! assert!(estimate.position.distance(truth) < 1e-6);
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use palletmap_types::{MapError, Point3, PositionEstimate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::Aabb;

// ────────────────────────────────────────────────────────────────────────────
// Input / configuration
// ────────────────────────────────────────────────────────────────────────────

/// One anchor range used by a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSample {
    /// Anchor position in the warehouse frame.
    pub anchor: Point3,
    /// Measured distance (metres).
    pub distance: f64,
    /// Reported 1-σ error bound of the distance (metres).
    pub error_bound: f64,
}

impl RangeSample {
    pub fn new(anchor: Point3, distance: f64, error_bound: f64) -> Self {
        Self {
            anchor,
            distance,
            error_bound,
        }
    }
}

/// Solve strategy, selectable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Linear,
    Nonlinear,
    #[default]
    Multilateral,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Linear => "linear",
            Strategy::Nonlinear => "nonlinear",
            Strategy::Multilateral => "multilateral",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "lls" => Ok(Strategy::Linear),
            "nonlinear" => Ok(Strategy::Nonlinear),
            "multilateral" | "multi" => Ok(Strategy::Multilateral),
            other => Err(format!("unknown trilateration strategy '{other}'")),
        }
    }
}

/// Tuning knobs for [`Trilaterator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrilaterationConfig {
    #[serde(default)]
    pub strategy: Strategy,
    /// Iteration cap of the nonlinear refinement.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Weighted-cost improvement under which the refinement has converged.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Ratio of smallest to largest singular value of the linear system
    /// under which a direction is treated as unobservable.
    #[serde(default = "default_degeneracy_tolerance")]
    pub degeneracy_tolerance: f64,
    /// Floor applied to reported error bounds before weighting.
    #[serde(default = "default_min_error_bound")]
    pub min_error_bound: f64,
}

fn default_max_iterations() -> usize {
    50
}
fn default_convergence_threshold() -> f64 {
    1e-9
}
fn default_degeneracy_tolerance() -> f64 {
    1e-3
}
fn default_min_error_bound() -> f64 {
    1e-3
}

impl Default for TrilaterationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_iterations: default_max_iterations(),
            convergence_threshold: default_convergence_threshold(),
            degeneracy_tolerance: default_degeneracy_tolerance(),
            min_error_bound: default_min_error_bound(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trilaterator
// ────────────────────────────────────────────────────────────────────────────

/// Valid samples in solver form.
struct Prepared {
    anchors: Vec<Vector3<f64>>,
    ranges: Vec<f64>,
    weights: Vec<f64>,
}

impl Prepared {
    fn len(&self) -> usize {
        self.anchors.len()
    }
}

/// Output of the linear step before the mirror choice.
struct LinearSolution {
    primary: Vector3<f64>,
    mirror: Option<Vector3<f64>>,
}

/// Stateless range solver.
#[derive(Debug, Clone)]
pub struct Trilaterator {
    config: TrilaterationConfig,
    bounds: Option<Aabb>,
}

impl Trilaterator {
    pub fn new(config: TrilaterationConfig) -> Self {
        Self {
            config,
            bounds: None,
        }
    }

    /// Use `bounds` to disambiguate mirror candidates.
    pub fn with_bounds(mut self, bounds: Aabb) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// Solve with the configured strategy.
    ///
    /// `previous` is the tag's last known position, used only to choose
    /// between mirror candidates.
    pub fn solve(
        &self,
        samples: &[RangeSample],
        previous: Option<Point3>,
        timestamp: DateTime<Utc>,
    ) -> Result<PositionEstimate, MapError> {
        self.solve_with(self.config.strategy, samples, previous, timestamp)
    }

    /// Solve with an explicit strategy.
    pub fn solve_with(
        &self,
        strategy: Strategy,
        samples: &[RangeSample],
        previous: Option<Point3>,
        timestamp: DateTime<Utc>,
    ) -> Result<PositionEstimate, MapError> {
        let prepared = self.prepare(samples)?;
        let start = self.linear_point(&prepared, previous)?;

        match strategy {
            Strategy::Linear => Ok(self.estimate(&prepared, start, timestamp)),
            Strategy::Nonlinear => {
                let refined = self.refine(&prepared, start)?;
                Ok(self.estimate(&prepared, refined, timestamp))
            }
            Strategy::Multilateral => {
                let linear = self.estimate(&prepared, start, timestamp);
                match self.refine(&prepared, start) {
                    Ok(refined) => {
                        let nonlinear = self.estimate(&prepared, refined, timestamp);
                        Ok(self.blend(&prepared, &[linear, nonlinear], timestamp))
                    }
                    Err(err) => {
                        debug!(%err, "nonlinear refinement failed; keeping linear solution");
                        Ok(linear)
                    }
                }
            }
        }
    }

    // ── Preparation ─────────────────────────────────────────────────────────

    fn prepare(&self, samples: &[RangeSample]) -> Result<Prepared, MapError> {
        let mut prepared = Prepared {
            anchors: Vec::with_capacity(samples.len()),
            ranges: Vec::with_capacity(samples.len()),
            weights: Vec::with_capacity(samples.len()),
        };
        for s in samples {
            let valid = s.anchor.is_finite()
                && s.distance.is_finite()
                && s.distance >= 0.0
                && s.error_bound.is_finite()
                && s.error_bound > 0.0;
            if !valid {
                debug!(?s, "skipping invalid range sample");
                continue;
            }
            let e = s.error_bound.max(self.config.min_error_bound);
            prepared.anchors.push(to_vector(s.anchor));
            prepared.ranges.push(s.distance);
            prepared.weights.push(1.0 / (e * e));
        }
        if prepared.len() < 3 {
            return Err(MapError::InsufficientAnchors {
                available: prepared.len(),
            });
        }
        Ok(prepared)
    }

    // ── Linear least squares ────────────────────────────────────────────────

    fn linear(&self, p: &Prepared) -> Result<LinearSolution, MapError> {
        let n = p.len();
        let nf = n as f64;
        let centroid = p
            .anchors
            .iter()
            .fold(Vector3::zeros(), |acc, a| acc + a)
            / nf;
        let mean_sq_anchor = p.anchors.iter().map(|a| a.norm_squared()).sum::<f64>() / nf;
        let mean_sq_range = p.ranges.iter().map(|r| r * r).sum::<f64>() / nf;

        // 2(aᵢ − ā)·p = (‖aᵢ‖² − mean‖a‖²) − (rᵢ² − mean r²)
        let a = DMatrix::from_fn(n, 3, |i, j| 2.0 * (p.anchors[i][j] - centroid[j]));
        let b = DVector::from_fn(n, |i, _| {
            (p.anchors[i].norm_squared() - mean_sq_anchor) - (p.ranges[i] * p.ranges[i] - mean_sq_range)
        });

        let ata = a.transpose() * &a;
        let ata = Matrix3::from_iterator(ata.iter().copied());
        let eigen = ata.symmetric_eigen();
        let mut order = [0usize, 1, 2];
        order.sort_by(|&i, &j| eigen.eigenvalues[j].total_cmp(&eigen.eigenvalues[i]));

        let largest = eigen.eigenvalues[order[0]].max(0.0);
        if largest <= f64::EPSILON {
            return Err(MapError::DegenerateGeometry {
                details: "all anchors coincide".to_string(),
            });
        }
        let ratio = |k: usize| (eigen.eigenvalues[order[k]].max(0.0) / largest).sqrt();
        let tolerance = self.config.degeneracy_tolerance;

        if ratio(1) <= tolerance {
            return Err(MapError::DegenerateGeometry {
                details: format!("anchors are collinear (singular value ratio {:.2e})", ratio(1)),
            });
        }

        if ratio(2) > tolerance {
            let qr = a.qr();
            let qtb = qr.q().transpose() * &b;
            let x = qr
                .r()
                .solve_upper_triangular(&qtb)
                .ok_or_else(|| MapError::DegenerateGeometry {
                    details: "singular triangular factor".to_string(),
                })?;
            let point = Vector3::new(x[0], x[1], x[2]);
            return finite(point).map(|primary| LinearSolution {
                primary,
                mirror: None,
            });
        }

        // Coplanar: solve in the plane, then along the normal.
        let atb = a.transpose() * &b;
        let atb = Vector3::new(atb[0], atb[1], atb[2]);
        let mut in_plane = Vector3::zeros();
        for &k in &order[..2] {
            let v = eigen.eigenvectors.column(k).into_owned();
            in_plane += v * (v.dot(&atb) / eigen.eigenvalues[k]);
        }

        let mut normal = eigen.eigenvectors.column(order[2]).into_owned();
        let sign = [normal.z, normal.y, normal.x]
            .into_iter()
            .find(|c| c.abs() > 1e-9)
            .map_or(1.0, f64::signum);
        normal *= sign;

        let offset = normal.dot(&centroid);
        let foot = in_plane + normal * offset;

        let total_weight: f64 = p.weights.iter().sum();
        let lift_sq = p
            .anchors
            .iter()
            .zip(&p.ranges)
            .zip(&p.weights)
            .map(|((a, r), w)| w * (r * r - (foot - a).norm_squared()))
            .sum::<f64>()
            / total_weight;
        let lift = lift_sq.max(0.0).sqrt();

        let primary = finite(foot + normal * lift)?;
        let mirror = if lift > 1e-12 {
            Some(finite(foot - normal * lift)?)
        } else {
            None
        };
        Ok(LinearSolution { primary, mirror })
    }

    fn linear_point(&self, p: &Prepared, previous: Option<Point3>) -> Result<Vector3<f64>, MapError> {
        let solution = self.linear(p)?;
        let Some(mirror) = solution.mirror else {
            return Ok(solution.primary);
        };

        if let Some(bounds) = &self.bounds {
            let primary_in = bounds.contains_point(to_point(solution.primary));
            let mirror_in = bounds.contains_point(to_point(mirror));
            if primary_in != mirror_in {
                return Ok(if primary_in { solution.primary } else { mirror });
            }
        }
        if let Some(prev) = previous {
            let prev = to_vector(prev);
            if (mirror - prev).norm() < (solution.primary - prev).norm() {
                return Ok(mirror);
            }
        }
        Ok(solution.primary)
    }

    // ── Nonlinear refinement ────────────────────────────────────────────────

    fn refine(&self, p: &Prepared, start: Vector3<f64>) -> Result<Vector3<f64>, MapError> {
        let mut x = start;
        let mut cost = weighted_cost(p, &x);
        let mut lambda = 1e-3;

        for _ in 0..self.config.max_iterations {
            if cost <= 1e-20 {
                return Ok(x);
            }
            let (jtj, grad) = normal_equations(p, &x);
            let mut stepped = false;
            while lambda < 1e12 {
                let mut damped = jtj;
                for i in 0..3 {
                    damped[(i, i)] += lambda * (jtj[(i, i)] + 1e-9);
                }
                let Some(cholesky) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = x + cholesky.solve(&(-grad));
                let candidate_cost = weighted_cost(p, &candidate);
                if candidate_cost < cost {
                    let improvement = cost - candidate_cost;
                    x = candidate;
                    cost = candidate_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    if improvement < self.config.convergence_threshold {
                        return Ok(x);
                    }
                    stepped = true;
                    break;
                }
                lambda *= 10.0;
            }
            if !stepped {
                // No damping level reduces the cost: local minimum.
                return Ok(x);
            }
        }

        Err(MapError::ConvergenceFailure {
            iterations: self.config.max_iterations,
            cost,
        })
    }

    // ── Output ──────────────────────────────────────────────────────────────

    fn estimate(&self, p: &Prepared, x: Vector3<f64>, timestamp: DateTime<Utc>) -> PositionEstimate {
        PositionEstimate {
            position: to_point(x),
            covariance: covariance(p, &x),
            timestamp,
            anchors_used: p.len(),
            residual_rms: residual_rms(p, &x),
        }
    }

    fn blend(&self, p: &Prepared, candidates: &[PositionEstimate], timestamp: DateTime<Utc>) -> PositionEstimate {
        let n = p.len() as f64;
        let mut total = 0.0;
        let mut position = Vector3::zeros();
        let mut cov = Matrix3::zeros();
        for c in candidates {
            let x = to_vector(c.position);
            let c_cov = Matrix3::from_fn(|i, j| c.covariance[i][j]);
            let score = weighted_cost(p, &x) / n + c_cov.trace();
            let w = 1.0 / (score + 1e-12);
            total += w;
            position += x * w;
            cov += c_cov * w;
        }
        let x = position / total;
        let cov = cov / total;
        PositionEstimate {
            position: to_point(x),
            covariance: to_rows(&cov),
            timestamp,
            anchors_used: p.len(),
            residual_rms: residual_rms(p, &x),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

fn to_vector(p: Point3) -> Vector3<f64> {
    Vector3::new(p.x, p.y, p.z)
}

fn to_point(v: Vector3<f64>) -> Point3 {
    Point3::new(v.x, v.y, v.z)
}

fn to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

fn finite(v: Vector3<f64>) -> Result<Vector3<f64>, MapError> {
    if v.iter().all(|c| c.is_finite()) {
        Ok(v)
    } else {
        Err(MapError::DegenerateGeometry {
            details: "ill-conditioned solve produced a non-finite position".to_string(),
        })
    }
}

fn weighted_cost(p: &Prepared, x: &Vector3<f64>) -> f64 {
    p.anchors
        .iter()
        .zip(&p.ranges)
        .zip(&p.weights)
        .map(|((a, r), w)| {
            let res = (x - a).norm() - r;
            w * res * res
        })
        .sum()
}

fn residual_rms(p: &Prepared, x: &Vector3<f64>) -> f64 {
    let sum: f64 = p
        .anchors
        .iter()
        .zip(&p.ranges)
        .map(|(a, r)| ((x - a).norm() - r).powi(2))
        .sum();
    (sum / p.len() as f64).sqrt()
}

/// `JᵀWJ` and `JᵀWr` of the range residuals at `x`.
fn normal_equations(p: &Prepared, x: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let mut jtj = Matrix3::zeros();
    let mut grad = Vector3::zeros();
    for ((a, r), w) in p.anchors.iter().zip(&p.ranges).zip(&p.weights) {
        let diff = x - a;
        let dist = diff.norm();
        if dist < 1e-9 {
            continue;
        }
        let row = diff / dist;
        jtj += row * row.transpose() * *w;
        grad += row * (*w * (dist - r));
    }
    (jtj, grad)
}

/// `(JᵀWJ)⁻¹` at `x`, regularised when near-singular.
fn covariance(p: &Prepared, x: &Vector3<f64>) -> [[f64; 3]; 3] {
    let (fisher, _) = normal_equations(p, x);
    let reg = 1e-6 * fisher.trace().max(1e-12);
    let inverse = (fisher + Matrix3::identity() * reg)
        .try_inverse()
        .unwrap_or_else(|| Matrix3::identity() * 1e6);
    let symmetric = (inverse + inverse.transpose()) * 0.5;
    to_rows(&symmetric)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn exact(anchors: &[Point3], truth: Point3) -> Vec<RangeSample> {
        anchors
            .iter()
            .map(|a| RangeSample::new(*a, a.distance(truth), 0.1))
            .collect()
    }

    fn spatial_anchors() -> Vec<Point3> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.5),
            Point3::new(0.0, 10.0, 2.0),
            Point3::new(10.0, 10.0, 4.0),
            Point3::new(5.0, -3.0, 6.0),
        ]
    }

    fn ceiling_anchors() -> Vec<Point3> {
        vec![
            Point3::new(0.0, 0.0, 2.5),
            Point3::new(10.0, 0.0, 2.5),
            Point3::new(10.0, 10.0, 2.5),
            Point3::new(0.0, 10.0, 2.5),
        ]
    }

    fn solver() -> Trilaterator {
        Trilaterator::new(TrilaterationConfig::default())
    }

    #[test]
    fn zero_noise_linear_and_nonlinear_recover_truth() {
        let truth = Point3::new(3.0, 4.0, 1.5);
        let samples = exact(&spatial_anchors(), truth);
        for strategy in [Strategy::Linear, Strategy::Nonlinear, Strategy::Multilateral] {
            let est = solver().solve_with(strategy, &samples, None, t0()).unwrap();
            assert!(
                est.position.distance(truth) < 1e-6,
                "{strategy}: {:?}",
                est.position
            );
            assert_eq!(est.anchors_used, 5);
            assert!(est.residual_rms < 1e-6);
        }
    }

    #[test]
    fn square_of_anchors_with_equal_ranges_lands_in_centre() {
        let anchors = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(5.0, 5.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
        ];
        let samples: Vec<_> = anchors
            .iter()
            .map(|a| RangeSample::new(*a, 3.54, 0.1))
            .collect();
        let est = solver().solve(&samples, None, t0()).unwrap();
        let target = Point3::new(2.5, 2.5, 0.0);
        assert!(est.position.distance(target) < 0.25, "{:?}", est.position);
        assert!(est.position.z >= 0.0);
    }

    #[test]
    fn coplanar_anchors_prefer_positive_normal_without_context() {
        let truth = Point3::new(4.0, 6.0, 0.5);
        let samples = exact(&ceiling_anchors(), truth);
        let est = solver()
            .solve_with(Strategy::Linear, &samples, None, t0())
            .unwrap();
        // Mirror of z = 0.5 through the z = 2.5 plane.
        assert!((est.position.z - 4.5).abs() < 1e-6);
        assert!((est.position.x - 4.0).abs() < 1e-6);
        assert!((est.position.y - 6.0).abs() < 1e-6);
    }

    #[test]
    fn coplanar_mirror_resolved_by_previous_position() {
        let truth = Point3::new(4.0, 6.0, 0.5);
        let samples = exact(&ceiling_anchors(), truth);
        let est = solver()
            .solve_with(Strategy::Linear, &samples, Some(Point3::new(4.2, 6.1, 0.0)), t0())
            .unwrap();
        assert!(est.position.distance(truth) < 1e-6);
    }

    #[test]
    fn coplanar_mirror_resolved_by_bounds() {
        let truth = Point3::new(4.0, 6.0, 0.5);
        let samples = exact(&ceiling_anchors(), truth);
        let bounded = solver().with_bounds(Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 10.0, 3.0),
        ));
        // Bounds win over a previous position on the wrong side.
        let est = bounded
            .solve(&samples, Some(Point3::new(4.0, 6.0, 4.4)), t0())
            .unwrap();
        assert!(est.position.distance(truth) < 1e-6);
    }

    #[test]
    fn three_anchors_are_solvable() {
        let truth = Point3::new(2.0, 3.0, 0.5);
        let anchors = [
            Point3::new(0.0, 0.0, 3.0),
            Point3::new(8.0, 0.0, 3.0),
            Point3::new(0.0, 8.0, 3.0),
        ];
        let bounded = solver().with_bounds(Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 10.0, 3.0),
        ));
        let est = bounded.solve(&exact(&anchors, truth), None, t0()).unwrap();
        assert!(est.position.distance(truth) < 1e-6);
    }

    #[test]
    fn fewer_than_three_valid_samples_is_insufficient() {
        let samples = vec![
            RangeSample::new(Point3::new(0.0, 0.0, 0.0), 1.0, 0.1),
            RangeSample::new(Point3::new(1.0, 0.0, 0.0), 1.0, 0.1),
            RangeSample::new(Point3::new(0.0, 1.0, 0.0), -1.0, 0.1),
            RangeSample::new(Point3::new(0.0, 0.0, 1.0), f64::NAN, 0.1),
        ];
        let err = solver().solve(&samples, None, t0()).unwrap_err();
        assert_eq!(err, MapError::InsufficientAnchors { available: 2 });
    }

    #[test]
    fn collinear_anchors_are_degenerate() {
        let anchors = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
            Point3::new(15.0, 0.0, 0.0),
        ];
        let samples = exact(&anchors, Point3::new(3.0, 2.0, 0.0));
        let err = solver().solve(&samples, None, t0()).unwrap_err();
        assert!(matches!(err, MapError::DegenerateGeometry { .. }), "{err:?}");
    }

    fn noisy_samples() -> Vec<RangeSample> {
        let truth = Point3::new(3.0, 4.0, 1.5);
        let noise = [0.4, -0.3, 0.15, -0.2, 0.35];
        spatial_anchors()
            .iter()
            .zip(noise)
            .map(|(a, n)| RangeSample::new(*a, a.distance(truth) + n, 0.1))
            .collect()
    }

    #[test]
    fn iteration_cap_reports_convergence_failure() {
        let capped = Trilaterator::new(TrilaterationConfig {
            max_iterations: 1,
            ..TrilaterationConfig::default()
        });
        let err = capped
            .solve_with(Strategy::Nonlinear, &noisy_samples(), None, t0())
            .unwrap_err();
        assert!(matches!(err, MapError::ConvergenceFailure { iterations: 1, .. }), "{err:?}");
    }

    #[test]
    fn multilateral_falls_back_to_linear_when_refinement_fails() {
        let capped = Trilaterator::new(TrilaterationConfig {
            max_iterations: 1,
            ..TrilaterationConfig::default()
        });
        let samples = noisy_samples();
        let blended = capped
            .solve_with(Strategy::Multilateral, &samples, None, t0())
            .unwrap();
        let linear = capped
            .solve_with(Strategy::Linear, &samples, None, t0())
            .unwrap();
        assert_eq!(blended, linear);
    }

    #[test]
    fn nonlinear_does_not_worsen_linear_residual() {
        let samples = noisy_samples();
        let linear = solver()
            .solve_with(Strategy::Linear, &samples, None, t0())
            .unwrap();
        let nonlinear = solver()
            .solve_with(Strategy::Nonlinear, &samples, None, t0())
            .unwrap();
        assert!(nonlinear.residual_rms <= linear.residual_rms + 1e-12);
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let samples = noisy_samples();
        let a = solver().solve(&samples, None, t0()).unwrap();
        let b = solver().solve(&samples, None, t0()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn covariance_is_symmetric_and_positive() {
        let est = solver().solve(&noisy_samples(), None, t0()).unwrap();
        for i in 0..3 {
            assert!(est.covariance[i][i] > 0.0);
            for j in 0..3 {
                assert!((est.covariance[i][j] - est.covariance[j][i]).abs() < 1e-12);
            }
        }
        assert!(est.uncertainty() < 1.0);
    }

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("LLS".parse::<Strategy>().unwrap(), Strategy::Linear);
        assert_eq!("multi".parse::<Strategy>().unwrap(), Strategy::Multilateral);
        assert!("magic".parse::<Strategy>().is_err());
    }
}
