//! Constant-velocity Kalman filter.
//!
//! State `x = [px, py, pz, vx, vy, vz]`, observation `z = [px, py, pz]`.
//!
//! ```text
//! predict:  x ← F·x            P ← F·P·Fᵀ + Q
//! update:   K = P·Hᵀ·(H·P·Hᵀ + R)⁻¹
//!           x ← x + K·(z − H·x)
//!           P ← (I − K·H)·P·(I − K·H)ᵀ + K·R·Kᵀ      (Joseph form)
//! ```
//!
//! `Q` is the discrete white-noise-acceleration model scaled by
//! `process_noise` (acceleration variance, m²/s⁴). `R` is
//! `measurement_noise²·I` plus the covariance reported by the solve.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use palletmap_types::{FilteredState, PositionEstimate, Vec3};
use serde::{Deserialize, Serialize};

use super::{UpdateOutcome, advance};

type Matrix6 = SMatrix<f64, 6, 6>;
type Matrix3x6 = SMatrix<f64, 3, 6>;
type Vector6 = SVector<f64, 6>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanConfig {
    /// Acceleration variance (m²/s⁴).
    #[serde(default = "default_process_noise")]
    pub process_noise: f64,
    /// 1-σ measurement noise floor (metres).
    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f64,
    /// Initial velocity variance ((m/s)²).
    #[serde(default = "default_initial_velocity_variance")]
    pub initial_velocity_variance: f64,
}

fn default_process_noise() -> f64 {
    0.25
}
fn default_measurement_noise() -> f64 {
    0.1
}
fn default_initial_velocity_variance() -> f64 {
    1.0
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: default_process_noise(),
            measurement_noise: default_measurement_noise(),
            initial_velocity_variance: default_initial_velocity_variance(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    config: KalmanConfig,
    x: Vector6,
    p: Matrix6,
    state: Option<FilteredState>,
}

impl KalmanFilter {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            config,
            x: Vector6::zeros(),
            p: Matrix6::zeros(),
            state: None,
        }
    }

    pub fn state(&self) -> Option<&FilteredState> {
        self.state.as_ref()
    }

    pub fn predict(&mut self, dt: f64) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let mut f = Matrix6::identity();
        for i in 0..3 {
            f[(i, i + 3)] = dt;
        }
        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + process_noise(dt, self.config.process_noise);

        state.timestamp = advance(state.timestamp, dt);
        sync(state, &self.x, &self.p);
    }

    pub fn update(&mut self, estimate: &PositionEstimate) -> UpdateOutcome {
        let z = Vector3::new(estimate.position.x, estimate.position.y, estimate.position.z);
        let r = self.measurement_covariance(estimate);

        let Some(state) = self.state.as_mut() else {
            self.x = Vector6::new(z.x, z.y, z.z, 0.0, 0.0, 0.0);
            self.p = Matrix6::zeros();
            self.p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
            for i in 3..6 {
                self.p[(i, i)] = self.config.initial_velocity_variance;
            }
            let mut state = FilteredState {
                position: estimate.position,
                velocity: Vec3::zero(),
                uncertainty: 0.0,
                timestamp: estimate.timestamp,
                last_measurement: estimate.timestamp,
            };
            sync(&mut state, &self.x, &self.p);
            self.state = Some(state);
            return UpdateOutcome::Initialised;
        };

        let h = observation_matrix();
        let s = h * self.p * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            return UpdateOutcome::Rejected;
        };
        let k = self.p * h.transpose() * s_inv;
        let innovation = z - h * self.x;
        self.x += k * innovation;

        let i_kh = Matrix6::identity() - k * h;
        let joseph = i_kh * self.p * i_kh.transpose() + k * r * k.transpose();
        self.p = (joseph + joseph.transpose()) * 0.5;

        state.last_measurement = estimate.timestamp;
        state.timestamp = state.timestamp.max(estimate.timestamp);
        sync(state, &self.x, &self.p);
        UpdateOutcome::Fused
    }

    pub fn covariance_trace(&self) -> f64 {
        self.p[(0, 0)] + self.p[(1, 1)] + self.p[(2, 2)]
    }

    pub fn reset(&mut self) {
        self.x = Vector6::zeros();
        self.p = Matrix6::zeros();
        self.state = None;
    }

    fn measurement_covariance(&self, estimate: &PositionEstimate) -> Matrix3<f64> {
        let floor = self.config.measurement_noise * self.config.measurement_noise;
        let reported = Matrix3::from_fn(|i, j| estimate.covariance[i][j]);
        let reported = if reported.iter().all(|v| v.is_finite()) {
            reported
        } else {
            Matrix3::zeros()
        };
        reported + Matrix3::identity() * floor
    }
}

fn observation_matrix() -> Matrix3x6 {
    let mut h = Matrix3x6::zeros();
    for i in 0..3 {
        h[(i, i)] = 1.0;
    }
    h
}

/// Discrete white-noise-acceleration process covariance.
fn process_noise(dt: f64, q: f64) -> Matrix6 {
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;
    let mut m = Matrix6::zeros();
    for i in 0..3 {
        m[(i, i)] = q * dt4 / 4.0;
        m[(i, i + 3)] = q * dt3 / 2.0;
        m[(i + 3, i)] = q * dt3 / 2.0;
        m[(i + 3, i + 3)] = q * dt2;
    }
    m
}

fn sync(state: &mut FilteredState, x: &Vector6, p: &Matrix6) {
    state.position = Vec3::new(x[0], x[1], x[2]);
    state.velocity = Vec3::new(x[3], x[4], x[5]);
    let trace = p[(0, 0)] + p[(1, 1)] + p[(2, 2)];
    state.uncertainty = (trace.max(0.0) / 3.0).sqrt();
}
