//! Particle filter over position and velocity.
//!
//! Each particle carries a position, a velocity and a weight. `predict`
//! perturbs velocity and position with Gaussian motion noise; when a
//! [`Geometry`] is attached, a move that leaves the bounds or crosses an
//! obstacle is re-drawn, and the particle stays put if no valid move is
//! found. `update` reweights by the Gaussian likelihood of the measured
//! position and resamples systematically once the effective sample size
//! drops below `resample_fraction · N`. The output is the weighted mean.

use std::sync::Arc;

use palletmap_types::{FilteredState, Point3, PositionEstimate, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{UpdateOutcome, advance};
use crate::geometry::Geometry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleConfig {
    #[serde(default = "default_particles")]
    pub particles: usize,
    /// Position diffusion (m per √s).
    #[serde(default = "default_motion_noise")]
    pub motion_noise: f64,
    /// Velocity diffusion (m/s per √s).
    #[serde(default = "default_velocity_noise")]
    pub velocity_noise: f64,
    /// 1-σ measurement noise floor (metres).
    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f64,
    /// Resample when the effective sample size falls below this share of N.
    #[serde(default = "default_resample_fraction")]
    pub resample_fraction: f64,
    /// Keep particles inside bounds and out of obstacles.
    #[serde(default = "default_constrained")]
    pub constrained: bool,
    /// Redraw attempts for a blocked move.
    #[serde(default = "default_max_redraws")]
    pub max_redraws: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_particles() -> usize {
    500
}
fn default_motion_noise() -> f64 {
    0.2
}
fn default_velocity_noise() -> f64 {
    0.2
}
fn default_measurement_noise() -> f64 {
    0.2
}
fn default_resample_fraction() -> f64 {
    0.5
}
fn default_constrained() -> bool {
    true
}
fn default_max_redraws() -> usize {
    8
}
fn default_seed() -> u64 {
    42
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            particles: default_particles(),
            motion_noise: default_motion_noise(),
            velocity_noise: default_velocity_noise(),
            measurement_noise: default_measurement_noise(),
            resample_fraction: default_resample_fraction(),
            constrained: default_constrained(),
            max_redraws: default_max_redraws(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Particle {
    position: Point3,
    velocity: Vec3,
    weight: f64,
}

#[derive(Debug, Clone)]
pub struct ParticleFilter {
    config: ParticleConfig,
    geometry: Option<Arc<Geometry>>,
    rng: StdRng,
    particles: Vec<Particle>,
    state: Option<FilteredState>,
}

impl ParticleFilter {
    pub fn new(config: ParticleConfig, geometry: Option<Arc<Geometry>>, seed: u64) -> Self {
        Self {
            particles: Vec::with_capacity(config.particles),
            config,
            geometry,
            rng: StdRng::seed_from_u64(seed),
            state: None,
        }
    }

    pub fn state(&self) -> Option<&FilteredState> {
        self.state.as_ref()
    }

    pub fn predict(&mut self, dt: f64) {
        if self.state.is_none() {
            return;
        }
        let sqrt_dt = dt.max(0.0).sqrt();
        let pos_sd = self.config.motion_noise * sqrt_dt;
        let vel_sd = self.config.velocity_noise * sqrt_dt;
        let constraint = self.constraint();

        for i in 0..self.particles.len() {
            let current = self.particles[i];
            let mut moved = None;
            for _ in 0..self.config.max_redraws.max(1) {
                let velocity = current.velocity.add(gaussian3(&mut self.rng, vel_sd));
                let position = current
                    .position
                    .add(velocity.scale(dt))
                    .add(gaussian3(&mut self.rng, pos_sd));
                let allowed = constraint
                    .as_ref()
                    .is_none_or(|g| g.path_is_free(current.position, position));
                if allowed {
                    moved = Some((position, velocity));
                    break;
                }
            }
            let particle = &mut self.particles[i];
            match moved {
                Some((position, velocity)) => {
                    particle.position = position;
                    particle.velocity = velocity;
                }
                None => particle.velocity = Vec3::zero(),
            }
        }

        if let Some(state) = self.state.as_mut() {
            state.timestamp = advance(state.timestamp, dt);
        }
        self.refresh_state();
    }

    pub fn update(&mut self, estimate: &PositionEstimate) -> UpdateOutcome {
        if self.state.is_none() {
            self.initialise(estimate);
            return UpdateOutcome::Initialised;
        }

        let sigma_sq = self.config.measurement_noise.powi(2) + estimate.uncertainty().powi(2);
        let log_weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| {
                let d = p.position.sub(estimate.position);
                p.weight.ln() - d.dot(d) / (2.0 * sigma_sq)
            })
            .collect();
        let max_log = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            self.initialise(estimate);
            return UpdateOutcome::Reseeded;
        }
        // Likelihood far below every particle: the cloud lost the tag.
        let best_distance_sq = self
            .particles
            .iter()
            .map(|p| {
                let d = p.position.sub(estimate.position);
                d.dot(d)
            })
            .fold(f64::INFINITY, f64::min);
        if best_distance_sq / (2.0 * sigma_sq) > 700.0 {
            self.initialise(estimate);
            return UpdateOutcome::Reseeded;
        }

        let mut total = 0.0;
        for (p, lw) in self.particles.iter_mut().zip(&log_weights) {
            p.weight = (lw - max_log).exp();
            total += p.weight;
        }
        for p in &mut self.particles {
            p.weight /= total;
        }

        let ess = 1.0 / self.particles.iter().map(|p| p.weight * p.weight).sum::<f64>();
        if ess < self.config.resample_fraction * self.particles.len() as f64 {
            self.systematic_resample();
        }

        if let Some(state) = self.state.as_mut() {
            state.last_measurement = estimate.timestamp;
            state.timestamp = state.timestamp.max(estimate.timestamp);
        }
        self.refresh_state();
        UpdateOutcome::Fused
    }

    pub fn covariance_trace(&self) -> f64 {
        let Some(state) = self.state.as_ref() else {
            return 0.0;
        };
        self.particles
            .iter()
            .map(|p| {
                let d = p.position.sub(state.position);
                p.weight * d.dot(d)
            })
            .sum()
    }

    pub fn reset(&mut self) {
        self.particles.clear();
        self.state = None;
    }

    fn constraint(&self) -> Option<Arc<Geometry>> {
        if self.config.constrained {
            self.geometry.clone()
        } else {
            None
        }
    }

    fn initialise(&mut self, estimate: &PositionEstimate) {
        let n = self.config.particles.max(1);
        let spread = self.config.measurement_noise.max(estimate.uncertainty());
        let constraint = self.constraint();
        let weight = 1.0 / n as f64;

        self.particles.clear();
        for _ in 0..n {
            let mut position = estimate.position;
            for _ in 0..self.config.max_redraws.max(1) {
                let candidate = estimate.position.add(gaussian3(&mut self.rng, spread));
                if constraint.as_ref().is_none_or(|g| g.is_free(candidate)) {
                    position = candidate;
                    break;
                }
            }
            let velocity = gaussian3(&mut self.rng, self.config.velocity_noise);
            self.particles.push(Particle {
                position,
                velocity,
                weight,
            });
        }

        self.state = Some(FilteredState {
            position: estimate.position,
            velocity: Vec3::zero(),
            uncertainty: 0.0,
            timestamp: estimate.timestamp,
            last_measurement: estimate.timestamp,
        });
        self.refresh_state();
    }

    /// O(N) systematic resampling with a single uniform draw.
    fn systematic_resample(&mut self) {
        let n = self.particles.len();
        if n == 0 {
            return;
        }
        let step = 1.0 / n as f64;
        let start = self.rng.gen_range(0.0..step);
        let mut resampled = Vec::with_capacity(n);
        let mut cumulative = self.particles[0].weight;
        let mut j = 0;
        for i in 0..n {
            let target = start + i as f64 * step;
            while target > cumulative && j + 1 < n {
                j += 1;
                cumulative += self.particles[j].weight;
            }
            resampled.push(Particle {
                weight: step,
                ..self.particles[j]
            });
        }
        self.particles = resampled;
    }

    fn refresh_state(&mut self) {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if total <= 0.0 || !total.is_finite() {
            return;
        }
        let mean = self
            .particles
            .iter()
            .fold(Vec3::zero(), |acc, p| acc.add(p.position.scale(p.weight)))
            .scale(1.0 / total);
        let velocity = self
            .particles
            .iter()
            .fold(Vec3::zero(), |acc, p| acc.add(p.velocity.scale(p.weight)))
            .scale(1.0 / total);
        let variance = self
            .particles
            .iter()
            .map(|p| {
                let d = p.position.sub(mean);
                p.weight * d.dot(d)
            })
            .sum::<f64>()
            / total;

        if let Some(state) = self.state.as_mut() {
            state.position = mean;
            state.velocity = velocity;
            state.uncertainty = (variance / 3.0).sqrt();
        }
    }
}

fn gaussian3(rng: &mut StdRng, sd: f64) -> Vec3 {
    let x: f64 = rng.sample(StandardNormal);
    let y: f64 = rng.sample(StandardNormal);
    let z: f64 = rng.sample(StandardNormal);
    Vec3::new(x * sd, y * sd, z * sd)
}
