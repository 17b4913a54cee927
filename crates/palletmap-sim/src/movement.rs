//! Pallet movement patterns.
//!
//! | Pattern     | Behaviour                                                    |
//! |-------------|--------------------------------------------------------------|
//! | `static`    | never moves                                                  |
//! | `linear`    | straight line to `to` at `speed`, then stops                 |
//! | `waypoints` | visits `points` in order; optionally loops back to the start |
//! | `random`    | endless random walk inside `area_min..area_max`              |
//!
//! Random legs that would end outside the warehouse or cross an obstacle
//! are redrawn; after [`MAX_ATTEMPTS`] failures the pallet pauses for a
//! step and tries again.

use std::collections::VecDeque;
use std::f64::consts::TAU;

use palletmap_perception::geometry::Geometry;
use palletmap_types::Point3;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

const MAX_ATTEMPTS: usize = 10;

fn default_speed() -> f64 {
    1.0
}
fn default_randomness() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum Movement {
    #[default]
    Static,
    Linear {
        to: Point3,
        #[serde(default = "default_speed")]
        speed: f64,
    },
    Waypoints {
        points: Vec<Point3>,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default)]
        looped: bool,
    },
    Random {
        area_min: Point3,
        area_max: Point3,
        #[serde(default = "default_speed")]
        speed: f64,
        /// 0 keeps heading for uniformly drawn targets; 1 only takes short
        /// random hops from the current position.
        #[serde(default = "default_randomness")]
        randomness: f64,
    },
}

/// Movement state of one pallet.
#[derive(Debug, Clone)]
pub struct Trajectory {
    position: Point3,
    movement: Movement,
    route: VecDeque<Point3>,
}

impl Trajectory {
    pub fn new(start: Point3, movement: Movement) -> Self {
        let route = match &movement {
            Movement::Static | Movement::Random { .. } => VecDeque::new(),
            Movement::Linear { to, .. } => VecDeque::from([*to]),
            Movement::Waypoints { points, .. } => points.iter().copied().collect(),
        };
        Self {
            position: start,
            movement,
            route,
        }
    }

    pub fn position(&self) -> Point3 {
        self.position
    }

    /// True once a finite pattern has reached its last point.
    pub fn is_finished(&self) -> bool {
        match &self.movement {
            Movement::Static => true,
            Movement::Linear { .. } | Movement::Waypoints { looped: false, .. } => {
                self.route.is_empty()
            }
            Movement::Waypoints { looped: true, .. } | Movement::Random { .. } => false,
        }
    }

    fn speed(&self) -> f64 {
        match &self.movement {
            Movement::Static => 0.0,
            Movement::Linear { speed, .. }
            | Movement::Waypoints { speed, .. }
            | Movement::Random { speed, .. } => speed.max(0.0),
        }
    }

    /// Advance by `dt` seconds.
    pub fn advance(&mut self, dt: f64, geometry: &Geometry, rng: &mut StdRng) {
        let mut budget = self.speed() * dt.max(0.0);
        while budget > 0.0 {
            if self.route.is_empty() && !self.refill(geometry, rng) {
                return;
            }
            let Some(&target) = self.route.front() else {
                return;
            };
            let offset = target.sub(self.position);
            let distance = offset.norm();
            if distance <= budget {
                self.position = target;
                budget -= distance;
                self.route.pop_front();
                if let Movement::Waypoints { points, looped: true, .. } = &self.movement
                    && self.route.is_empty()
                {
                    self.route.extend(points.iter().copied());
                }
            } else {
                self.position = self.position.add(offset.scale(budget / distance));
                budget = 0.0;
            }
        }
    }

    /// Queue the next random target. Returns false when nothing was queued.
    fn refill(&mut self, geometry: &Geometry, rng: &mut StdRng) -> bool {
        let Movement::Random {
            area_min,
            area_max,
            randomness,
            ..
        } = &self.movement
        else {
            return false;
        };
        let (min, max) = (*area_min, *area_max);
        let randomness = randomness.clamp(0.0, 1.0);

        for _ in 0..MAX_ATTEMPTS {
            let candidate = if rng.gen_bool(randomness) {
                let angle = rng.gen_range(0.0..TAU);
                let hop = rng.gen_range(1.0..5.0);
                Point3::new(
                    self.position.x + hop * angle.cos(),
                    self.position.y + hop * angle.sin(),
                    self.position.z,
                )
            } else {
                Point3::new(
                    uniform(rng, min.x, max.x),
                    uniform(rng, min.y, max.y),
                    self.position.z,
                )
            };
            let inside = (min.x..=max.x).contains(&candidate.x)
                && (min.y..=max.y).contains(&candidate.y);
            if inside && geometry.path_is_free(self.position, candidate) {
                self.route.push_back(candidate);
                return true;
            }
        }
        false
    }
}

fn uniform(rng: &mut StdRng, lo: f64, hi: f64) -> f64 {
    if hi > lo { rng.gen_range(lo..hi) } else { lo }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palletmap_perception::geometry::{Aabb, Obstacle};
    use rand::SeedableRng;

    fn geometry() -> Geometry {
        Geometry::new(Aabb::new(Point3::zero(), Point3::new(20.0, 10.0, 5.0)))
    }

    #[test]
    fn static_never_moves() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut t = Trajectory::new(Point3::new(1.0, 1.0, 0.2), Movement::Static);
        t.advance(10.0, &geometry(), &mut rng);
        assert_eq!(t.position(), Point3::new(1.0, 1.0, 0.2));
        assert!(t.is_finished());
    }

    #[test]
    fn linear_moves_at_speed_then_stops() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut t = Trajectory::new(
            Point3::new(0.0, 1.0, 0.2),
            Movement::Linear {
                to: Point3::new(4.0, 1.0, 0.2),
                speed: 2.0,
            },
        );
        t.advance(1.0, &geometry(), &mut rng);
        assert!((t.position().x - 2.0).abs() < 1e-12);
        t.advance(5.0, &geometry(), &mut rng);
        assert_eq!(t.position(), Point3::new(4.0, 1.0, 0.2));
        assert!(t.is_finished());
    }

    #[test]
    fn looped_waypoints_wrap_around() {
        let mut rng = StdRng::seed_from_u64(1);
        let points = vec![Point3::new(2.0, 0.0, 0.0), Point3::new(0.0, 0.0, 0.0)];
        let mut t = Trajectory::new(
            Point3::zero(),
            Movement::Waypoints {
                points,
                speed: 1.0,
                looped: true,
            },
        );
        // 5 m along a 4 m loop.
        t.advance(5.0, &geometry(), &mut rng);
        assert!((t.position().x - 1.0).abs() < 1e-12);
        assert!(!t.is_finished());
    }

    #[test]
    fn random_walk_stays_in_area_and_out_of_obstacles() {
        let mut g = geometry();
        g.obstacles.push(Obstacle {
            id: "rack".into(),
            kind: "shelf".into(),
            bounds: Aabb::new(Point3::new(8.0, 0.0, 0.0), Point3::new(12.0, 10.0, 3.0)),
        });
        let mut rng = StdRng::seed_from_u64(7);
        let mut t = Trajectory::new(
            Point3::new(2.0, 5.0, 0.2),
            Movement::Random {
                area_min: Point3::new(0.0, 0.0, 0.0),
                area_max: Point3::new(20.0, 10.0, 1.0),
                speed: 1.5,
                randomness: 0.5,
            },
        );
        for _ in 0..500 {
            t.advance(0.1, &g, &mut rng);
            let p = t.position();
            assert!(g.is_free(p), "{p:?}");
            assert!(p.x < 8.0, "crossed the rack: {p:?}");
        }
    }
}
