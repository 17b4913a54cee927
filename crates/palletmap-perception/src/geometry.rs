//! Warehouse Geometry & Space Model.
//!
//! Static description of the physical space: warehouse bounds, obstacles
//! (shelves, walls, columns), UWB anchors, RFID readers and the coverage
//! polygon owned by each edge node. Read-only for the lifetime of a run.
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aabb`]         | Axis-aligned box: warehouse bounds and obstacles.       |
//! | [`Polygon`]      | Edge-node coverage region in the (x, y) plane.          |
//! | [`Anchor`]       | Fixed UWB anchor with its noise profile.                |
//! | [`RfidReader`]   | Fixed RFID reader with its path-loss model.             |
//! | [`Geometry`]     | Everything above, plus per-edge coverage assignment.    |
//!
//! # Example
//!
//! ```rust
//! use palletmap_perception::geometry::{Aabb, Polygon};
//! use palletmap_types::Point3;
//!
//! let bounds = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(20.0, 10.0, 6.0));
//! assert!(bounds.contains_point(Point3::new(5.0, 5.0, 1.0)));
//!
//! let dock = Polygon::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]);
//! assert!(dock.contains(5.0, 5.0));
//! assert!(dock.contains(10.0, 5.0)); // boundary counts as covered
//! assert!(!dock.contains_interior(10.0, 5.0, 0.05));
//! ```

use palletmap_types::{AnchorId, EdgeNodeId, Point3, ReaderId};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Return the centre point of the box.
    pub fn centre(&self) -> Point3 {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: Point3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` overlaps (intersects or touches) this box.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// True when the straight segment `a → b` touches the box (slab test).
    pub fn intersects_segment(&self, a: Point3, b: Point3) -> bool {
        let d = b.sub(a);
        let mut t_enter = 0.0_f64;
        let mut t_exit = 1.0_f64;
        let axes = [
            (a.x, d.x, self.min.x, self.max.x),
            (a.y, d.y, self.min.y, self.max.y),
            (a.z, d.z, self.min.z, self.max.z),
        ];
        for (origin, dir, lo, hi) in axes {
            if dir.abs() < 1e-12 {
                if origin < lo || origin > hi {
                    return false;
                }
                continue;
            }
            let inv = 1.0 / dir;
            let (mut ta, mut tb) = ((lo - origin) * inv, (hi - origin) * inv);
            if ta > tb {
                std::mem::swap(&mut ta, &mut tb);
            }
            t_enter = t_enter.max(ta);
            t_exit = t_exit.min(tb);
            if t_enter > t_exit {
                return false;
            }
        }
        true
    }

    /// True when both corners are finite and ordered.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min.x <= self.max.x
            && self.min.y <= self.max.y
            && self.min.z <= self.max.z
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Polygon
// ────────────────────────────────────────────────────────────────────────────

/// A simple polygon in the horizontal (x, y) plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon {
    vertices: Vec<[f64; 2]>,
}

impl Polygon {
    pub fn new(vertices: Vec<[f64; 2]>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    /// A polygon needs at least three finite vertices to enclose an area.
    pub fn is_valid(&self) -> bool {
        self.vertices.len() >= 3
            && self
                .vertices
                .iter()
                .all(|v| v[0].is_finite() && v[1].is_finite())
    }

    fn edges(&self) -> impl Iterator<Item = ([f64; 2], [f64; 2])> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// True when `(x, y)` lies inside the polygon or on its boundary.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.distance_to_boundary(x, y) <= 1e-9 {
            return true;
        }
        // Even-odd ray casting towards +x.
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a[1] > y) != (b[1] > y) {
                let x_cross = a[0] + (y - a[1]) * (b[0] - a[0]) / (b[1] - a[1]);
                if x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// True when `(x, y)` is inside the polygon and farther than `margin`
    /// from every edge.
    pub fn contains_interior(&self, x: f64, y: f64, margin: f64) -> bool {
        self.contains(x, y) && self.distance_to_boundary(x, y) > margin
    }

    /// Shortest distance from `(x, y)` to any polygon edge.
    pub fn distance_to_boundary(&self, x: f64, y: f64) -> f64 {
        self.edges()
            .map(|(a, b)| point_segment_distance([x, y], a, b))
            .fold(f64::INFINITY, f64::min)
    }
}

impl From<Vec<[f64; 2]>> for Polygon {
    fn from(vertices: Vec<[f64; 2]>) -> Self {
        Self::new(vertices)
    }
}

fn point_segment_distance(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f64::EPSILON {
        0.0
    } else {
        (((p[0] - a[0]) * dx + (p[1] - a[1]) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt()
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors
// ────────────────────────────────────────────────────────────────────────────

/// Measurement-noise profile of a UWB anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseProfile {
    /// 1-σ Gaussian range noise (metres).
    #[serde(default = "default_std_dev")]
    pub std_dev: f64,
    /// Probability that a single range is a non-line-of-sight outlier.
    #[serde(default)]
    pub outlier_probability: f64,
    /// Ranges beyond this distance are not reported (metres).
    #[serde(default = "default_max_range")]
    pub max_range: f64,
}

fn default_std_dev() -> f64 {
    0.1
}
fn default_max_range() -> f64 {
    100.0
}

impl Default for NoiseProfile {
    fn default() -> Self {
        Self {
            std_dev: default_std_dev(),
            outlier_probability: 0.0,
            max_range: default_max_range(),
        }
    }
}

/// A fixed UWB anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub position: Point3,
    #[serde(default)]
    pub noise: NoiseProfile,
}

/// A fixed RFID reader.
///
/// Received signal strength follows the log-distance path-loss model
/// `rssi(d) = rssi_at_1m − 10·n·log10(d)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfidReader {
    pub id: ReaderId,
    pub position: Point3,
    #[serde(default = "default_read_range")]
    pub read_range: f64,
    #[serde(default = "default_rssi_at_1m")]
    pub rssi_at_1m: f64,
    #[serde(default = "default_path_loss_exponent")]
    pub path_loss_exponent: f64,
}

fn default_read_range() -> f64 {
    5.0
}
fn default_rssi_at_1m() -> f64 {
    -45.0
}
fn default_path_loss_exponent() -> f64 {
    2.0
}

impl RfidReader {
    /// Expected RSSI (dBm) for a tag at `distance` metres.
    pub fn rssi_at(&self, distance: f64) -> f64 {
        self.rssi_at_1m - 10.0 * self.path_loss_exponent * distance.max(0.01).log10()
    }

    /// Coarse range (metres) implied by an RSSI reading.
    pub fn range_from_rssi(&self, rssi_dbm: f64) -> f64 {
        let exponent = (self.rssi_at_1m - rssi_dbm) / (10.0 * self.path_loss_exponent.max(0.1));
        10f64.powf(exponent)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Obstacles & coverage
// ────────────────────────────────────────────────────────────────────────────

/// A static obstacle (shelf, wall, column, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    pub bounds: Aabb,
}

/// The region and sensors owned by one edge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCoverage {
    pub node: EdgeNodeId,
    pub polygon: Polygon,
    #[serde(default)]
    pub anchors: Vec<AnchorId>,
    #[serde(default)]
    pub readers: Vec<ReaderId>,
}

// ────────────────────────────────────────────────────────────────────────────
// Geometry
// ────────────────────────────────────────────────────────────────────────────

/// The full static model of the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub bounds: Aabb,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
    #[serde(default)]
    pub readers: Vec<RfidReader>,
    #[serde(default)]
    pub edges: Vec<EdgeCoverage>,
}

impl Geometry {
    /// Geometry with only bounds; sensors and obstacles are added by the
    /// caller.
    pub fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            obstacles: Vec::new(),
            anchors: Vec::new(),
            readers: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn anchor(&self, id: &AnchorId) -> Option<&Anchor> {
        self.anchors.iter().find(|a| &a.id == id)
    }

    pub fn reader(&self, id: &ReaderId) -> Option<&RfidReader> {
        self.readers.iter().find(|r| &r.id == id)
    }

    pub fn edge(&self, node: &EdgeNodeId) -> Option<&EdgeCoverage> {
        self.edges.iter().find(|e| &e.node == node)
    }

    /// True when `p` lies within the warehouse bounds.
    pub fn in_bounds(&self, p: Point3) -> bool {
        self.bounds.contains_point(p)
    }

    /// True when `p` is inside the bounds and not inside any obstacle.
    pub fn is_free(&self, p: Point3) -> bool {
        self.in_bounds(p) && !self.obstacles.iter().any(|o| o.bounds.contains_point(p))
    }

    /// True when the straight move `from → to` stays in bounds and never
    /// touches an obstacle.
    pub fn path_is_free(&self, from: Point3, to: Point3) -> bool {
        self.in_bounds(to)
            && !self
                .obstacles
                .iter()
                .any(|o| o.bounds.intersects_segment(from, to))
    }

    /// The slice of the geometry an edge node works with: its own anchors,
    /// readers and coverage, plus the shared bounds and obstacles.
    ///
    /// Returns `None` when `node` has no coverage entry.
    pub fn for_edge(&self, node: &EdgeNodeId) -> Option<Geometry> {
        let coverage = self.edge(node)?.clone();
        Some(Geometry {
            bounds: self.bounds,
            obstacles: self.obstacles.clone(),
            anchors: self
                .anchors
                .iter()
                .filter(|a| coverage.anchors.contains(&a.id))
                .cloned()
                .collect(),
            readers: self
                .readers
                .iter()
                .filter(|r| coverage.readers.contains(&r.id))
                .cloned()
                .collect(),
            edges: vec![coverage],
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn square(size: f64) -> Polygon {
        Polygon::new(vec![[0.0, 0.0], [size, 0.0], [size, size], [0.0, size]])
    }

    fn warehouse() -> Geometry {
        let mut g = Geometry::new(Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(20.0, 10.0, 5.0),
        ));
        g.obstacles.push(Obstacle {
            id: "shelf-1".to_string(),
            kind: "shelf".to_string(),
            bounds: Aabb::new(Point3::new(8.0, 2.0, 0.0), Point3::new(9.0, 8.0, 3.0)),
        });
        for (i, (x, y)) in [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]
            .into_iter()
            .enumerate()
        {
            g.anchors.push(Anchor {
                id: AnchorId::new(format!("uwb_{i}")),
                position: Point3::new(x, y, 2.5),
                noise: NoiseProfile::default(),
            });
        }
        g.readers.push(RfidReader {
            id: ReaderId::from("rfid_1"),
            position: Point3::new(5.0, 5.0, 1.0),
            read_range: 5.0,
            rssi_at_1m: -45.0,
            path_loss_exponent: 2.0,
        });
        g.edges.push(EdgeCoverage {
            node: EdgeNodeId::from("edge-west"),
            polygon: square(10.0),
            anchors: vec![AnchorId::from("uwb_0"), AnchorId::from("uwb_1")],
            readers: vec![ReaderId::from("rfid_1")],
        });
        g
    }

    // ── Aabb ────────────────────────────────────────────────────────────────

    #[test]
    fn aabb_normalises_min_max() {
        let b = Aabb::new(Point3::new(2.0, 2.0, 2.0), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.max, Point3::new(2.0, 2.0, 2.0));
        assert!(b.is_valid());
    }

    #[test]
    fn aabb_contains_boundary_point() {
        let b = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert!(b.contains_point(Point3::new(1.0, 1.0, 1.0)));
        assert!(!b.contains_point(Point3::new(1.0, 1.0, 1.1)));
    }

    #[test]
    fn aabb_segment_through_box_intersects() {
        let b = Aabb::new(Point3::new(4.0, -1.0, -1.0), Point3::new(5.0, 1.0, 1.0));
        assert!(b.intersects_segment(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)));
        assert!(!b.intersects_segment(Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)));
        assert!(!b.intersects_segment(Point3::new(0.0, 2.0, 0.0), Point3::new(10.0, 2.0, 0.0)));
    }

    // ── Polygon ─────────────────────────────────────────────────────────────

    #[test]
    fn polygon_contains_interior_and_boundary() {
        let p = square(10.0);
        assert!(p.contains(5.0, 5.0));
        assert!(p.contains(0.0, 5.0));
        assert!(p.contains(10.0, 10.0));
        assert!(!p.contains(10.5, 5.0));
    }

    #[test]
    fn polygon_concave_notch_is_outside() {
        // U-shape with a notch between x=4..6 above y=4.
        let u = Polygon::new(vec![
            [0.0, 0.0],
            [10.0, 0.0],
            [10.0, 10.0],
            [6.0, 10.0],
            [6.0, 4.0],
            [4.0, 4.0],
            [4.0, 10.0],
            [0.0, 10.0],
        ]);
        assert!(u.contains(2.0, 8.0));
        assert!(!u.contains(5.0, 8.0));
        assert!(u.contains(5.0, 2.0));
    }

    #[test]
    fn interior_excludes_points_within_margin() {
        let p = square(10.0);
        assert!(p.contains_interior(5.0, 5.0, 0.1));
        assert!(!p.contains_interior(9.95, 5.0, 0.1));
        assert!((p.distance_to_boundary(9.0, 5.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let line = Polygon::new(vec![[0.0, 0.0], [1.0, 1.0]]);
        assert!(!line.is_valid());
        assert!(!line.contains(0.5, 0.5));
    }

    // ── Sensors ─────────────────────────────────────────────────────────────

    #[test]
    fn rssi_range_inverts_path_loss() {
        let g = warehouse();
        let reader = g.reader(&ReaderId::from("rfid_1")).unwrap();
        let rssi = reader.rssi_at(3.0);
        assert!((reader.range_from_rssi(rssi) - 3.0).abs() < 1e-9);
        assert!(reader.rssi_at(4.0) < reader.rssi_at(1.0));
    }

    // ── Geometry ────────────────────────────────────────────────────────────

    #[test]
    fn obstacles_block_free_space_and_paths() {
        let g = warehouse();
        assert!(g.is_free(Point3::new(2.0, 2.0, 1.0)));
        assert!(!g.is_free(Point3::new(8.5, 5.0, 1.0)));
        assert!(!g.is_free(Point3::new(25.0, 5.0, 1.0)));
        assert!(!g.path_is_free(Point3::new(7.0, 5.0, 1.0), Point3::new(10.0, 5.0, 1.0)));
        assert!(g.path_is_free(Point3::new(7.0, 9.0, 1.0), Point3::new(10.0, 9.0, 1.0)));
    }

    #[test]
    fn for_edge_keeps_only_assigned_sensors() {
        let g = warehouse();
        let sub = g.for_edge(&EdgeNodeId::from("edge-west")).unwrap();
        assert_eq!(sub.anchors.len(), 2);
        assert_eq!(sub.readers.len(), 1);
        assert_eq!(sub.edges.len(), 1);
        assert_eq!(sub.obstacles.len(), 1);
        assert!(g.for_edge(&EdgeNodeId::from("edge-ghost")).is_none());
    }

    #[test]
    fn noise_profile_defaults_apply_when_omitted() {
        let anchor: Anchor = serde_json::from_str(
            r#"{"id":"uwb_9","position":{"x":1.0,"y":2.0,"z":3.0}}"#,
        )
        .unwrap();
        assert_eq!(anchor.noise, NoiseProfile::default());
    }
}
