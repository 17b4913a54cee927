//! `palletmap-types` – shared data model for the positioning pipeline.
//!
//! Everything that crosses a crate boundary lives here: identifiers, raw
//! sensor readings, per-tag estimates, the [`MapSegment`] wire payload, the
//! [`Diagnostic`] health reports and the global [`MapError`] taxonomy.

use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector in the warehouse frame (metres, or metres per second for
/// velocities).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Positions and vectors share one representation.
pub type Point3 = Vec3;

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, k: f64) -> Self {
        Self::new(self.x * k, self.y * k, self.z * k)
    }

    pub fn dot(self, rhs: Self) -> f64 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Euclidean distance to `other`.
    pub fn distance(self, other: Self) -> f64 {
        self.sub(other).norm()
    }

    /// Distance in the horizontal (x, y) plane only.
    pub fn planar_distance(self, other: Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// True when every component is finite.
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_array(a: [f64; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Logical identity of a tracked pallet or item.
    TagId
);
string_id!(
    /// Identity of a fixed UWB anchor.
    AnchorId
);
string_id!(
    /// Identity of a fixed RFID reader.
    ReaderId
);
string_id!(
    /// Identity of an edge processing node.
    EdgeNodeId
);

impl TagId {
    /// Identity assigned to a UWB tag that is not in the registry.
    pub fn from_uwb(uwb_id: &str) -> Self {
        Self(format!("uwb:{uwb_id}"))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Time helpers
// ────────────────────────────────────────────────────────────────────────────

/// Signed number of seconds from `earlier` to `later`.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(us) => us as f64 * 1e-6,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}

/// Convert a (possibly fractional) number of seconds into a [`TimeDelta`].
pub fn delta_from_secs(secs: f64) -> TimeDelta {
    TimeDelta::microseconds((secs * 1e6).round() as i64)
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor ingress
// ────────────────────────────────────────────────────────────────────────────

/// One anchor-to-tag distance sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub anchor: AnchorId,
    /// UWB identifier of the ranged tag, when the driver could decode it.
    pub uwb_id: Option<String>,
    /// Measured range in metres.
    pub distance: f64,
    /// Estimated 1-σ error of `distance` in metres.
    pub error_bound: f64,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// An RFID reader's observation of a tag identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub reader: ReaderId,
    /// EPC / RFID identifier, when the reader could decode it.
    pub rfid_id: Option<String>,
    /// Received signal strength (dBm).
    pub rssi_dbm: f64,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// Anything a sensor driver can hand to an edge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum SensorReading {
    Range(Measurement),
    Detection(DetectionEvent),
}

impl SensorReading {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SensorReading::Range(m) => m.timestamp,
            SensorReading::Detection(d) => d.timestamp,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Estimates
// ────────────────────────────────────────────────────────────────────────────

/// Output of one trilateration solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEstimate {
    pub position: Point3,
    /// Row-major 3×3 position covariance (m²).
    pub covariance: [[f64; 3]; 3],
    pub timestamp: DateTime<Utc>,
    /// Number of ranges that contributed to the solve.
    pub anchors_used: usize,
    /// RMS of the range residuals at the solution (metres).
    pub residual_rms: f64,
}

impl PositionEstimate {
    /// Scalar 1-σ uncertainty: `sqrt(trace(P) / 3)`.
    pub fn uncertainty(&self) -> f64 {
        let trace = self.covariance[0][0] + self.covariance[1][1] + self.covariance[2][2];
        (trace.max(0.0) / 3.0).sqrt()
    }
}

/// Smoothed per-tag state owned by one temporal filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredState {
    pub position: Point3,
    pub velocity: Vec3,
    /// Scalar 1-σ position uncertainty (metres).
    pub uncertainty: f64,
    /// Time the state refers to (advanced by predictions).
    pub timestamp: DateTime<Utc>,
    /// Time of the last measurement fused into the state.
    pub last_measurement: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// A known pallet and the physical identifiers attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tag_id: TagId,
    #[serde(default)]
    pub uwb_id: Option<String>,
    #[serde(default)]
    pub rfid_id: Option<String>,
    #[serde(default)]
    pub pallet_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Wire payload
// ────────────────────────────────────────────────────────────────────────────

/// One tag's state as reported by an edge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentEntry {
    pub tag_id: TagId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pallet_id: Option<String>,
    pub position: Point3,
    pub uncertainty: f64,
    pub velocity: Vec3,
    pub last_seen: DateTime<Utc>,
}

/// One edge node's local view of the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MapSegment {
    pub edge_node: EdgeNodeId,
    /// Strictly increasing per edge node; bumped on every emission.
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    /// Coverage polygon in the (x, y) plane, counter-clockwise or clockwise.
    pub coverage: Vec<[f64; 2]>,
    pub entries: Vec<SegmentEntry>,
}

/// Lifecycle of a tag in the global map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Active,
    Stale,
}

// ────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ────────────────────────────────────────────────────────────────────────────

/// Periodic health report of one edge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeStatus {
    pub edge_node: EdgeNodeId,
    /// Sequence number of the most recent segment (0 before the first).
    pub sequence: u64,
    pub tracked_tags: usize,
    /// Entries in the most recent segment.
    pub emitted_tags: usize,
    /// Readings discarded at ingress (unknown sensor, missing id, bad value).
    pub dropped_readings: u64,
    pub failed_solves: u64,
    pub rejected_estimates: u64,
    pub filter_resets: u64,
    pub last_emitted_at: Option<DateTime<Utc>>,
}

/// Outcome counters of one central fusion cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub segments_received: usize,
    pub segments_fused: usize,
    pub malformed_segments: usize,
    pub sequence_regressions: usize,
    pub stale_reports: usize,
    pub conflicts: usize,
    pub active_tags: usize,
    pub stale_tags: usize,
}

impl CycleReport {
    /// Total number of rejected segments and reports.
    pub fn rejections(&self) -> usize {
        self.malformed_segments + self.sequence_regressions + self.stale_reports
    }
}

/// Message published on the diagnostics topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    EdgeStatus(EdgeStatus),
    FusionCycle(CycleReport),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy spanning trilateration, filtering, fusion and transport.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapError {
    #[error("Insufficient anchors: {available} valid ranges, at least 3 required")]
    InsufficientAnchors { available: usize },

    #[error("Degenerate anchor geometry: {details}")]
    DegenerateGeometry { details: String },

    #[error("No convergence after {iterations} iterations (cost {cost:.3e})")]
    ConvergenceFailure { iterations: usize, cost: f64 },

    #[error("Filter diverged for {tag}: covariance trace {trace:.3e}")]
    FilterDivergence { tag: TagId, trace: f64 },

    #[error("Stale report for {tag}: {reported} is older than {accepted}")]
    StaleReport {
        tag: TagId,
        reported: DateTime<Utc>,
        accepted: DateTime<Utc>,
    },

    #[error("Sequence regression from {edge_node}: received {received}, last accepted {last}")]
    SequenceRegression {
        edge_node: EdgeNodeId,
        received: u64,
        last: u64,
    },

    #[error("Malformed segment: {0}")]
    MalformedSegment(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn vec3_distance_and_planar_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 12.0);
        assert!((a.distance(b) - 13.0).abs() < 1e-12);
        assert!((a.planar_distance(b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn unregistered_uwb_tag_gets_prefixed_identity() {
        assert_eq!(TagId::from_uwb("0xA1").as_str(), "uwb:0xA1");
    }

    #[test]
    fn seconds_between_is_signed_and_fractional() {
        let a = t(0);
        let b = a + TimeDelta::milliseconds(1500);
        assert!((seconds_between(a, b) - 1.5).abs() < 1e-9);
        assert!((seconds_between(b, a) + 1.5).abs() < 1e-9);
        assert_eq!(delta_from_secs(0.25), TimeDelta::milliseconds(250));
    }

    #[test]
    fn estimate_uncertainty_uses_covariance_trace() {
        let est = PositionEstimate {
            position: Vec3::zero(),
            covariance: [[0.04, 0.0, 0.0], [0.0, 0.04, 0.0], [0.0, 0.0, 0.04]],
            timestamp: t(0),
            anchors_used: 4,
            residual_rms: 0.0,
        };
        assert!((est.uncertainty() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn segment_json_roundtrip_keeps_ids_transparent() {
        let segment = MapSegment {
            edge_node: EdgeNodeId::from("edge-a"),
            sequence: 7,
            emitted_at: t(10),
            coverage: vec![[0.0, 0.0], [5.0, 0.0], [5.0, 5.0]],
            entries: vec![SegmentEntry {
                tag_id: TagId::from("PLT-A001"),
                rfid_id: None,
                pallet_id: Some("PLT-A001".to_string()),
                position: Vec3::new(1.0, 2.0, 0.0),
                uncertainty: 0.1,
                velocity: Vec3::zero(),
                last_seen: t(9),
            }],
        };
        let json = serde_json::to_string(&segment).unwrap();
        assert!(json.contains("\"edge_node\":\"edge-a\""));
        assert!(!json.contains("rfid_id"), "absent optionals are skipped");
        let back: MapSegment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, segment);
    }

    #[test]
    fn sensor_reading_is_tagged_by_kind() {
        let reading = SensorReading::Detection(DetectionEvent {
            reader: ReaderId::from("rfid_1"),
            rfid_id: Some("E200-01".to_string()),
            rssi_dbm: -55.0,
            timestamp: t(1),
            sequence: 1,
        });
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("\"kind\":\"Detection\""));
        assert_eq!(reading.timestamp(), t(1));
    }

    #[test]
    fn map_error_display() {
        let err = MapError::SequenceRegression {
            edge_node: EdgeNodeId::from("edge-b"),
            received: 3,
            last: 5,
        };
        assert!(err.to_string().contains("edge-b"));
        let err = MapError::InsufficientAnchors { available: 2 };
        assert!(err.to_string().contains("2 valid ranges"));
    }

    #[test]
    fn diagnostics_are_tagged_and_count_rejections() {
        let report = CycleReport {
            cycle: 3,
            malformed_segments: 1,
            sequence_regressions: 2,
            stale_reports: 4,
            ..CycleReport::default()
        };
        assert_eq!(report.rejections(), 7);
        let json = serde_json::to_string(&Diagnostic::FusionCycle(report.clone())).unwrap();
        assert!(json.contains("\"kind\":\"fusion_cycle\""));
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Diagnostic::FusionCycle(report));
    }
}
