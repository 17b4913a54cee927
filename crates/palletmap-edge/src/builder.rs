//! Edge Segment Builder.
//!
//! Binds trilateration, temporal filtering and RFID identity matching into
//! one continuously updated local map segment per edge node.
//!
//! Each [`tick`](SegmentBuilder::tick):
//!
//! 1. **Drain** – validate queued readings; ranges go into a short
//!    per-tag/per-anchor ring buffer, detections are kept for step 3.
//! 2. **Solve** – for every tag, the latest sample per anchor inside the
//!    coherence window feeds the [`Trilaterator`]; with ≥3 anchors and at
//!    least one new sample the estimate updates the tag's [`TagTracker`],
//!    otherwise the tracker only predicts. A failed solve is logged and
//!    never aborts the tick.
//! 3. **Correlate** – RFID detections bind to tags: registry lookup first,
//!    then the tracked tag whose distance to the reader best matches the
//!    RSSI-derived range.
//! 4. **Emit** – a [`MapSegment`] of non-stale tags inside the coverage
//!    polygon. The sequence number increments on every emission.
//!
//! Predict-only steps advance a filter to the start of the coherence window
//! rather than to `now`, so a measurement still in flight is never older
//! than the filter state when it arrives.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use palletmap_perception::filter::{FilterConfig, TagTracker, UpdateOutcome};
use palletmap_perception::geometry::{Geometry, Polygon};
use palletmap_perception::trilateration::{RangeSample, TrilaterationConfig, Trilaterator};
use palletmap_types::{
    AnchorId, DetectionEvent, EdgeNodeId, EdgeStatus, MapError, MapSegment, Measurement,
    PositionEstimate, SegmentEntry, SensorReading, TagId, delta_from_secs, seconds_between,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::TagRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Edge-side tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Only samples this recent (seconds) are combined into one solve.
    #[serde(default = "default_coherence_window_secs")]
    pub coherence_window_secs: f64,
    /// Ring-buffer length per tag and anchor.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Tags without a fused measurement for this long are not emitted.
    ///
    /// Predict-only steps during that silence grow the filter covariance;
    /// keep `FilterConfig::divergence_bound` large enough that the filter
    /// does not reset first, or tags drop out earlier than this.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: f64,
    /// Largest mismatch (metres) between the RSSI-derived range and a tag's
    /// distance to the reader for a spatial RFID match.
    #[serde(default = "default_rfid_match_tolerance")]
    pub rfid_match_tolerance: f64,
}

fn default_coherence_window_secs() -> f64 {
    1.0
}
fn default_buffer_size() -> usize {
    5
}
fn default_stale_after_secs() -> f64 {
    10.0
}
fn default_rfid_match_tolerance() -> f64 {
    1.5
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            coherence_window_secs: default_coherence_window_secs(),
            buffer_size: default_buffer_size(),
            stale_after_secs: default_stale_after_secs(),
            rfid_match_tolerance: default_rfid_match_tolerance(),
        }
    }
}

/// Everything a builder needs besides geometry and registry.
#[derive(Debug, Clone, Default)]
pub struct BuilderSettings {
    pub edge: EdgeConfig,
    pub trilateration: TrilaterationConfig,
    pub filter: FilterConfig,
}

// ────────────────────────────────────────────────────────────────────────────
// SegmentBuilder
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Identity {
    rfid_id: Option<String>,
    pallet_id: Option<String>,
}

/// The synchronous core of an edge node.
pub struct SegmentBuilder {
    node: EdgeNodeId,
    geometry: Arc<Geometry>,
    coverage: Polygon,
    solver: Trilaterator,
    filter_config: FilterConfig,
    config: EdgeConfig,
    registry: Arc<TagRegistry>,
    pending: Vec<SensorReading>,
    ranges: BTreeMap<TagId, BTreeMap<AnchorId, VecDeque<Measurement>>>,
    trackers: BTreeMap<TagId, TagTracker>,
    last_solved: BTreeMap<TagId, DateTime<Utc>>,
    identities: BTreeMap<TagId, Identity>,
    sequence: u64,
    status: EdgeStatus,
}

impl SegmentBuilder {
    /// Build the segment builder for `node`.
    ///
    /// Only the anchors and readers assigned to `node` are used. Returns
    /// `None` when `geometry` has no coverage entry for `node`.
    pub fn new(
        geometry: &Geometry,
        node: &EdgeNodeId,
        settings: BuilderSettings,
        registry: Arc<TagRegistry>,
    ) -> Option<Self> {
        let local = geometry.for_edge(node)?;
        let coverage = local.edges.first()?.polygon.clone();
        let solver = Trilaterator::new(settings.trilateration).with_bounds(local.bounds);
        Some(Self {
            node: node.clone(),
            geometry: Arc::new(local),
            coverage,
            solver,
            filter_config: settings.filter,
            config: settings.edge,
            registry,
            pending: Vec::new(),
            ranges: BTreeMap::new(),
            trackers: BTreeMap::new(),
            last_solved: BTreeMap::new(),
            identities: BTreeMap::new(),
            sequence: 0,
            status: EdgeStatus {
                edge_node: node.clone(),
                sequence: 0,
                tracked_tags: 0,
                emitted_tags: 0,
                dropped_readings: 0,
                failed_solves: 0,
                rejected_estimates: 0,
                filter_resets: 0,
                last_emitted_at: None,
            },
        })
    }

    pub fn node(&self) -> &EdgeNodeId {
        &self.node
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Queue a reading for the next tick.
    pub fn ingest(&mut self, reading: SensorReading) {
        self.pending.push(reading);
    }

    /// Current health counters.
    pub fn status(&self) -> EdgeStatus {
        EdgeStatus {
            tracked_tags: self.trackers.values().filter(|t| t.state().is_some()).count(),
            ..self.status.clone()
        }
    }

    /// Run one tick and return the segment to publish.
    pub fn tick(&mut self, now: DateTime<Utc>) -> MapSegment {
        let detections = self.drain_pending();
        self.solve_all(now);
        self.correlate(detections);
        self.emit(now)
    }

    // ── Drain ───────────────────────────────────────────────────────────────

    fn drain_pending(&mut self) -> Vec<DetectionEvent> {
        let mut detections = Vec::new();
        for reading in std::mem::take(&mut self.pending) {
            match reading {
                SensorReading::Range(m) => self.accept_range(m),
                SensorReading::Detection(d) => {
                    let valid = d.rfid_id.as_deref().is_some_and(|id| !id.is_empty())
                        && d.rssi_dbm.is_finite()
                        && self.geometry.reader(&d.reader).is_some();
                    if valid {
                        detections.push(d);
                    } else {
                        debug!(edge = %self.node, reader = %d.reader, "dropping unusable detection");
                        self.status.dropped_readings += 1;
                    }
                }
            }
        }
        detections.sort_by_key(|d| (d.timestamp, d.sequence));
        detections
    }

    fn accept_range(&mut self, m: Measurement) {
        let uwb_id = match m.uwb_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.status.dropped_readings += 1;
                return;
            }
        };
        let valid = m.distance.is_finite()
            && m.distance >= 0.0
            && m.error_bound.is_finite()
            && m.error_bound > 0.0
            && self.geometry.anchor(&m.anchor).is_some();
        if !valid {
            debug!(edge = %self.node, anchor = %m.anchor, "dropping unusable range");
            self.status.dropped_readings += 1;
            return;
        }

        let tag = self.registry.resolve_uwb(&uwb_id);
        if !self.identities.contains_key(&tag) {
            let identity = match self.registry.get(&tag) {
                Some(record) => Identity {
                    rfid_id: record.rfid_id.clone(),
                    pallet_id: record.pallet_id.clone(),
                },
                None => Identity::default(),
            };
            self.identities.insert(tag.clone(), identity);
        }

        let buffer = self
            .ranges
            .entry(tag)
            .or_default()
            .entry(m.anchor.clone())
            .or_default();
        buffer.push_back(m);
        while buffer.len() > self.config.buffer_size.max(1) {
            buffer.pop_front();
        }
    }

    // ── Solve ───────────────────────────────────────────────────────────────

    fn solve_all(&mut self, now: DateTime<Utc>) {
        let window_start = now - delta_from_secs(self.config.coherence_window_secs);
        self.prune_ranges(window_start);

        let tags: BTreeSet<TagId> = self
            .ranges
            .keys()
            .chain(self.trackers.keys())
            .cloned()
            .collect();

        for tag in tags {
            let latest = self.latest_samples(&tag, now);
            let newest = latest.iter().map(|m| m.timestamp).max();
            let fresh = match (newest, self.last_solved.get(&tag)) {
                (Some(newest), Some(solved)) => newest > *solved,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if latest.len() < 3 || !fresh {
                self.predict(&tag, window_start);
                continue;
            }
            let Some(timestamp) = newest else {
                continue;
            };

            let samples: Vec<RangeSample> = latest
                .iter()
                .filter_map(|m| {
                    let anchor = self.geometry.anchor(&m.anchor)?;
                    Some(RangeSample::new(anchor.position, m.distance, m.error_bound))
                })
                .collect();
            let previous = self
                .trackers
                .get(&tag)
                .and_then(|t| t.state())
                .map(|s| s.position);

            self.last_solved.insert(tag.clone(), timestamp);
            match self.solver.solve(&samples, previous, timestamp) {
                Ok(estimate) => self.track(&tag, &estimate),
                Err(err) => {
                    self.status.failed_solves += 1;
                    warn!(edge = %self.node, tag = %tag, error = %err, "trilateration failed");
                    self.predict(&tag, window_start);
                }
            }
        }
    }

    /// Latest sample per anchor within `[now - window, now]`.
    fn latest_samples(&self, tag: &TagId, now: DateTime<Utc>) -> Vec<Measurement> {
        let Some(anchors) = self.ranges.get(tag) else {
            return Vec::new();
        };
        anchors
            .values()
            .filter_map(|buffer| {
                buffer
                    .iter()
                    .filter(|m| m.timestamp <= now)
                    .max_by_key(|m| (m.timestamp, m.sequence))
                    .cloned()
            })
            .collect()
    }

    fn prune_ranges(&mut self, window_start: DateTime<Utc>) {
        for anchors in self.ranges.values_mut() {
            for buffer in anchors.values_mut() {
                buffer.retain(|m| m.timestamp >= window_start);
            }
            anchors.retain(|_, buffer| !buffer.is_empty());
        }
        self.ranges.retain(|_, anchors| !anchors.is_empty());
    }

    fn tracker(&mut self, tag: &TagId) -> &mut TagTracker {
        let geometry = &self.geometry;
        let config = &self.filter_config;
        self.trackers
            .entry(tag.clone())
            .or_insert_with(|| TagTracker::new(tag.clone(), config, Some(geometry.clone())))
    }

    fn track(&mut self, tag: &TagId, estimate: &PositionEstimate) {
        let node = self.node.clone();
        let result = self.tracker(tag).update(estimate);
        match result {
            Ok(UpdateOutcome::Rejected) => self.status.rejected_estimates += 1,
            Ok(outcome) => {
                debug!(edge = %node, tag = %tag, ?outcome, uncertainty = estimate.uncertainty(), "estimate fused");
            }
            Err(err) => self.handle_filter_error(tag, err),
        }
    }

    fn predict(&mut self, tag: &TagId, until: DateTime<Utc>) {
        let Some(tracker) = self.trackers.get_mut(tag) else {
            return;
        };
        if let Err(err) = tracker.predict_to(until) {
            self.handle_filter_error(tag, err);
        }
    }

    fn handle_filter_error(&mut self, tag: &TagId, err: MapError) {
        match err {
            MapError::FilterDivergence { .. } => {
                warn!(edge = %self.node, tag = %tag, error = %err, "filter diverged; resetting");
                if let Some(tracker) = self.trackers.get_mut(tag) {
                    tracker.reset();
                }
                self.last_solved.remove(tag);
                self.status.filter_resets += 1;
            }
            other => {
                warn!(edge = %self.node, tag = %tag, error = %other, "estimate rejected");
                self.status.rejected_estimates += 1;
            }
        }
    }

    // ── Correlate ───────────────────────────────────────────────────────────

    fn correlate(&mut self, detections: Vec<DetectionEvent>) {
        for detection in detections {
            let Some(rfid) = detection.rfid_id.clone() else {
                continue;
            };

            if let Some(record) = self.registry.by_rfid(&rfid) {
                let identity = self.identities.entry(record.tag_id.clone()).or_default();
                identity.rfid_id = Some(rfid);
                identity.pallet_id = record.pallet_id.clone();
                continue;
            }

            match self.spatial_match(&detection) {
                Some(tag) => {
                    debug!(edge = %self.node, tag = %tag, rfid = %rfid, "rfid bound by proximity");
                    for (other, identity) in self.identities.iter_mut() {
                        if other != &tag && identity.rfid_id.as_deref() == Some(rfid.as_str()) {
                            identity.rfid_id = None;
                        }
                    }
                    self.identities.entry(tag).or_default().rfid_id = Some(rfid);
                }
                None => {
                    debug!(edge = %self.node, reader = %detection.reader, rfid = %rfid, "no tag matches detection");
                }
            }
        }
    }

    /// Tracked tag whose distance to the reader best matches the RSSI range.
    fn spatial_match(&self, detection: &DetectionEvent) -> Option<TagId> {
        let rfid = detection.rfid_id.as_deref()?;
        let reader = self.geometry.reader(&detection.reader)?;
        let range = reader.range_from_rssi(detection.rssi_dbm).min(reader.read_range);
        let tolerance = self.config.rfid_match_tolerance;

        self.trackers
            .iter()
            .filter_map(|(tag, tracker)| {
                let state = tracker.state()?;
                let bound = self
                    .identities
                    .get(tag)
                    .and_then(|i| i.rfid_id.as_deref());
                if bound.is_some_and(|b| b != rfid) {
                    return None;
                }
                let distance = state.position.distance(reader.position);
                if distance > reader.read_range + tolerance {
                    return None;
                }
                let mismatch = (distance - range).abs();
                (mismatch <= tolerance).then(|| (mismatch, tag.clone()))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, tag)| tag)
    }

    // ── Emit ────────────────────────────────────────────────────────────────

    fn emit(&mut self, now: DateTime<Utc>) -> MapSegment {
        let entries: Vec<SegmentEntry> = self
            .trackers
            .iter()
            .filter_map(|(tag, tracker)| {
                let state = tracker.state()?;
                if seconds_between(state.last_measurement, now) > self.config.stale_after_secs {
                    return None;
                }
                if !state.position.is_finite() || !state.uncertainty.is_finite() {
                    return None;
                }
                if !self.coverage.contains(state.position.x, state.position.y) {
                    return None;
                }
                let identity = self.identities.get(tag).cloned().unwrap_or_default();
                Some(SegmentEntry {
                    tag_id: tag.clone(),
                    rfid_id: identity.rfid_id,
                    pallet_id: identity.pallet_id,
                    position: state.position,
                    uncertainty: state.uncertainty,
                    velocity: state.velocity,
                    last_seen: state.last_measurement,
                })
            })
            .collect();

        self.sequence += 1;
        self.status.sequence = self.sequence;
        self.status.emitted_tags = entries.len();
        self.status.last_emitted_at = Some(now);

        MapSegment {
            edge_node: self.node.clone(),
            sequence: self.sequence,
            emitted_at: now,
            coverage: self.coverage.vertices().to_vec(),
            entries,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use palletmap_perception::geometry::{Aabb, Anchor, EdgeCoverage, NoiseProfile, RfidReader};
    use palletmap_types::{Point3, ReaderId, TagRecord};

    pub(crate) fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + delta_from_secs(secs)
    }

    pub(crate) fn geometry() -> Geometry {
        let mut g = Geometry::new(Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(20.0, 10.0, 5.0),
        ));
        let anchors = [
            ("a1", Point3::new(0.0, 0.0, 3.0)),
            ("a2", Point3::new(10.0, 0.0, 3.0)),
            ("a3", Point3::new(10.0, 10.0, 3.0)),
            ("a4", Point3::new(0.0, 10.0, 3.0)),
            ("a5", Point3::new(5.0, 5.0, 4.5)),
            // Collinear row used to force a degenerate solve.
            ("l1", Point3::new(2.0, 8.0, 1.0)),
            ("l2", Point3::new(4.0, 8.0, 1.0)),
            ("l3", Point3::new(6.0, 8.0, 1.0)),
        ];
        for (id, position) in anchors {
            g.anchors.push(Anchor {
                id: AnchorId::from(id),
                position,
                noise: NoiseProfile::default(),
            });
        }
        g.readers.push(RfidReader {
            id: ReaderId::from("r1"),
            position: Point3::new(2.0, 2.0, 1.0),
            read_range: 5.0,
            rssi_at_1m: -45.0,
            path_loss_exponent: 2.0,
        });
        g.edges.push(EdgeCoverage {
            node: EdgeNodeId::from("edge-a"),
            polygon: Polygon::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]),
            anchors: anchors.iter().map(|(id, _)| AnchorId::from(*id)).collect(),
            readers: vec![ReaderId::from("r1")],
        });
        g
    }

    fn registry() -> Arc<TagRegistry> {
        Arc::new(TagRegistry::new(vec![TagRecord {
            tag_id: TagId::from("PLT-A001"),
            uwb_id: Some("u1".to_string()),
            rfid_id: Some("E200-0001".to_string()),
            pallet_id: Some("PLT-A001".to_string()),
            content_type: None,
        }]))
    }

    fn builder() -> SegmentBuilder {
        SegmentBuilder::new(
            &geometry(),
            &EdgeNodeId::from("edge-a"),
            BuilderSettings::default(),
            registry(),
        )
        .unwrap()
    }

    /// Exact ranges from the given anchors to `truth`.
    pub(crate) fn ranges(
        g: &Geometry,
        anchors: &[&str],
        uwb: &str,
        truth: Point3,
        secs: f64,
    ) -> Vec<SensorReading> {
        anchors
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let anchor = g.anchor(&AnchorId::from(*id)).unwrap();
                SensorReading::Range(Measurement {
                    anchor: anchor.id.clone(),
                    uwb_id: Some(uwb.to_string()),
                    distance: anchor.position.distance(truth),
                    error_bound: 0.1,
                    timestamp: t(secs),
                    sequence: i as u64,
                })
            })
            .collect()
    }

    const ALL: [&str; 5] = ["a1", "a2", "a3", "a4", "a5"];

    #[test]
    fn solved_tag_appears_in_segment() {
        let mut b = builder();
        let truth = Point3::new(3.0, 4.0, 0.5);
        for r in ranges(&geometry(), &ALL, "u9", truth, 0.0) {
            b.ingest(r);
        }
        let seg = b.tick(t(0.2));
        assert_eq!(seg.sequence, 1);
        assert_eq!(seg.entries.len(), 1);
        let entry = &seg.entries[0];
        assert_eq!(entry.tag_id, TagId::from("uwb:u9"));
        assert!(entry.position.distance(truth) < 1e-3, "{:?}", entry.position);
        assert_eq!(entry.last_seen, t(0.0));
        assert_eq!(seg.coverage.len(), 4);
    }

    #[test]
    fn sequence_increments_on_every_emission() {
        let mut b = builder();
        let a = b.tick(t(0.0));
        let c = b.tick(t(1.0));
        let d = b.tick(t(2.0));
        assert_eq!((a.sequence, c.sequence, d.sequence), (1, 2, 3));
        assert!(d.entries.is_empty());
        assert_eq!(b.status().sequence, 3);
    }

    #[test]
    fn two_anchors_never_produce_an_entry() {
        let mut b = builder();
        for r in ranges(&geometry(), &["a1", "a2"], "u9", Point3::new(3.0, 4.0, 0.5), 0.0) {
            b.ingest(r);
        }
        assert!(b.tick(t(0.1)).entries.is_empty());
    }

    #[test]
    fn tag_outside_coverage_is_not_emitted() {
        let mut b = builder();
        for r in ranges(&geometry(), &ALL, "u9", Point3::new(14.0, 4.0, 0.5), 0.0) {
            b.ingest(r);
        }
        let seg = b.tick(t(0.1));
        assert!(seg.entries.is_empty());
        assert_eq!(b.status().tracked_tags, 1);
    }

    #[test]
    fn silent_tag_goes_stale_at_the_edge() {
        let mut b = builder();
        for r in ranges(&geometry(), &ALL, "u9", Point3::new(3.0, 4.0, 0.5), 0.0) {
            b.ingest(r);
        }
        assert_eq!(b.tick(t(0.1)).entries.len(), 1);
        assert_eq!(b.tick(t(5.0)).entries.len(), 1);
        assert!(b.tick(t(10.5)).entries.is_empty());
    }

    #[test]
    fn samples_outside_coherence_window_are_ignored() {
        let mut b = builder();
        let g = geometry();
        let truth = Point3::new(3.0, 4.0, 0.5);
        for r in ranges(&g, &["a1", "a2"], "u9", truth, 0.0) {
            b.ingest(r);
        }
        for r in ranges(&g, &["a3", "a4"], "u9", truth, 3.0) {
            b.ingest(r);
        }
        // Only a3 and a4 are within one second of t = 3.2.
        assert!(b.tick(t(3.2)).entries.is_empty());
    }

    #[test]
    fn unusable_readings_are_counted() {
        let mut b = builder();
        b.ingest(SensorReading::Range(Measurement {
            anchor: AnchorId::from("ghost"),
            uwb_id: Some("u9".to_string()),
            distance: 2.0,
            error_bound: 0.1,
            timestamp: t(0.0),
            sequence: 1,
        }));
        b.ingest(SensorReading::Range(Measurement {
            anchor: AnchorId::from("a1"),
            uwb_id: None,
            distance: 2.0,
            error_bound: 0.1,
            timestamp: t(0.0),
            sequence: 2,
        }));
        b.ingest(SensorReading::Detection(DetectionEvent {
            reader: ReaderId::from("r1"),
            rfid_id: None,
            rssi_dbm: -50.0,
            timestamp: t(0.0),
            sequence: 3,
        }));
        b.tick(t(0.1));
        assert_eq!(b.status().dropped_readings, 3);
    }

    #[test]
    fn failed_solve_does_not_abort_the_tick() {
        let mut b = builder();
        let g = geometry();
        for r in ranges(&g, &["l1", "l2", "l3"], "bad", Point3::new(4.0, 6.0, 0.5), 0.0) {
            b.ingest(r);
        }
        for r in ranges(&g, &ALL, "u9", Point3::new(3.0, 4.0, 0.5), 0.0) {
            b.ingest(r);
        }
        let seg = b.tick(t(0.1));
        assert_eq!(seg.entries.len(), 1);
        assert_eq!(seg.entries[0].tag_id, TagId::from("uwb:u9"));
        assert_eq!(b.status().failed_solves, 1);
    }

    #[test]
    fn registered_tags_carry_registry_identity() {
        let mut b = builder();
        for r in ranges(&geometry(), &ALL, "u1", Point3::new(3.0, 4.0, 0.5), 0.0) {
            b.ingest(r);
        }
        let seg = b.tick(t(0.1));
        let entry = &seg.entries[0];
        assert_eq!(entry.tag_id, TagId::from("PLT-A001"));
        assert_eq!(entry.rfid_id.as_deref(), Some("E200-0001"));
        assert_eq!(entry.pallet_id.as_deref(), Some("PLT-A001"));
    }

    #[test]
    fn unregistered_rfid_binds_to_tag_at_matching_range() {
        let mut b = builder();
        let g = geometry();
        let near = Point3::new(3.0, 3.0, 0.5);
        let far = Point3::new(8.0, 8.0, 0.5);
        for r in ranges(&g, &ALL, "near", near, 0.0) {
            b.ingest(r);
        }
        for r in ranges(&g, &ALL, "far", far, 0.0) {
            b.ingest(r);
        }
        b.tick(t(0.1));

        let reader = g.reader(&ReaderId::from("r1")).unwrap();
        b.ingest(SensorReading::Detection(DetectionEvent {
            reader: reader.id.clone(),
            rfid_id: Some("E200-7777".to_string()),
            rssi_dbm: reader.rssi_at(reader.position.distance(near)),
            timestamp: t(0.5),
            sequence: 9,
        }));
        let seg = b.tick(t(0.6));
        let near_entry = seg
            .entries
            .iter()
            .find(|e| e.tag_id == TagId::from("uwb:near"))
            .unwrap();
        assert_eq!(near_entry.rfid_id.as_deref(), Some("E200-7777"));
        let far_entry = seg
            .entries
            .iter()
            .find(|e| e.tag_id == TagId::from("uwb:far"))
            .unwrap();
        assert!(far_entry.rfid_id.is_none());
    }

    #[test]
    fn entries_are_sorted_by_tag_id() {
        let mut b = builder();
        let g = geometry();
        for (uwb, x) in [("zz", 2.0), ("aa", 6.0), ("mm", 4.0)] {
            for r in ranges(&g, &ALL, uwb, Point3::new(x, 5.0, 0.5), 0.0) {
                b.ingest(r);
            }
        }
        let seg = b.tick(t(0.1));
        let ids: Vec<_> = seg.entries.iter().map(|e| e.tag_id.as_str()).collect();
        assert_eq!(ids, vec!["uwb:aa", "uwb:mm", "uwb:zz"]);
    }

    #[test]
    fn unknown_edge_has_no_builder() {
        let b = SegmentBuilder::new(
            &geometry(),
            &EdgeNodeId::from("edge-ghost"),
            BuilderSettings::default(),
            registry(),
        );
        assert!(b.is_none());
    }
}
