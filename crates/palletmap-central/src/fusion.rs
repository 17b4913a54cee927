//! Central map fusion.
//!
//! [`MapFusion`] accepts segments from every edge node between cycles and
//! folds them into a new [`GlobalMap`] once per cycle.
//!
//! # Segment admission
//!
//! | Check                                 | Outcome                    |
//! |---------------------------------------|----------------------------|
//! | frame fails to decode or validate     | `MalformedSegment`         |
//! | sequence ≤ last accepted for the node | `SequenceRegression`       |
//! | otherwise                             | pending; replaces any older pending segment of that node |
//!
//! # Per-tag resolution
//!
//! Reports older than the tag's accepted timestamp are rejected as
//! `StaleReport`. Among the remaining reports exactly one is chosen, never
//! an average, by the first rule that separates them:
//!
//! 1. the reporting node's coverage interior contains the position;
//! 2. lower uncertainty;
//! 3. more recent `last_seen`;
//! 4. lexicographically smaller edge node id.
//!
//! Reports further apart than `boundary_conflict_tolerance` count as one
//! conflict for the tag. Tags silent for longer than `silence_timeout_secs`
//! are marked stale and drop out of active queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use palletmap_middleware::decode;
use palletmap_perception::geometry::Polygon;
use palletmap_types::{
    CycleReport, EdgeNodeId, MapError, MapSegment, SegmentEntry, TagId, TagStatus,
    seconds_between,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::liveness::{LinkMonitor, LinkReport};
use crate::map::GlobalMap;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Seconds without an accepted report before a tag is marked stale.
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: f64,
    /// Distance (metres) between competing reports that counts as a
    /// boundary conflict.
    #[serde(default = "default_boundary_conflict_tolerance")]
    pub boundary_conflict_tolerance: f64,
    /// Points kept per tag history.
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    /// A position must be this far inside a coverage polygon (metres) to
    /// count as interior.
    #[serde(default = "default_coverage_margin")]
    pub coverage_margin: f64,
    /// Seconds without a segment before an edge link is disconnected.
    #[serde(default = "default_link_timeout_secs")]
    pub link_timeout_secs: f64,
}

fn default_silence_timeout_secs() -> f64 {
    30.0
}
fn default_boundary_conflict_tolerance() -> f64 {
    1.0
}
fn default_history_length() -> usize {
    100
}
fn default_coverage_margin() -> f64 {
    0.25
}
fn default_link_timeout_secs() -> f64 {
    5.0
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            silence_timeout_secs: default_silence_timeout_secs(),
            boundary_conflict_tolerance: default_boundary_conflict_tolerance(),
            history_length: default_history_length(),
            coverage_margin: default_coverage_margin(),
            link_timeout_secs: default_link_timeout_secs(),
        }
    }
}

/// Whole-system health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub cycle: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub active_tags: usize,
    pub stale_tags: usize,
    pub links: Vec<LinkReport>,
    pub last_cycle: CycleReport,
}

// ────────────────────────────────────────────────────────────────────────────
// MapFusion
// ────────────────────────────────────────────────────────────────────────────

/// One tag report together with where it came from.
struct Candidate<'a> {
    entry: &'a SegmentEntry,
    source: &'a EdgeNodeId,
    coverage: &'a Polygon,
}

pub struct MapFusion {
    config: FusionConfig,
    last_sequence: BTreeMap<EdgeNodeId, u64>,
    pending: BTreeMap<EdgeNodeId, MapSegment>,
    /// Admission counters accumulated since the last cycle.
    admission: CycleReport,
    last_report: CycleReport,
    links: LinkMonitor,
}

impl MapFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            links: LinkMonitor::new(config.link_timeout_secs),
            config,
            last_sequence: BTreeMap::new(),
            pending: BTreeMap::new(),
            admission: CycleReport::default(),
            last_report: CycleReport::default(),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Expect segments from `node`; it shows up as disconnected until its
    /// first segment arrives.
    pub fn register_edge(&mut self, node: EdgeNodeId) {
        self.links.register(node);
    }

    /// Decode a wire frame and admit its segment.
    pub fn ingest_frame(&mut self, frame: &[u8], received_at: DateTime<Utc>) -> Result<(), MapError> {
        self.admission.segments_received += 1;
        match decode(frame) {
            Ok(envelope) => self.admit(envelope.segment, received_at),
            Err(err) => {
                self.admission.malformed_segments += 1;
                warn!(error = %err, "rejected segment");
                Err(err)
            }
        }
    }

    /// Admit an already decoded segment.
    pub fn ingest_segment(
        &mut self,
        segment: MapSegment,
        received_at: DateTime<Utc>,
    ) -> Result<(), MapError> {
        self.admission.segments_received += 1;
        if let Err(err) = palletmap_middleware::wire::validate(&segment) {
            self.admission.malformed_segments += 1;
            warn!(error = %err, "rejected segment");
            return Err(err);
        }
        self.admit(segment, received_at)
    }

    fn admit(&mut self, segment: MapSegment, received_at: DateTime<Utc>) -> Result<(), MapError> {
        let node = segment.edge_node.clone();
        if let Some(&last) = self.last_sequence.get(&node)
            && segment.sequence <= last
        {
            self.admission.sequence_regressions += 1;
            let err = MapError::SequenceRegression {
                edge_node: node,
                received: segment.sequence,
                last,
            };
            debug!(error = %err, "rejected segment");
            return Err(err);
        }

        self.last_sequence.insert(node.clone(), segment.sequence);
        self.links
            .observe(&node, segment.sequence, segment.entries.len(), received_at);
        if let Some(previous) = self.pending.insert(node.clone(), segment) {
            debug!(edge = %node, superseded = previous.sequence, "pending segment superseded");
        }
        Ok(())
    }

    /// Number of segments waiting for the next cycle.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Fold every pending segment into a copy of `current`.
    ///
    /// `current` itself is left untouched; the caller publishes the returned
    /// map in one swap.
    pub fn fuse(&mut self, current: &GlobalMap, now: DateTime<Utc>) -> (GlobalMap, CycleReport) {
        let mut next = current.clone();
        next.begin_cycle(now);

        let segments = std::mem::take(&mut self.pending);
        let mut report = std::mem::take(&mut self.admission);
        report.cycle = next.cycle();
        report.completed_at = Some(now);
        report.segments_fused = segments.len();

        let coverages: BTreeMap<&EdgeNodeId, Polygon> = segments
            .iter()
            .map(|(node, seg)| (node, Polygon::new(seg.coverage.clone())))
            .collect();

        let mut reports: BTreeMap<&TagId, Vec<Candidate<'_>>> = BTreeMap::new();
        for (node, segment) in &segments {
            let Some(coverage) = coverages.get(node) else {
                continue;
            };
            for entry in &segment.entries {
                reports.entry(&entry.tag_id).or_default().push(Candidate {
                    entry,
                    source: node,
                    coverage,
                });
            }
        }

        for (tag, candidates) in reports {
            let accepted = next.get(tag).map(|e| e.last_seen);
            let (fresh, stale): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|c| accepted.is_none_or(|a| c.entry.last_seen >= a));

            for c in &stale {
                report.stale_reports += 1;
                if let Some(accepted) = accepted {
                    let err = MapError::StaleReport {
                        tag: tag.clone(),
                        reported: c.entry.last_seen,
                        accepted,
                    };
                    warn!(edge = %c.source, error = %err, "rejected report");
                }
            }

            if self.is_conflict(&fresh) {
                report.conflicts += 1;
                debug!(tag = %tag, reports = fresh.len(), "boundary conflict");
            }

            if let Some(winner) = self.select(fresh) {
                next.accept(winner.entry, winner.source, self.config.history_length);
            }
        }

        self.mark_silence(&mut next, now);
        report.active_tags = next.count(TagStatus::Active);
        report.stale_tags = next.count(TagStatus::Stale);

        if report.rejections() > 0 || report.conflicts > 0 {
            warn!(
                cycle = report.cycle,
                malformed = report.malformed_segments,
                regressions = report.sequence_regressions,
                stale = report.stale_reports,
                conflicts = report.conflicts,
                "fusion cycle completed with rejections"
            );
        } else {
            debug!(
                cycle = report.cycle,
                segments = report.segments_fused,
                active = report.active_tags,
                "fusion cycle completed"
            );
        }

        self.last_report = report.clone();
        (next, report)
    }

    /// Health snapshot combining `map` with link state.
    pub fn status(&self, map: &GlobalMap, now: DateTime<Utc>) -> SystemStatus {
        SystemStatus {
            cycle: map.cycle(),
            updated_at: map.updated_at(),
            active_tags: map.count(TagStatus::Active),
            stale_tags: map.count(TagStatus::Stale),
            links: self.links.report(now),
            last_cycle: self.last_report.clone(),
        }
    }

    fn is_conflict(&self, candidates: &[Candidate<'_>]) -> bool {
        let tolerance = self.config.boundary_conflict_tolerance;
        candidates.iter().enumerate().any(|(i, a)| {
            candidates[i + 1..]
                .iter()
                .any(|b| a.entry.position.distance(b.entry.position) > tolerance)
        })
    }

    fn select<'a>(&self, candidates: Vec<Candidate<'a>>) -> Option<Candidate<'a>> {
        let margin = self.config.coverage_margin;
        let interior = |c: &Candidate<'_>| {
            c.coverage
                .contains_interior(c.entry.position.x, c.entry.position.y, margin)
        };
        candidates.into_iter().min_by(|a, b| {
            interior(b)
                .cmp(&interior(a))
                .then_with(|| a.entry.uncertainty.total_cmp(&b.entry.uncertainty))
                .then_with(|| b.entry.last_seen.cmp(&a.entry.last_seen))
                .then_with(|| a.source.cmp(b.source))
        })
    }

    fn mark_silence(&self, map: &mut GlobalMap, now: DateTime<Utc>) {
        for entry in map.entries_mut() {
            let silent = seconds_between(entry.last_seen, now) > self.config.silence_timeout_secs;
            let status = if silent { TagStatus::Stale } else { TagStatus::Active };
            if status != entry.status {
                info!(tag = %entry.tag_id, ?status, "tag status changed");
                entry.status = status;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
