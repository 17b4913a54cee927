//! The global pallet map.
//!
//! One canonical [`MapEntry`] per tag identity plus a bounded position
//! history. A [`GlobalMap`] is never mutated once published: fusion clones
//! the current map, applies a cycle to the clone and swaps it in. History
//! buffers sit behind [`Arc`]s so that the clone only copies the buffers a
//! cycle actually touches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use palletmap_perception::geometry::Geometry;
use palletmap_types::{EdgeNodeId, Point3, SegmentEntry, TagId, TagStatus, Vec3};
use serde::{Deserialize, Serialize};

/// The canonical state of one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub tag_id: TagId,
    pub rfid_id: Option<String>,
    pub pallet_id: Option<String>,
    pub position: Point3,
    pub uncertainty: f64,
    pub velocity: Vec3,
    /// Accepted timestamp; never decreases.
    pub last_seen: DateTime<Utc>,
    /// Edge node whose report was chosen last.
    pub source: EdgeNodeId,
    pub status: TagStatus,
}

/// One accepted position in a tag's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub position: Point3,
    pub uncertainty: f64,
    pub source: EdgeNodeId,
}

#[derive(Debug, Clone)]
pub struct GlobalMap {
    geometry: Arc<Geometry>,
    cycle: u64,
    updated_at: Option<DateTime<Utc>>,
    entries: BTreeMap<TagId, MapEntry>,
    history: BTreeMap<TagId, Arc<VecDeque<HistoryPoint>>>,
}

impl GlobalMap {
    /// An empty map at cycle 0.
    pub fn new(geometry: Arc<Geometry>) -> Self {
        Self {
            geometry,
            cycle: 0,
            updated_at: None,
            entries: BTreeMap::new(),
            history: BTreeMap::new(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of completed fusion cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tag: &TagId) -> Option<&MapEntry> {
        self.entries.get(tag)
    }

    /// Every entry, active and stale, ordered by tag id.
    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries
            .values()
            .filter(|e| e.status == TagStatus::Active)
    }

    pub fn count(&self, status: TagStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    /// History of `tag` with `from <= timestamp <= to`, oldest first.
    pub fn history(
        &self,
        tag: &TagId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<HistoryPoint> {
        self.history
            .get(tag)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= from && p.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Mutation (fusion only) ──────────────────────────────────────────────

    pub(crate) fn begin_cycle(&mut self, now: DateTime<Utc>) {
        self.cycle += 1;
        self.updated_at = Some(now);
    }

    /// Make `report` the canonical entry for its tag.
    ///
    /// A history point is recorded only when the report advances the
    /// accepted timestamp, so re-emitted reports do not pad the history.
    pub(crate) fn accept(&mut self, report: &SegmentEntry, source: &EdgeNodeId, history_len: usize) {
        let advanced = self
            .entries
            .get(&report.tag_id)
            .is_none_or(|e| report.last_seen > e.last_seen);

        self.entries.insert(
            report.tag_id.clone(),
            MapEntry {
                tag_id: report.tag_id.clone(),
                rfid_id: report.rfid_id.clone(),
                pallet_id: report.pallet_id.clone(),
                position: report.position,
                uncertainty: report.uncertainty,
                velocity: report.velocity,
                last_seen: report.last_seen,
                source: source.clone(),
                status: TagStatus::Active,
            },
        );

        if advanced && history_len > 0 {
            let buffer = self.history.entry(report.tag_id.clone()).or_default();
            let points = Arc::make_mut(buffer);
            points.push_back(HistoryPoint {
                timestamp: report.last_seen,
                position: report.position,
                uncertainty: report.uncertainty,
                source: source.clone(),
            });
            while points.len() > history_len {
                points.pop_front();
            }
        }
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut MapEntry> {
        self.entries.values_mut()
    }
}
