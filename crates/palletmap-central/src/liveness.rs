//! [`LinkMonitor`] – edge link health from segment arrival times.
//!
//! Every accepted segment counts as a heartbeat from its edge node. A node
//! is [`LinkState::Disconnected`] once its last segment is older than the
//! link timeout, and [`LinkState::Idle`] while it keeps reporting empty
//! segments.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use palletmap_types::{EdgeNodeId, seconds_between};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health of one edge link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Segments arrive within the timeout and carry tags.
    Live,
    /// Segments arrive within the timeout but are empty.
    Idle,
    /// No segment within the timeout (or never).
    Disconnected,
}

/// Point-in-time view of one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    pub edge_node: EdgeNodeId,
    pub state: LinkState,
    pub last_segment: Option<DateTime<Utc>>,
    pub last_sequence: u64,
    pub segments: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct LinkEntry {
    last_segment: Option<DateTime<Utc>>,
    last_sequence: u64,
    last_entries: usize,
    segments: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// LinkMonitor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinkMonitor {
    timeout_secs: f64,
    links: BTreeMap<EdgeNodeId, LinkEntry>,
}

impl LinkMonitor {
    pub fn new(timeout_secs: f64) -> Self {
        Self {
            timeout_secs,
            links: BTreeMap::new(),
        }
    }

    /// Expect segments from `node`. It reports disconnected until the first
    /// one arrives.
    pub fn register(&mut self, node: EdgeNodeId) {
        self.links.entry(node).or_default();
    }

    /// Record an accepted segment. Unknown nodes are registered on the fly.
    pub fn observe(&mut self, node: &EdgeNodeId, sequence: u64, entries: usize, at: DateTime<Utc>) {
        let link = self.links.entry(node.clone()).or_default();
        link.last_segment = Some(at);
        link.last_sequence = sequence;
        link.last_entries = entries;
        link.segments += 1;
    }

    pub fn state(&self, node: &EdgeNodeId, now: DateTime<Utc>) -> LinkState {
        match self.links.get(node) {
            Some(link) => self.classify(link, now),
            None => LinkState::Disconnected,
        }
    }

    /// Every known link, ordered by node id.
    pub fn report(&self, now: DateTime<Utc>) -> Vec<LinkReport> {
        self.links
            .iter()
            .map(|(node, link)| LinkReport {
                edge_node: node.clone(),
                state: self.classify(link, now),
                last_segment: link.last_segment,
                last_sequence: link.last_sequence,
                segments: link.segments,
            })
            .collect()
    }

    fn classify(&self, link: &LinkEntry, now: DateTime<Utc>) -> LinkState {
        match link.last_segment {
            Some(at) if seconds_between(at, now) <= self.timeout_secs => {
                if link.last_entries > 0 {
                    LinkState::Live
                } else {
                    LinkState::Idle
                }
            }
            _ => LinkState::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use palletmap_types::delta_from_secs;

    fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + delta_from_secs(secs)
    }

    #[test]
    fn registered_link_starts_disconnected() {
        let mut m = LinkMonitor::new(5.0);
        m.register(EdgeNodeId::from("edge-a"));
        assert_eq!(m.state(&EdgeNodeId::from("edge-a"), t(0.0)), LinkState::Disconnected);
        assert_eq!(m.report(t(0.0))[0].state, LinkState::Disconnected);
    }

    #[test]
    fn empty_segments_mean_idle() {
        let mut m = LinkMonitor::new(5.0);
        let node = EdgeNodeId::from("edge-a");
        m.observe(&node, 1, 0, t(0.0));
        assert_eq!(m.state(&node, t(1.0)), LinkState::Idle);
        m.observe(&node, 2, 3, t(2.0));
        assert_eq!(m.state(&node, t(3.0)), LinkState::Live);
    }

    #[test]
    fn silent_link_times_out() {
        let mut m = LinkMonitor::new(5.0);
        let node = EdgeNodeId::from("edge-a");
        m.observe(&node, 1, 2, t(0.0));
        assert_eq!(m.state(&node, t(5.0)), LinkState::Live);
        assert_eq!(m.state(&node, t(5.5)), LinkState::Disconnected);
    }

    #[test]
    fn unknown_link_is_disconnected() {
        let m = LinkMonitor::new(5.0);
        assert_eq!(m.state(&EdgeNodeId::from("ghost"), t(0.0)), LinkState::Disconnected);
    }

    #[test]
    fn report_is_ordered_by_node() {
        let mut m = LinkMonitor::new(5.0);
        m.observe(&EdgeNodeId::from("edge-b"), 4, 1, t(0.0));
        m.observe(&EdgeNodeId::from("edge-a"), 9, 1, t(0.0));
        let report = m.report(t(1.0));
        assert_eq!(report[0].edge_node, EdgeNodeId::from("edge-a"));
        assert_eq!(report[0].last_sequence, 9);
        assert_eq!(report[1].segments, 1);
    }
}
