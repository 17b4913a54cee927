//! Asynchronous central node and the read side of the global map.
//!
//! [`CentralNode`] is the single consumer of the segment stream. Frames are
//! admitted as they arrive; every fusion interval the pending segments are
//! folded into a new [`GlobalMap`], which then replaces the published one
//! in a single swap. [`MapReader`] handles are cheap to clone and only ever
//! see complete maps.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use palletmap_middleware::{Frame, SegmentBus, SegmentSource, Topic};
use palletmap_perception::geometry::Geometry;
use palletmap_types::{CycleReport, Diagnostic, EdgeNodeId, TagId};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::fusion::{FusionConfig, MapFusion, SystemStatus};
use crate::map::{GlobalMap, HistoryPoint, MapEntry};

// ────────────────────────────────────────────────────────────────────────────
// MapReader
// ────────────────────────────────────────────────────────────────────────────

struct Published {
    map: Arc<GlobalMap>,
    status: SystemStatus,
}

/// Shared, read-only access to the latest published map.
#[derive(Clone)]
pub struct MapReader {
    inner: Arc<RwLock<Published>>,
}

impl MapReader {
    fn new(map: GlobalMap, status: SystemStatus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Published {
                map: Arc::new(map),
                status,
            })),
        }
    }

    /// The latest complete map.
    pub fn snapshot(&self) -> Arc<GlobalMap> {
        let published = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&published.map)
    }

    /// Active entries, ordered by tag id.
    pub fn active_tags(&self) -> Vec<MapEntry> {
        self.snapshot().active().cloned().collect()
    }

    /// Position history of `tag` between `from` and `to` inclusive.
    pub fn history(&self, tag: &TagId, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<HistoryPoint> {
        self.snapshot().history(tag, from, to)
    }

    /// Status as of the latest cycle.
    pub fn status(&self) -> SystemStatus {
        let published = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        published.status.clone()
    }

    fn publish(&self, map: GlobalMap, status: SystemStatus) {
        let mut published = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        published.map = Arc::new(map);
        published.status = status;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CentralNode
// ────────────────────────────────────────────────────────────────────────────

pub struct CentralNode {
    fusion: MapFusion,
    frames: BoxStream<'static, Frame>,
    interval: Duration,
    reader: MapReader,
    diagnostics: Option<SegmentBus>,
}

impl CentralNode {
    /// Subscribes to `source` immediately, so segments published after this
    /// call are buffered for [`run`](Self::run) even before it is polled.
    pub fn new(
        geometry: Arc<Geometry>,
        config: FusionConfig,
        source: &dyn SegmentSource,
        interval: Duration,
    ) -> Self {
        let mut fusion = MapFusion::new(config);
        for edge in &geometry.edges {
            fusion.register_edge(edge.node.clone());
        }
        let map = GlobalMap::new(geometry);
        let status = fusion.status(&map, Utc::now());
        Self {
            reader: MapReader::new(map, status),
            fusion,
            frames: source.frames(),
            interval,
            diagnostics: None,
        }
    }

    /// Publish a [`Diagnostic::FusionCycle`] on `bus` after every cycle.
    pub fn with_diagnostics(mut self, bus: SegmentBus) -> Self {
        self.diagnostics = Some(bus);
        self
    }

    /// Expect segments from an edge node not listed in the geometry.
    pub fn register_edge(&mut self, node: EdgeNodeId) {
        self.fusion.register_edge(node);
    }

    pub fn reader(&self) -> MapReader {
        self.reader.clone()
    }

    /// Consume segments and fuse on the configured interval until
    /// `shutdown` flips to `true`. Returns the last cycle report.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> CycleReport {
        let mut frames_open = true;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = CycleReport::default();

        info!(interval_ms = self.interval.as_millis() as u64, "central node started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                frame = self.frames.next(), if frames_open => {
                    match frame {
                        // Rejections are counted and logged by the fusion step.
                        Some(frame) => { let _ = self.fusion.ingest_frame(&frame, Utc::now()); }
                        None => {
                            warn!("segment stream closed");
                            frames_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    last = self.cycle(Utc::now());
                }
            }
        }

        info!(cycle = last.cycle, "central node stopped");
        last
    }

    fn cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let current = self.reader.snapshot();
        let (next, report) = self.fusion.fuse(&current, now);
        let status = self.fusion.status(&next, now);
        self.reader.publish(next, status);

        if let Some(bus) = &self.diagnostics
            && let Err(err) = bus.publish_json(Topic::Diagnostics, &Diagnostic::FusionCycle(report.clone()))
        {
            warn!(error = %err, "cycle report publish failed");
        }
        report
    }
}
