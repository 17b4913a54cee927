//! Asynchronous edge node runner.
//!
//! Owns a [`SegmentBuilder`], drains the sensor inbox, ticks on a fixed
//! interval and hands each segment to a [`SegmentSink`].
//!
//! ```text
//!  sensor drivers ──mpsc──► EdgeNode ──tick──► SegmentBuilder
//!                               │                    │
//!                               │◄──── MapSegment ───┘
//!                               ▼
//!                         SegmentSink (bus / broker)
//! ```
//!
//! A failed publish is logged and retried implicitly by the next tick,
//! which carries a newer sequence number and the full local view.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use palletmap_middleware::{SegmentBus, SegmentSink, Topic};
use palletmap_types::{Diagnostic, EdgeStatus, SensorReading};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::builder::SegmentBuilder;

/// Ticks between two published [`EdgeStatus`] diagnostics.
const STATUS_EVERY: u64 = 10;

pub struct EdgeNode {
    builder: SegmentBuilder,
    inbox: mpsc::Receiver<SensorReading>,
    sink: Arc<dyn SegmentSink>,
    tick: Duration,
    diagnostics: Option<SegmentBus>,
}

impl EdgeNode {
    pub fn new(
        builder: SegmentBuilder,
        inbox: mpsc::Receiver<SensorReading>,
        sink: Arc<dyn SegmentSink>,
        tick: Duration,
    ) -> Self {
        Self {
            builder,
            inbox,
            sink,
            tick,
            diagnostics: None,
        }
    }

    /// Also publish periodic [`Diagnostic::EdgeStatus`] messages on `bus`.
    pub fn with_diagnostics(mut self, bus: SegmentBus) -> Self {
        self.diagnostics = Some(bus);
        self
    }

    /// Run until `shutdown` flips to `true` or its sender drops.
    ///
    /// A closed inbox does not stop the node; tracked tags keep being
    /// predicted and emitted until they go stale.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> EdgeStatus {
        let node = self.builder.node().clone();
        info!(edge = %node, tick_ms = self.tick.as_millis() as u64, "edge node started");

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inbox_open = true;
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                reading = self.inbox.recv(), if inbox_open => {
                    match reading {
                        Some(reading) => self.builder.ingest(reading),
                        None => {
                            debug!(edge = %node, "sensor inbox closed");
                            inbox_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    self.on_tick(ticks).await;
                }
            }
        }

        let status = self.builder.status();
        info!(
            edge = %node,
            sequence = status.sequence,
            dropped = status.dropped_readings,
            failed_solves = status.failed_solves,
            "edge node stopped"
        );
        status
    }

    async fn on_tick(&mut self, ticks: u64) {
        // Drain whatever is already queued so the tick sees it.
        while let Ok(reading) = self.inbox.try_recv() {
            self.builder.ingest(reading);
        }

        let segment = self.builder.tick(Utc::now());
        debug!(
            edge = %segment.edge_node,
            sequence = segment.sequence,
            entries = segment.entries.len(),
            "segment built"
        );
        if let Err(err) = self.sink.send_segment(&segment).await {
            warn!(edge = %segment.edge_node, sequence = segment.sequence, error = %err, "segment publish failed");
        }

        if ticks % STATUS_EVERY == 0
            && let Some(bus) = &self.diagnostics
        {
            let status = Diagnostic::EdgeStatus(self.builder.status());
            if let Err(err) = bus.publish_json(Topic::Diagnostics, &status) {
                warn!(error = %err, "edge status publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderSettings;
    use crate::builder::tests::{geometry, ranges};
    use crate::registry::TagRegistry;
    use futures_util::StreamExt;
    use palletmap_middleware::{SegmentSource, decode};
    use palletmap_types::{EdgeNodeId, Point3};

    fn node(bus: &SegmentBus) -> (EdgeNode, mpsc::Sender<SensorReading>) {
        let builder = SegmentBuilder::new(
            &geometry(),
            &EdgeNodeId::from("edge-a"),
            BuilderSettings::default(),
            Arc::new(TagRegistry::default()),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel(64);
        let node = EdgeNode::new(builder, rx, Arc::new(bus.clone()), Duration::from_millis(20));
        (node, tx)
    }

    #[tokio::test]
    async fn emits_increasing_sequences_until_shutdown() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SegmentBus::default();
        let mut frames = bus.frames();
        let (node, _tx) = node(&bus);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(node.run(shutdown));

        let mut last = 0;
        for _ in 0..3 {
            let frame = frames.next().await.ok_or("stream ended")?;
            let envelope = decode(&frame)?;
            assert!(envelope.segment.sequence > last);
            last = envelope.segment.sequence;
        }

        stop.send(true)?;
        let status = handle.await?;
        assert!(status.sequence >= 3);
        Ok(())
    }

    #[tokio::test]
    async fn readings_reach_the_segment() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SegmentBus::default();
        let mut frames = bus.frames();
        let (node, tx) = node(&bus);
        let (stop, shutdown) = watch::channel(false);

        // Timestamp the ranges "now" so they fall inside the coherence window.
        let now = Utc::now();
        let g = geometry();
        for reading in ranges(&g, &["a1", "a2", "a3", "a4", "a5"], "u7", Point3::new(4.0, 4.0, 0.5), 0.0) {
            let reading = match reading {
                SensorReading::Range(mut m) => {
                    m.timestamp = now;
                    SensorReading::Range(m)
                }
                other => other,
            };
            tx.send(reading).await?;
        }
        let handle = tokio::spawn(node.run(shutdown));

        let mut found = false;
        for _ in 0..10 {
            let frame = frames.next().await.ok_or("stream ended")?;
            if !decode(&frame)?.segment.entries.is_empty() {
                found = true;
                break;
            }
        }
        assert!(found);

        stop.send(true)?;
        handle.await?;
        Ok(())
    }
}
