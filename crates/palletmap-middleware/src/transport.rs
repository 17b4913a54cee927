//! Edge↔central transport contract.
//!
//! Edge nodes never talk to the central node directly. They hand encoded
//! frames to a [`SegmentSink`]; the central node consumes a [`SegmentSource`]
//! stream. Delivery is best-effort with no ordering guarantee. Duplicates
//! and reordering are absorbed by the per-node sequence check at the
//! central node. A subscriber that falls more than the channel capacity
//! behind skips the oldest frames; since every segment carries the node's
//! full coverage, the next accepted sequence number restores its state.
//! Only frames sent after [`SegmentSource::frames`] returns are seen, so
//! consumers subscribe before the producers start.
//!
//! [`SegmentBus`] implements both sides in-process. A broker-backed
//! transport only has to implement these two traits.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use palletmap_types::{MapError, MapSegment};

use crate::bus::{Frame, SegmentBus, Topic};
use crate::wire;

/// Edge side of the transport.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    /// Deliver one encoded frame.
    async fn send(&self, frame: Frame) -> Result<(), MapError>;

    /// Encode and deliver `segment`.
    async fn send_segment(&self, segment: &MapSegment) -> Result<(), MapError> {
        let frame = wire::encode(segment)?;
        self.send(Frame::new(frame)).await
    }
}

/// Central side of the transport.
pub trait SegmentSource: Send + Sync {
    /// Subscribe now and return a live stream of frames; it ends when the
    /// transport shuts down.
    fn frames(&self) -> BoxStream<'static, Frame>;
}

#[async_trait]
impl SegmentSink for SegmentBus {
    async fn send(&self, frame: Frame) -> Result<(), MapError> {
        self.publish_to(Topic::Segments, frame);
        Ok(())
    }
}

impl SegmentSource for SegmentBus {
    fn frames(&self) -> BoxStream<'static, Frame> {
        let receiver = self.subscribe_to(Topic::Segments);
        stream::unfold(receiver, |mut rx| async move {
            let frame = rx.recv().await?;
            Some((frame, rx))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palletmap_types::EdgeNodeId;

    fn segment(seq: u64) -> MapSegment {
        MapSegment {
            edge_node: EdgeNodeId::from("edge-a"),
            sequence: seq,
            emitted_at: Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            coverage: vec![[0.0, 0.0], [5.0, 0.0], [5.0, 5.0], [0.0, 5.0]],
            entries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn segments_flow_from_sink_to_source() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SegmentBus::default();
        let mut frames = bus.frames();

        bus.send_segment(&segment(1)).await?;
        bus.send_segment(&segment(2)).await?;

        for expected in [1, 2] {
            let frame = frames.next().await.ok_or("stream ended early")?;
            let envelope = wire::decode(&frame)?;
            assert_eq!(envelope.segment.sequence, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn invalid_segment_is_not_sent() {
        let bus = SegmentBus::default();
        let mut bad = segment(1);
        bad.coverage.clear();
        let err = bus.send_segment(&bad).await.unwrap_err();
        assert!(matches!(err, MapError::MalformedSegment(_)));
    }

    #[tokio::test]
    async fn source_stream_ends_when_all_senders_drop() {
        let bus = SegmentBus::default();
        let mut frames = bus.frames();
        drop(bus);
        assert!(frames.next().await.is_none());
    }
}
