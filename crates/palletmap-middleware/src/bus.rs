//! In-process, topic-based publish/subscribe bus for wire frames.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber
//! receives every frame without any single subscriber blocking the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Segments`] | Encoded [`SegmentEnvelope`][crate::wire::SegmentEnvelope] frames from edge nodes |
//! | [`Topic::Diagnostics`] | JSON health reports (fusion cycle reports, edge status) |

use std::sync::Arc;

use palletmap_types::MapError;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered frames before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// A serialised message shared between all subscribers.
pub type Frame = Arc<Vec<u8>>;

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Map segments travelling from edge nodes to the central node.
    Segments,
    /// Health and diagnostics reports.
    Diagnostics,
}

/// Shared frame bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct SegmentBus {
    segments: broadcast::Sender<Frame>,
    diagnostics: broadcast::Sender<Frame>,
}

impl SegmentBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (segments, _) = broadcast::channel(capacity.max(1));
        let (diagnostics, _) = broadcast::channel(capacity.max(1));
        Self {
            segments,
            diagnostics,
        }
    }

    /// Publish `frame` to the given [`Topic`].
    ///
    /// Returns the number of subscribers that were handed the frame; `Ok(0)`
    /// when nobody is listening yet.
    pub fn publish_to(&self, topic: Topic, frame: Frame) -> usize {
        self.topic_sender(topic).send(frame).unwrap_or(0)
    }

    /// Serialise `value` as JSON and publish it.
    pub fn publish_json<T: Serialize>(&self, topic: Topic, value: &T) -> Result<usize, MapError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| MapError::Transport(format!("failed to serialise {topic:?} message: {e}")))?;
        Ok(self.publish_to(topic, Arc::new(bytes)))
    }

    /// Subscribe to a single [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Frame> {
        match topic {
            Topic::Segments => &self.segments,
            Topic::Diagnostics => &self.diagnostics,
        }
    }
}

impl Default for SegmentBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`].
///
/// Obtained via [`SegmentBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Frame>,
}

impl TopicReceiver {
    /// Wait for the next frame, skipping over frames lost to lag.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged; frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
