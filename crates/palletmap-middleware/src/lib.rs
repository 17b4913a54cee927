//! `palletmap-middleware` – moves map segments from edge nodes to the
//! central node without caring about their meaning.
//!
//! # Modules
//!
//! - [`wire`] – JSON envelope, validation and JSON Schema export.
//! - [`bus`] – topic-based publish/subscribe bus built on Tokio broadcast
//!   channels.
//! - [`transport`] – the [`SegmentSink`] / [`SegmentSource`] traits both
//!   sides of the pipeline are written against.

pub mod bus;
pub mod transport;
pub mod wire;

pub use bus::{Frame, SegmentBus, Topic, TopicReceiver};
pub use transport::{SegmentSink, SegmentSource};
pub use wire::{SegmentEnvelope, decode, encode};
