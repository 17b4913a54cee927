//! `palletmap-edge` – the per-zone half of the pipeline.
//!
//! Turns raw UWB ranges and RFID detections into periodic
//! [`MapSegment`](palletmap_types::MapSegment)s.
//!
//! | Module       | Responsibility                                           |
//! |--------------|----------------------------------------------------------|
//! | [`registry`] | Known tags and their UWB / RFID identifiers              |
//! | [`builder`]  | Synchronous solve → filter → correlate → emit pipeline   |
//! | [`node`]     | Tokio task driving a builder from an inbox on a ticker   |

pub mod builder;
pub mod node;
pub mod registry;

pub use builder::{BuilderSettings, EdgeConfig, SegmentBuilder};
pub use node::EdgeNode;
pub use registry::TagRegistry;
