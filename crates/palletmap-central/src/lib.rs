//! `palletmap-central` – merges edge segments into one global pallet map.
//!
//! | Module       | Responsibility                                            |
//! |--------------|-----------------------------------------------------------|
//! | [`map`]      | [`GlobalMap`]: canonical entries and bounded history      |
//! | [`fusion`]   | Segment admission, per-tag resolution, silence handling   |
//! | [`liveness`] | Edge link health from segment arrival times               |
//! | [`node`]     | Tokio task consuming the transport; [`MapReader`] queries |

pub mod fusion;
pub mod liveness;
pub mod map;
pub mod node;

pub use fusion::{FusionConfig, MapFusion, SystemStatus};
pub use liveness::{LinkMonitor, LinkReport, LinkState};
pub use map::{GlobalMap, HistoryPoint, MapEntry};
pub use node::{CentralNode, MapReader};
