//! `palletmap-sim` – virtual warehouse for driving the pipeline without
//! hardware.
//!
//! | Module       | Responsibility                                         |
//! |--------------|--------------------------------------------------------|
//! | [`movement`] | Static, linear, waypoint and random-walk trajectories  |
//! | [`sensors`]  | Noisy UWB range and RFID path-loss models              |
//! | [`scenario`] | Steps pallets and routes readings to edge inboxes      |
//! | [`chaos`]    | Transport wrapper that duplicates and reorders frames  |
//!
//! All randomness comes from seeded [`StdRng`](rand::rngs::StdRng)s, so a
//! scenario replays identically for a given seed.

pub mod chaos;
pub mod movement;
pub mod scenario;
pub mod sensors;

pub use chaos::{ChaosConfig, ChaosSink};
pub use movement::{Movement, Trajectory};
pub use scenario::{PalletTruth, SimulatedPallet, SimulationConfig, Simulator};
