//! `palletmap-runtime` – turns a site description into a running pipeline.
//!
//! | Module         | Responsibility                                          |
//! |----------------|---------------------------------------------------------|
//! | [`config`]     | TOML deployment file, env overrides, validation         |
//! | [`deployment`] | Spawns central, edge and simulator tasks; shutdown      |
//! | [`telemetry`]  | `tracing` subscriber with optional OTLP span export     |

pub mod config;
pub mod deployment;
pub mod telemetry;

pub use config::{ConfigError, DeploymentConfig};
pub use deployment::{DeploymentError, DeploymentHandle, ShutdownReport, launch};
pub use telemetry::{TelemetryGuard, init_tracing};
