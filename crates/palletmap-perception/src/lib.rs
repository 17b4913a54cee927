//! `palletmap-perception` – from noisy ranges to smoothed tag positions.
//!
//! # Modules
//!
//! - [`geometry`] – [`Geometry`][geometry::Geometry]: static warehouse model
//!   (bounds, obstacles, anchors, RFID readers, edge coverage polygons) with
//!   point-in-polygon and obstacle path checks.
//! - [`trilateration`] – [`Trilaterator`][trilateration::Trilaterator]:
//!   linear, nonlinear and multilateral range solvers producing a
//!   [`PositionEstimate`][palletmap_types::PositionEstimate].
//! - [`filter`] – [`TagTracker`][filter::TagTracker]: per-tag temporal
//!   filtering (moving average, Kalman, particle) with stale-report and
//!   divergence checks.

pub mod filter;
pub mod geometry;
pub mod trilateration;
