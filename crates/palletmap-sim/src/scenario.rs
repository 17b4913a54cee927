//! Warehouse scenario driver.
//!
//! A [`Simulator`] moves a set of virtual pallets through the warehouse,
//! samples every anchor and reader against them and routes each reading to
//! the edge nodes that own the sensor. An anchor shared by two coverage
//! areas feeds both nodes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use palletmap_perception::geometry::Geometry;
use palletmap_types::{AnchorId, EdgeNodeId, Point3, ReaderId, SensorReading};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::movement::{Movement, Trajectory};
use crate::sensors::{sample_detection, sample_range};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// One virtual pallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedPallet {
    /// UWB id the pallet's tag answers to; no ranges without one.
    #[serde(default)]
    pub uwb_id: Option<String>,
    /// RFID id on the pallet label; no detections without one.
    #[serde(default)]
    pub rfid_id: Option<String>,
    pub start: Point3,
    #[serde(default)]
    pub movement: Movement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulation step, also the UWB ranging period (milliseconds).
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    /// RFID inventory rounds per UWB step; 5 means every fifth step.
    #[serde(default = "default_rfid_every")]
    pub rfid_every: u64,
    /// Log-normal shadowing of RFID RSSI (dB).
    #[serde(default = "default_rssi_shadowing_db")]
    pub rssi_shadowing_db: f64,
    #[serde(default)]
    pub pallets: Vec<SimulatedPallet>,
}

fn default_seed() -> u64 {
    7
}
fn default_step_ms() -> u64 {
    100
}
fn default_rfid_every() -> u64 {
    5
}
fn default_rssi_shadowing_db() -> f64 {
    2.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            step_ms: default_step_ms(),
            rfid_every: default_rfid_every(),
            rssi_shadowing_db: default_rssi_shadowing_db(),
            pallets: Vec::new(),
        }
    }
}

/// Ground truth of one pallet.
#[derive(Debug, Clone, PartialEq)]
pub struct PalletTruth {
    pub uwb_id: Option<String>,
    pub rfid_id: Option<String>,
    pub position: Point3,
}

// ────────────────────────────────────────────────────────────────────────────
// Simulator
// ────────────────────────────────────────────────────────────────────────────

struct Pallet {
    uwb_id: Option<String>,
    rfid_id: Option<String>,
    trajectory: Trajectory,
}

pub struct Simulator {
    geometry: Arc<Geometry>,
    config: SimulationConfig,
    pallets: Vec<Pallet>,
    anchor_routes: BTreeMap<AnchorId, Vec<EdgeNodeId>>,
    reader_routes: BTreeMap<ReaderId, Vec<EdgeNodeId>>,
    rng: StdRng,
    sequence: u64,
    steps: u64,
}

impl Simulator {
    pub fn new(geometry: Arc<Geometry>, config: SimulationConfig) -> Self {
        let mut anchor_routes: BTreeMap<AnchorId, Vec<EdgeNodeId>> = BTreeMap::new();
        let mut reader_routes: BTreeMap<ReaderId, Vec<EdgeNodeId>> = BTreeMap::new();
        for edge in &geometry.edges {
            for anchor in &edge.anchors {
                anchor_routes.entry(anchor.clone()).or_default().push(edge.node.clone());
            }
            for reader in &edge.readers {
                reader_routes.entry(reader.clone()).or_default().push(edge.node.clone());
            }
        }
        let pallets = config
            .pallets
            .iter()
            .map(|p| Pallet {
                uwb_id: p.uwb_id.clone(),
                rfid_id: p.rfid_id.clone(),
                trajectory: Trajectory::new(p.start, p.movement.clone()),
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            geometry,
            config,
            pallets,
            anchor_routes,
            reader_routes,
            sequence: 0,
            steps: 0,
        }
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.config.step_ms.max(1))
    }

    pub fn truth(&self) -> Vec<PalletTruth> {
        self.pallets
            .iter()
            .map(|p| PalletTruth {
                uwb_id: p.uwb_id.clone(),
                rfid_id: p.rfid_id.clone(),
                position: p.trajectory.position(),
            })
            .collect()
    }

    /// Advance the world by `dt` seconds and sample every sensor at `now`.
    ///
    /// Returns each reading paired with the edge node it is routed to.
    pub fn step(&mut self, dt: f64, now: DateTime<Utc>) -> Vec<(EdgeNodeId, SensorReading)> {
        self.steps += 1;
        let rfid_round = self.steps % self.config.rfid_every.max(1) == 0;
        let mut out = Vec::new();

        for pallet in &mut self.pallets {
            pallet.trajectory.advance(dt, &self.geometry, &mut self.rng);
            let truth = pallet.trajectory.position();

            if let Some(uwb_id) = &pallet.uwb_id {
                for anchor in &self.geometry.anchors {
                    let Some(routes) = self.anchor_routes.get(&anchor.id) else {
                        continue;
                    };
                    self.sequence += 1;
                    let Some(m) = sample_range(anchor, uwb_id, truth, now, self.sequence, &mut self.rng)
                    else {
                        continue;
                    };
                    for node in routes {
                        out.push((node.clone(), SensorReading::Range(m.clone())));
                    }
                }
            }

            if rfid_round && let Some(rfid_id) = &pallet.rfid_id {
                for reader in &self.geometry.readers {
                    let Some(routes) = self.reader_routes.get(&reader.id) else {
                        continue;
                    };
                    self.sequence += 1;
                    let Some(d) = sample_detection(
                        reader,
                        rfid_id,
                        truth,
                        self.config.rssi_shadowing_db,
                        now,
                        self.sequence,
                        &mut self.rng,
                    ) else {
                        continue;
                    };
                    for node in routes {
                        out.push((node.clone(), SensorReading::Detection(d.clone())));
                    }
                }
            }
        }
        out
    }

    /// Drive the simulation in real time, feeding each edge node's inbox,
    /// until `shutdown` flips to `true`.
    pub async fn run(
        mut self,
        inboxes: BTreeMap<EdgeNodeId, mpsc::Sender<SensorReading>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.step_interval();
        let dt = interval.as_secs_f64();
        let mut ticker = tokio::time::interval(interval);
        info!(pallets = self.pallets.len(), step_ms = interval.as_millis() as u64, "simulation started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let readings = self.step(dt, Utc::now());
                    debug!(readings = readings.len(), "simulation step");
                    for (node, reading) in readings {
                        let Some(inbox) = inboxes.get(&node) else {
                            continue;
                        };
                        // A full inbox drops the reading, like a saturated sensor link.
                        if let Err(err) = inbox.try_send(reading) {
                            warn!(edge = %node, error = %err, "reading dropped");
                        }
                    }
                }
            }
        }
        info!(steps = self.steps, "simulation stopped");
    }
}
