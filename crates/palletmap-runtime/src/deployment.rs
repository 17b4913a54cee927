//! Wires a [`DeploymentConfig`] into running tasks.
//!
//! ```text
//!  Simulator / hardware ──inbox──► EdgeNode ─┐
//!  Simulator / hardware ──inbox──► EdgeNode ─┼─► SegmentSink ─► SegmentBus ─► CentralNode ─► MapReader
//!                                            ┘   (ChaosSink?)                 │
//!                                                                 Topic::Diagnostics
//! ```
//!
//! Everything runs on the caller's Tokio runtime. [`launch`] returns as
//! soon as the tasks are spawned; [`DeploymentHandle::shutdown`] flips the
//! shared watch channel and joins every task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use palletmap_central::{CentralNode, MapReader};
use palletmap_edge::{BuilderSettings, EdgeNode, SegmentBuilder, TagRegistry};
use palletmap_middleware::{SegmentBus, SegmentSink};
use palletmap_sim::{ChaosSink, Simulator};
use palletmap_types::{CycleReport, EdgeNodeId, EdgeStatus, SensorReading};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::config::{ConfigError, DeploymentConfig};

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Pipeline task failed: {0}")]
    Task(#[from] JoinError),
}

/// Final state of a stopped deployment.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub last_cycle: CycleReport,
    pub edges: Vec<EdgeStatus>,
}

/// Running pipeline.
pub struct DeploymentHandle {
    reader: MapReader,
    bus: SegmentBus,
    inboxes: BTreeMap<EdgeNodeId, mpsc::Sender<SensorReading>>,
    shutdown: watch::Sender<bool>,
    central: JoinHandle<CycleReport>,
    edges: Vec<JoinHandle<EdgeStatus>>,
    simulator: Option<JoinHandle<()>>,
}

/// Validate `config` and spawn the central node, one edge node per
/// coverage area and, when configured, the simulator.
///
/// Must be called from within a Tokio runtime.
pub fn launch(config: &DeploymentConfig) -> Result<DeploymentHandle, DeploymentError> {
    config.validate()?;

    let geometry = Arc::new(config.geometry.clone());
    let registry = Arc::new(TagRegistry::new(config.tags.clone()));
    let bus = SegmentBus::new(config.bus_capacity);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let sink: Arc<dyn SegmentSink> = match &config.chaos {
        Some(chaos) => {
            warn!(
                duplicate = chaos.duplicate_probability,
                hold = chaos.hold_probability,
                "chaos transport enabled"
            );
            Arc::new(ChaosSink::new(Arc::new(bus.clone()), chaos.clone()))
        }
        None => Arc::new(bus.clone()),
    };

    // Central subscribes in `new`, before any edge exists to publish.
    let central = CentralNode::new(
        Arc::clone(&geometry),
        config.fusion.clone(),
        &bus,
        Duration::from_millis(config.fusion_interval_ms),
    )
    .with_diagnostics(bus.clone());
    let reader = central.reader();
    let central = tokio::spawn(central.run(shutdown_rx.clone()));

    let settings = BuilderSettings {
        edge: config.edge.clone(),
        trilateration: config.trilateration.clone(),
        filter: config.filter.clone(),
    };
    let tick = Duration::from_millis(config.tick_ms);
    let mut inboxes = BTreeMap::new();
    let mut edges = Vec::with_capacity(geometry.edges.len());
    for coverage in &geometry.edges {
        let node = coverage.node.clone();
        let builder = SegmentBuilder::new(&geometry, &node, settings.clone(), Arc::clone(&registry))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown edge node '{node}'")))?;
        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let edge = EdgeNode::new(builder, rx, Arc::clone(&sink), tick).with_diagnostics(bus.clone());
        edges.push(tokio::spawn(edge.run(shutdown_rx.clone())));
        inboxes.insert(node, tx);
    }

    let simulator = config.simulation.as_ref().map(|sim| {
        let simulator = Simulator::new(Arc::clone(&geometry), sim.clone());
        tokio::spawn(simulator.run(inboxes.clone(), shutdown_rx.clone()))
    });

    info!(
        edges = edges.len(),
        tags = registry.len(),
        simulated = simulator.is_some(),
        "deployment launched"
    );

    Ok(DeploymentHandle {
        reader,
        bus,
        inboxes,
        shutdown,
        central,
        edges,
        simulator,
    })
}

impl DeploymentHandle {
    pub fn reader(&self) -> &MapReader {
        &self.reader
    }

    /// The bus carrying segments and diagnostics.
    pub fn bus(&self) -> &SegmentBus {
        &self.bus
    }

    /// Inbox of edge node `node`, for feeding readings from a live sensor
    /// adapter.
    pub fn inbox(&self, node: &EdgeNodeId) -> Option<mpsc::Sender<SensorReading>> {
        self.inboxes.get(node).cloned()
    }

    pub fn edge_nodes(&self) -> impl Iterator<Item = &EdgeNodeId> {
        self.inboxes.keys()
    }

    /// Stop every task and collect their final state.
    pub async fn shutdown(self) -> Result<ShutdownReport, DeploymentError> {
        let _ = self.shutdown.send(true);
        if let Some(simulator) = self.simulator {
            simulator.await?;
        }
        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in self.edges {
            edges.push(edge.await?);
        }
        let last_cycle = self.central.await?;
        info!(cycle = last_cycle.cycle, "deployment stopped");
        Ok(ShutdownReport { last_cycle, edges })
    }
}
