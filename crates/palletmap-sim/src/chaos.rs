//! [`ChaosSink`] – a [`SegmentSink`] wrapper that misbehaves on purpose.
//!
//! Used to exercise the central node's duplicate and reordering handling:
//! frames are duplicated with probability `duplicate_probability`, and held
//! back with probability `hold_probability` so that the next frame
//! overtakes them. Nothing is ever lost; held frames go out right after the
//! frame that overtook them.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use palletmap_middleware::{Frame, SegmentSink};
use palletmap_types::MapError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub duplicate_probability: f64,
    #[serde(default)]
    pub hold_probability: f64,
    #[serde(default)]
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            duplicate_probability: 0.1,
            hold_probability: 0.1,
            seed: 0,
        }
    }
}

struct ChaosState {
    rng: StdRng,
    held: Vec<Frame>,
}

pub struct ChaosSink {
    inner: Arc<dyn SegmentSink>,
    duplicate_probability: f64,
    hold_probability: f64,
    state: Mutex<ChaosState>,
}

impl ChaosSink {
    pub fn new(inner: Arc<dyn SegmentSink>, config: ChaosConfig) -> Self {
        Self {
            inner,
            duplicate_probability: config.duplicate_probability.clamp(0.0, 1.0),
            hold_probability: config.hold_probability.clamp(0.0, 1.0),
            state: Mutex::new(ChaosState {
                rng: StdRng::seed_from_u64(config.seed),
                held: Vec::new(),
            }),
        }
    }

    /// Decide what goes out for `frame`. The lock is released before any
    /// frame is awaited on.
    fn plan(&self, frame: Frame) -> Vec<Frame> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.rng.gen_bool(self.hold_probability) {
            debug!(held = state.held.len() + 1, "holding frame back");
            state.held.push(frame);
            return Vec::new();
        }
        let mut out = vec![frame.clone()];
        if state.rng.gen_bool(self.duplicate_probability) {
            debug!("duplicating frame");
            out.push(frame);
        }
        out.append(&mut state.held);
        out
    }

    /// Send every held frame.
    pub async fn flush(&self) -> Result<(), MapError> {
        let held = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.held)
        };
        for frame in held {
            self.inner.send(frame).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SegmentSink for ChaosSink {
    async fn send(&self, frame: Frame) -> Result<(), MapError> {
        for frame in self.plan(frame) {
            self.inner.send(frame).await?;
        }
        Ok(())
    }
}
