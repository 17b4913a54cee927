//! Sensor models.
//!
//! UWB ranges are the true anchor–tag distance plus Gaussian noise from the
//! anchor's [`NoiseProfile`](palletmap_perception::geometry::NoiseProfile).
//! With probability `outlier_probability` a range is a non-line-of-sight
//! outlier, which always reads long. Tags beyond `max_range` are not
//! ranged at all.
//!
//! RFID detections follow the reader's log-distance path-loss model with
//! Gaussian shadowing in dB and are only reported within `read_range`.

use chrono::{DateTime, Utc};
use palletmap_perception::geometry::{Anchor, RfidReader};
use palletmap_types::{DetectionEvent, Measurement, Point3};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

/// Smallest error bound ever reported with a range.
const MIN_ERROR_BOUND: f64 = 0.01;

/// Range the NLOS bias is drawn from (metres).
const NLOS_BIAS: std::ops::Range<f64> = 0.5..3.0;

/// Simulate one UWB range from `anchor` to a tag at `truth`.
pub fn sample_range(
    anchor: &Anchor,
    uwb_id: &str,
    truth: Point3,
    timestamp: DateTime<Utc>,
    sequence: u64,
    rng: &mut StdRng,
) -> Option<Measurement> {
    let distance = anchor.position.distance(truth);
    let noise = anchor.noise;
    if distance > noise.max_range {
        return None;
    }

    let gaussian: f64 = rng.sample(StandardNormal);
    let mut measured = distance + noise.std_dev * gaussian;
    if noise.outlier_probability > 0.0 && rng.gen_bool(noise.outlier_probability.clamp(0.0, 1.0)) {
        measured += rng.gen_range(NLOS_BIAS);
    }

    Some(Measurement {
        anchor: anchor.id.clone(),
        uwb_id: Some(uwb_id.to_string()),
        distance: measured.max(0.0),
        error_bound: noise.std_dev.max(MIN_ERROR_BOUND),
        timestamp,
        sequence,
    })
}

/// Simulate one RFID read of `rfid_id` at `truth` by `reader`.
pub fn sample_detection(
    reader: &RfidReader,
    rfid_id: &str,
    truth: Point3,
    shadowing_db: f64,
    timestamp: DateTime<Utc>,
    sequence: u64,
    rng: &mut StdRng,
) -> Option<DetectionEvent> {
    let distance = reader.position.distance(truth);
    if distance > reader.read_range {
        return None;
    }
    let gaussian: f64 = rng.sample(StandardNormal);
    Some(DetectionEvent {
        reader: reader.id.clone(),
        rfid_id: Some(rfid_id.to_string()),
        rssi_dbm: reader.rssi_at(distance) + shadowing_db * gaussian,
        timestamp,
        sequence,
    })
}
