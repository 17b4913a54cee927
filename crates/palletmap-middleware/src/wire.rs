//! Edge→central wire format.
//!
//! A frame is the JSON encoding of a [`SegmentEnvelope`]:
//!
//! ```json
//! { "schema_version": 1, "message_id": "…uuid…", "segment": { … } }
//! ```
//!
//! [`decode`] parses and validates a frame; every violation maps to
//! [`MapError::MalformedSegment`] so the central node can reject that one
//! segment and carry on. [`envelope_schema`] exports the JSON Schema for
//! consumers outside the workspace.

use std::collections::BTreeSet;

use palletmap_types::{MapError, MapSegment};
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version written into every envelope and the only one accepted.
pub const SCHEMA_VERSION: u32 = 1;

/// A [`MapSegment`] as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentEnvelope {
    pub schema_version: u32,
    /// Unique per emission; duplicates of one frame share it.
    pub message_id: Uuid,
    pub segment: MapSegment,
}

impl SegmentEnvelope {
    /// Wrap `segment` with the current schema version and a fresh id.
    pub fn new(segment: MapSegment) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            message_id: Uuid::new_v4(),
            segment,
        }
    }
}

/// Validate and serialise a segment into a wire frame.
pub fn encode(segment: &MapSegment) -> Result<Vec<u8>, MapError> {
    validate(segment)?;
    serde_json::to_vec(&SegmentEnvelope::new(segment.clone()))
        .map_err(|e| MapError::MalformedSegment(format!("failed to encode segment: {e}")))
}

/// Parse and validate a wire frame.
pub fn decode(frame: &[u8]) -> Result<SegmentEnvelope, MapError> {
    let envelope: SegmentEnvelope = serde_json::from_slice(frame)
        .map_err(|e| MapError::MalformedSegment(format!("invalid envelope: {e}")))?;
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(MapError::MalformedSegment(format!(
            "unsupported schema version {} (expected {SCHEMA_VERSION})",
            envelope.schema_version
        )));
    }
    validate(&envelope.segment)?;
    Ok(envelope)
}

/// Structural checks shared by [`encode`] and [`decode`].
pub fn validate(segment: &MapSegment) -> Result<(), MapError> {
    let malformed = |msg: String| -> Result<(), MapError> { Err(MapError::MalformedSegment(msg)) };

    if segment.edge_node.as_str().trim().is_empty() {
        return malformed("empty edge node id".to_string());
    }
    if segment.coverage.len() < 3 {
        return malformed(format!(
            "coverage polygon has {} vertices, at least 3 required",
            segment.coverage.len()
        ));
    }
    if segment
        .coverage
        .iter()
        .any(|v| !v[0].is_finite() || !v[1].is_finite())
    {
        return malformed("non-finite coverage vertex".to_string());
    }

    let mut seen = BTreeSet::new();
    for entry in &segment.entries {
        if entry.tag_id.as_str().is_empty() {
            return malformed("entry with empty tag id".to_string());
        }
        if !seen.insert(&entry.tag_id) {
            return malformed(format!("duplicate entry for tag {}", entry.tag_id));
        }
        if !entry.position.is_finite() || !entry.velocity.is_finite() {
            return malformed(format!("non-finite position or velocity for {}", entry.tag_id));
        }
        if !entry.uncertainty.is_finite() || entry.uncertainty < 0.0 {
            return malformed(format!(
                "invalid uncertainty {} for {}",
                entry.uncertainty, entry.tag_id
            ));
        }
    }
    Ok(())
}

/// JSON Schema of [`SegmentEnvelope`].
pub fn envelope_schema() -> RootSchema {
    schemars::schema_for!(SegmentEnvelope)
}
