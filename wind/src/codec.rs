//! Encode/decode for leaves on the bus.
//!
//! The wire format is a JSON envelope: `{"subject", "data", "source", "ts"}`
//! with an RFC3339 timestamp. Anything that decodes is still re-validated
//! before it reaches a handler.

use forest_time::Time;
use forest_types::Leaf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::WindError;

#[derive(Debug, Serialize, Deserialize)]
struct LeafWire {
    subject: String,
    data: Value,
    source: String,
    ts: String,
}

/// Encode a validated leaf into its bus payload.
pub fn encode_leaf(leaf: &Leaf) -> Result<Vec<u8>, WindError> {
    let wire = LeafWire {
        subject: leaf.subject.clone(),
        data: leaf.data.clone(),
        source: leaf.source.clone(),
        ts: leaf.timestamp.to_rfc3339(),
    };
    serde_json::to_vec(&wire).map_err(WindError::internal)
}

/// Decode a bus payload back into a leaf.
///
/// The result still needs [`Leaf::validate`] before it may be handed to user
/// code; decoding only proves the envelope shape.
pub fn decode_leaf(payload: &[u8]) -> Result<Leaf, WindError> {
    let wire: LeafWire = serde_json::from_slice(payload).map_err(WindError::decode)?;
    let timestamp = Time::from_rfc3339(&wire.ts).map_err(WindError::decode)?;
    Ok(Leaf {
        subject: wire.subject,
        data: wire.data,
        source: wire.source,
        timestamp,
    })
}
