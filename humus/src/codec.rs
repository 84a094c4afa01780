//! Encode/decode for state-change records.
//!
//! The persisted envelope is `{"entity", "action", "data", "nim", "ts",
//! "slot"}`. The stored `slot` is always zero; the authoritative value is
//! the stream sequence, stamped onto the compost at delivery time.

use forest_stream::{SequencedRecord, StreamError};
use forest_time::Time;
use forest_types::{Action, Compost};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
struct CompostWire {
    entity: String,
    action: String,
    data: Option<Value>,
    nim: String,
    ts: String,
    slot: u64,
}

/// Encode a validated compost into its log payload.
pub fn encode_compost(compost: &Compost) -> Result<Vec<u8>, StreamError> {
    let wire = CompostWire {
        entity: compost.entity.clone(),
        action: compost.action.as_str().to_string(),
        data: compost.data.clone(),
        nim: compost.producer.clone(),
        ts: compost.timestamp.to_rfc3339(),
        slot: 0,
    };
    serde_json::to_vec(&wire).map_err(|e| StreamError::unknown(e.to_string()))
}

/// Decode a stored log record back into a compost, with `slot` populated
/// from the stream metadata.
pub fn decode_compost(record: &SequencedRecord) -> Result<Compost, StreamError> {
    let wire: CompostWire =
        serde_json::from_slice(&record.payload).map_err(StreamError::invalid_data)?;
    let action: Action = wire.action.parse().map_err(StreamError::invalid_data)?;
    let timestamp = Time::from_rfc3339(&wire.ts).map_err(StreamError::invalid_data)?;

    let mut compost = Compost::new(wire.entity, action, wire.data, wire.nim, timestamp);
    compost.slot = record.slot;
    Ok(compost)
}
