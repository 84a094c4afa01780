//! Encode/decode for ingress records.
//!
//! The persisted envelope is `{"subject", "data", "ts"}` with the payload
//! base64-coded, since raw ingress bytes need not be JSON (or even UTF-8).

use forest_stream::{SequencedRecord, StreamError};
use forest_time::Time;
use forest_types::RiverData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct RiverWire {
    subject: String,
    data: String,
    ts: String,
}

/// Encode a validated ingress record into its log payload.
pub fn encode_river_data(data: &RiverData) -> Result<Vec<u8>, StreamError> {
    let wire = RiverWire {
        subject: data.subject.clone(),
        data: base64::encode(&data.data),
        ts: data.timestamp.to_rfc3339(),
    };
    serde_json::to_vec(&wire).map_err(|e| StreamError::unknown(e.to_string()))
}

/// Decode a stored log record back into an ingress record.
pub fn decode_river_data(record: &SequencedRecord) -> Result<RiverData, StreamError> {
    let wire: RiverWire =
        serde_json::from_slice(&record.payload).map_err(StreamError::invalid_data)?;
    let data = base64::decode(&wire.data).map_err(StreamError::invalid_data)?;
    let timestamp = Time::from_rfc3339(&wire.ts).map_err(StreamError::invalid_data)?;
    Ok(RiverData {
        subject: wire.subject,
        data,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_stream::StreamErrorKind;
    use forest_types::Slot;

    #[test]
    fn round_trip_preserves_raw_bytes() {
        let original = RiverData::new(
            "camera.frame",
            vec![0x00, 0xff, 0x7f, 0x80],
            Time::from_timestamp_millis(1_600_000_000_123),
        );
        let payload = encode_river_data(&original).unwrap();

        let record = SequencedRecord {
            slot: Slot::new(1),
            subject: original.subject.clone(),
            payload,
            timestamp: original.timestamp,
        };
        let decoded = decode_river_data(&record).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_payload_fails_decode() {
        let record = SequencedRecord {
            slot: Slot::new(1),
            subject: "river.x".to_string(),
            payload: b"nope".to_vec(),
            timestamp: Time::from_timestamp_millis(0),
        };
        let err = decode_river_data(&record).unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::InvalidData);
    }
}
