//! Protocol codec for encoding/decoding records
//!
//! A record is an open-ended JSON object. The codec knows nothing about which keys
//! mean what; that lives in [`super::Message`].

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest datagram either side sends or reads
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// A schema-less key-value record as carried on the wire
pub type Record = Map<String, Value>;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Record too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Payload is not a record (expected a JSON object)")]
    NotARecord,
}

/// Encode a record into a datagram payload
///
/// Anything that serializes as a JSON object can be passed; typed maps keep their
/// own key order this way instead of the sorted order of [`Record`].
pub fn encode_record<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(record)?;

    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(payload.len(), MAX_DATAGRAM_SIZE));
    }

    Ok(payload)
}

/// Decode a datagram payload into a record
///
/// Garbage, truncated JSON and JSON that is not an object are all errors. Callers
/// treat any error as "nothing usable arrived".
pub fn decode_record(payload: &[u8]) -> Result<Record, CodecError> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(payload.len(), MAX_DATAGRAM_SIZE));
    }

    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(record) => Ok(record),
        _ => Err(CodecError::NotARecord),
    }
}
