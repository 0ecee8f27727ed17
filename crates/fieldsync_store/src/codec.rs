//! CBOR encode/decode helpers for stored values.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn roundtrip() {
        let sample = Sample {
            name: "crew".to_string(),
            count: 4,
        };
        let bytes = encode(&sample).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn decode_garbage_fails() {
        let result: StoreResult<Sample> = decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(StoreError::Codec(_))));
    }
}
