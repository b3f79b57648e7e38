//! CBOR helpers shared by snapshots, tokens and record payloads.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
///
/// # Errors
///
/// Returns a codec error if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns a codec error if the bytes are not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::types::RecordType;

    #[test]
    fn record_decodes_to_equal_value() {
        let record = Record::new(RecordType::Steps, "com.example", 7).with_payload(vec![9; 4]);
        let bytes = to_cbor(&record).unwrap();
        let decoded: Record = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: CoreResult<Record> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Codec { .. })));
    }
}
