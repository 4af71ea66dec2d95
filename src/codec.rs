use std::io;

use serde_json::Value;

/// Round-trips task output values to bytes.
///
/// The codec is a collaborator seam: the cache records the codec's tag in
/// every entry's metadata and refuses to decode an entry written under a
/// different tag (such entries load as corrupt). Codecs that compress may
/// honour the recorded `compress_level`.
pub trait ValueCodec: Send + Sync {
    /// Short identifier written into `meta.json`.
    fn tag(&self) -> &str;

    fn encode(&self, value: &Value, compress_level: Option<i32>) -> io::Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> io::Result<Value>;
}

/// The default codec: plain JSON bytes, no compression.
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn tag(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value, _compress_level: Option<i32>) -> io::Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(io::Error::other)
    }

    fn decode(&self, bytes: &[u8]) -> io::Result<Value> {
        serde_json::from_slice(bytes).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let value = serde_json::json!({ "answer": 42, "items": [1, 2, 3] });
        let bytes = codec.encode(&value, None).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec;
        assert!(codec.decode(b"\x00\x01\x02").is_err());
    }
}
