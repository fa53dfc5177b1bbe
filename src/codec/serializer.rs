//! Payload-encoding serializer table.
//!
//! The `payload_encoding` wire byte selects one of four structural
//! serializers from a fixed table.  Dispatch never falls back: a byte whose
//! serializer is unavailable (capnproto in this build) fails the operation,
//! mirroring the fail-hard rule of the compression registry.

use prost::Message;

use crate::block::PayloadEncoding;
use crate::codec::CodecError;
use crate::content::{BlockContent, ContentFrame};

pub trait PayloadSerializer: Send + Sync {
    fn encoding(&self) -> PayloadEncoding;
    fn to_bytes(&self, content: &BlockContent) -> Result<Vec<u8>, CodecError>;
    fn from_bytes(&self, bytes: &[u8]) -> Result<BlockContent, CodecError>;
}

// ── Implementations ──────────────────────────────────────────────────────────

struct ProtobufSerializer;
impl PayloadSerializer for ProtobufSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Protobuf
    }
    fn to_bytes(&self, content: &BlockContent) -> Result<Vec<u8>, CodecError> {
        Ok(ContentFrame::from(content.clone()).encode_to_vec())
    }
    fn from_bytes(&self, bytes: &[u8]) -> Result<BlockContent, CodecError> {
        let frame =
            ContentFrame::decode(bytes).map_err(|e| CodecError::Serialize(e.to_string()))?;
        BlockContent::try_from(frame)
    }
}

/// The wire value is frozen and recognized, but no schema compiler ships in
/// this build; both directions fail hard.
struct CapnprotoSerializer;
impl PayloadSerializer for CapnprotoSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Capnproto
    }
    fn to_bytes(&self, _: &BlockContent) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::EncodingUnsupported { encoding: "capnproto" })
    }
    fn from_bytes(&self, _: &[u8]) -> Result<BlockContent, CodecError> {
        Err(CodecError::EncodingUnsupported { encoding: "capnproto" })
    }
}

struct JsonSerializer;
impl PayloadSerializer for JsonSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Json
    }
    fn to_bytes(&self, content: &BlockContent) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(content).map_err(|e| CodecError::Serialize(e.to_string()))
    }
    fn from_bytes(&self, bytes: &[u8]) -> Result<BlockContent, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Serialize(e.to_string()))
    }
}

/// Raw bytes pass through untouched; structured contents do not fit here.
struct RawSerializer;
impl PayloadSerializer for RawSerializer {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Raw
    }
    fn to_bytes(&self, content: &BlockContent) -> Result<Vec<u8>, CodecError> {
        match content {
            BlockContent::Raw { bytes } => Ok(bytes.clone()),
            other => Err(CodecError::EncodingMismatch {
                expected: "raw",
                found: other.variant_name(),
            }),
        }
    }
    fn from_bytes(&self, bytes: &[u8]) -> Result<BlockContent, CodecError> {
        Ok(BlockContent::Raw { bytes: bytes.to_vec() })
    }
}

// ── Fixed dispatch table ─────────────────────────────────────────────────────

static PROTOBUF: ProtobufSerializer = ProtobufSerializer;
static CAPNPROTO: CapnprotoSerializer = CapnprotoSerializer;
static JSON: JsonSerializer = JsonSerializer;
static RAW: RawSerializer = RawSerializer;

/// Resolve the serializer for an encoding byte.  Total over the enum; the
/// capnproto entry exists but fails on use.
pub fn serializer_for(encoding: PayloadEncoding) -> &'static dyn PayloadSerializer {
    match encoding {
        PayloadEncoding::Protobuf => &PROTOBUF,
        PayloadEncoding::Capnproto => &CAPNPROTO,
        PayloadEncoding::Json => &JSON,
        PayloadEncoding::Raw => &RAW,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::HeaderContent;

    fn sample() -> BlockContent {
        BlockContent::Header(HeaderContent {
            file_version: (2 << 24) | (0 << 16) | 0,
            created_at: 1_700_000_000,
            modified_at: 1_700_000_000,
            capabilities: 0b110,
            ..Default::default()
        })
    }

    #[test]
    fn json_and_protobuf_round_trip() {
        for enc in [PayloadEncoding::Json, PayloadEncoding::Protobuf] {
            let s = serializer_for(enc);
            let bytes = s.to_bytes(&sample()).unwrap();
            assert_eq!(s.from_bytes(&bytes).unwrap(), sample());
        }
    }

    #[test]
    fn raw_rejects_structured_content() {
        let err = serializer_for(PayloadEncoding::Raw).to_bytes(&sample()).unwrap_err();
        assert!(matches!(err, CodecError::EncodingMismatch { .. }));
    }

    #[test]
    fn capnproto_is_unavailable() {
        let err = serializer_for(PayloadEncoding::Capnproto).to_bytes(&sample()).unwrap_err();
        assert!(matches!(err, CodecError::EncodingUnsupported { .. }));
    }
}
