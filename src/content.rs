//! Typed block payloads.
//!
//! Every structured block kind has a content struct here.  Each struct
//! carries both `serde` and `prost` derives so the payload-encoding table can
//! serialize it as JSON or protobuf without a second definition; raw-bytes
//! payloads bypass these types entirely.
//!
//! Contents are immutable snapshots: an update produces a new value and a new
//! block, never an in-place mutation of a sealed payload.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

// ── Compound email id ────────────────────────────────────────────────────────

/// `(block_id, local_id)` — names one email within an email-batch block.
/// Stable for the life of the database; re-filing an email never changes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompoundId {
    pub block_id: i64,
    pub local_id: i32,
}

impl CompoundId {
    pub fn new(block_id: i64, local_id: i32) -> Self {
        Self { block_id, local_id }
    }

    /// Big-endian key bytes so sidecar range scans sort by (block, slot).
    pub fn to_key(self) -> [u8; 12] {
        let mut k = [0u8; 12];
        k[..8].copy_from_slice(&self.block_id.to_be_bytes());
        k[8..].copy_from_slice(&self.local_id.to_be_bytes());
        k
    }

    pub fn from_key(k: &[u8]) -> Option<Self> {
        if k.len() != 12 {
            return None;
        }
        Some(Self {
            block_id: i64::from_be_bytes(k[..8].try_into().ok()?),
            local_id: i32::from_be_bytes(k[8..].try_into().ok()?),
        })
    }
}

impl fmt::Debug for CompoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_id, self.local_id)
    }
}

impl fmt::Display for CompoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_id, self.local_id)
    }
}

// ── Header content ───────────────────────────────────────────────────────────

/// Payload of the first metadata block — the format anchor of a file.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct HeaderContent {
    /// Packed `(major << 24) | (minor << 16) | patch`.
    #[prost(int32, tag = "1")]
    pub file_version: i32,
    #[prost(int64, tag = "2")]
    pub created_at: i64,
    #[prost(int64, tag = "3")]
    pub modified_at: i64,
    #[prost(int64, tag = "4")]
    pub first_metadata_offset: i64,
    #[prost(int64, tag = "5")]
    pub first_folder_tree_offset: i64,
    #[prost(int64, tag = "6")]
    pub first_cleanup_offset: i64,
    /// Capability bitmask; see `version::capability`.
    #[prost(uint64, tag = "7")]
    pub capabilities: u64,
    /// Per-kind block format versions, keyed by the kind discriminant.
    #[prost(map = "uint32, int32", tag = "8")]
    pub block_format_versions: HashMap<u32, i32>,
    /// Free-form metadata.
    #[prost(map = "string, string", tag = "9")]
    pub metadata: HashMap<String, String>,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Per-email derived metadata.  `envelope_hash` is SHA-256 over the
/// canonicalized header tuple; `content_hash` is SHA-256 over the raw bytes.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub from: String,
    #[prost(string, repeated, tag = "3")]
    pub to: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub cc: Vec<String>,
    #[prost(string, tag = "5")]
    pub subject: String,
    /// Date header, Unix seconds.
    #[prost(int64, tag = "6")]
    pub date: i64,
    /// Raw email size in bytes.
    #[prost(int64, tag = "7")]
    pub size: i64,
    #[prost(bytes = "vec", tag = "8")]
    pub envelope_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub content_hash: Vec<u8>,
    #[prost(string, tag = "10")]
    pub folder_path: String,
    #[prost(uint32, tag = "11")]
    pub flags: u32,
}

// ── Folder envelope content ──────────────────────────────────────────────────

/// One addressed envelope inside a folder-envelope block.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    #[prost(int64, tag = "1")]
    pub block_id: i64,
    #[prost(int32, tag = "2")]
    pub local_id: i32,
    #[prost(message, optional, tag = "3")]
    pub envelope: Option<Envelope>,
}

impl EnvelopeEntry {
    pub fn compound_id(&self) -> CompoundId {
        CompoundId::new(self.block_id, self.local_id)
    }
}

/// Ordered envelope listing for one folder path at one version.  Supersedes
/// `previous_block_id` (0 = first version); superseded bytes remain on disk
/// for proofs.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FolderEnvelopeContent {
    #[prost(string, tag = "1")]
    pub folder_path: String,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(int64, tag = "3")]
    pub previous_block_id: i64,
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<EnvelopeEntry>,
}

// ── Key manager content ──────────────────────────────────────────────────────

/// One per-block key wrapped under the master key (AES-256-GCM, random wrap
/// IV, tag appended to `wrapped`).
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct WrappedKey {
    #[prost(int64, tag = "1")]
    pub block_id: i64,
    /// `crypto::EncryptionAlgorithm` id this key material serves.
    #[prost(uint32, tag = "2")]
    pub algorithm: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub wrap_iv: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub wrapped: Vec<u8>,
    #[prost(int64, tag = "5")]
    pub created_at: i64,
    #[prost(bool, tag = "6")]
    pub active: bool,
}

/// Serialized key vault.  The verification hash and salt are the only
/// master-key oracles; no plaintext master key is ever written.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct KeyManagerContent {
    #[prost(bytes = "vec", tag = "1")]
    pub salt: Vec<u8>,
    /// `SHA256(master_key ‖ salt)`.
    #[prost(bytes = "vec", tag = "2")]
    pub verification_hash: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub keys: Vec<WrappedKey>,
}

// ── BlockContent ─────────────────────────────────────────────────────────────

/// The union the payload-encoding serializers operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content", rename_all = "kebab-case")]
pub enum BlockContent {
    Header(HeaderContent),
    KeyManager(KeyManagerContent),
    FolderEnvelope(FolderEnvelopeContent),
    Raw { bytes: Vec<u8> },
}

impl BlockContent {
    pub fn variant_name(&self) -> &'static str {
        match self {
            BlockContent::Header(_) => "header",
            BlockContent::KeyManager(_) => "key-manager",
            BlockContent::FolderEnvelope(_) => "folder-envelope",
            BlockContent::Raw { .. } => "raw",
        }
    }

    pub fn into_header(self) -> Result<HeaderContent, CodecError> {
        match self {
            BlockContent::Header(h) => Ok(h),
            other => Err(mismatch("header", &other)),
        }
    }

    pub fn into_key_manager(self) -> Result<KeyManagerContent, CodecError> {
        match self {
            BlockContent::KeyManager(k) => Ok(k),
            other => Err(mismatch("key-manager", &other)),
        }
    }

    pub fn into_folder_envelope(self) -> Result<FolderEnvelopeContent, CodecError> {
        match self {
            BlockContent::FolderEnvelope(f) => Ok(f),
            other => Err(mismatch("folder-envelope", &other)),
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>, CodecError> {
        match self {
            BlockContent::Raw { bytes } => Ok(bytes),
            other => Err(mismatch("raw", &other)),
        }
    }
}

fn mismatch(expected: &'static str, found: &BlockContent) -> CodecError {
    CodecError::EncodingMismatch {
        expected,
        found: found.variant_name(),
    }
}

// ── Protobuf framing for BlockContent ────────────────────────────────────────

/// Protobuf carrier for [`BlockContent`] — one oneof over the content kinds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContentFrame {
    #[prost(oneof = "content_frame::Payload", tags = "1, 2, 3, 15")]
    pub payload: Option<content_frame::Payload>,
}

pub mod content_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Header(super::HeaderContent),
        #[prost(message, tag = "2")]
        KeyManager(super::KeyManagerContent),
        #[prost(message, tag = "3")]
        FolderEnvelope(super::FolderEnvelopeContent),
        #[prost(bytes = "vec", tag = "15")]
        Raw(Vec<u8>),
    }
}

impl From<BlockContent> for ContentFrame {
    fn from(c: BlockContent) -> Self {
        let payload = match c {
            BlockContent::Header(h) => content_frame::Payload::Header(h),
            BlockContent::KeyManager(k) => content_frame::Payload::KeyManager(k),
            BlockContent::FolderEnvelope(f) => content_frame::Payload::FolderEnvelope(f),
            BlockContent::Raw { bytes } => content_frame::Payload::Raw(bytes),
        };
        Self { payload: Some(payload) }
    }
}

impl TryFrom<ContentFrame> for BlockContent {
    type Error = CodecError;

    fn try_from(f: ContentFrame) -> Result<Self, CodecError> {
        match f.payload {
            Some(content_frame::Payload::Header(h)) => Ok(BlockContent::Header(h)),
            Some(content_frame::Payload::KeyManager(k)) => Ok(BlockContent::KeyManager(k)),
            Some(content_frame::Payload::FolderEnvelope(e)) => Ok(BlockContent::FolderEnvelope(e)),
            Some(content_frame::Payload::Raw(bytes)) => Ok(BlockContent::Raw { bytes }),
            None => Err(CodecError::Serialize("empty protobuf content frame".into())),
        }
    }
}

