//! Block format v2 — fully self-describing, mandatory checksums.
//!
//! # On-disk layout (61 bytes fixed overhead, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   header_magic    = 0x00EE411DBBD114EE  (LE u64)
//!    8      2   version         block format version  (LE u16)
//!   10      1   kind            BlockKind discriminant
//!   11      1   flags           0x01=COMPRESSED  0x02=ENCRYPTED
//!   12      1   payload_encoding  0=protobuf 1=capnproto 2=json 3=raw
//!   13      8   timestamp       Unix seconds          (LE i64)
//!   21      8   block_id                              (LE i64)
//!   29      8   payload_length                        (LE i64)
//!   37      4   header_crc32    CRC32([0..37)) ← LAST (LE u32)
//!   41      …   payload bytes
//!    +      4   payload_crc32   CRC32(payload); 0 when payload is empty
//!    +      8   footer_magic    = !header_magic       (LE u64)
//!    +      8   total_length    = 61 + payload_length (LE i64)
//! ```
//!
//! # Endianness
//! Every numeric field is little-endian.  This is non-negotiable and encoded
//! in the format version.
//!
//! # Checksums
//! Both CRCs are CRC-32/ISO-HDLC (ITU-T V.42), the polynomial `crc32fast`
//! computes.  `header_crc32` covers the 37 header bytes before it, so header
//! corruption is detected before any payload allocation is attempted.
//! `payload_crc32` covers the encoded payload exactly.  Both checks are
//! mandatory; there is no opt-out.
//!
//! # Recovery
//! Every block carries its own id, kind, and length, so the full location
//! index is reconstructible by scanning forward for `header_magic` without
//! any external state; see `engine::scan`.

use crc32fast::Hasher;

use crate::error::{Error, Result};

// ── Constants ────────────────────────────────────────────────────────────────

/// On-disk magic opening every block header.  LE u64.
pub const HEADER_MAGIC: u64 = 0x00EE_411D_BBD1_14EE;

/// Footer magic: bitwise complement of the header magic.
pub const FOOTER_MAGIC: u64 = !HEADER_MAGIC;

/// Current block format version.
pub const BLOCK_FORMAT_VERSION: u16 = 2;

/// Header bytes covered by `header_crc32`.
pub const HEADER_SIZE: usize = 37;

/// Header bytes including the trailing `header_crc32`.
pub const HEADER_WITH_CRC: usize = 41;

/// Fixed per-block overhead: header (37) + header CRC (4) + payload CRC (4)
/// + footer magic (8) + total length (8).
pub const FIXED_OVERHEAD: usize = 61;

// ── Flags ────────────────────────────────────────────────────────────────────

/// Payload passed through a compression algorithm (see extended header).
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Payload encrypted after compression (see extended header).
pub const FLAG_ENCRYPTED: u8 = 0x02;

// ── Block kind ───────────────────────────────────────────────────────────────

/// Discriminates the role of a block within the store.  This is the v2 set;
/// discriminants start at 1 and value 0 is rejected as framing corruption,
/// never remapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    Metadata = 1,
    /// Reserved.  Declared by the format but unused; durability comes from
    /// append-only framing plus fsync-on-append.
    Wal = 2,
    FolderTree = 3,
    Folder = 4,
    EmailBatch = 5,
    FolderEnvelope = 6,
    /// Legacy segment blocks from major-version-1 files.
    Segment = 7,
    KeyManager = 8,
    KeyExchange = 9,
    ZoneTreeKv = 10,
    ZoneTreeVector = 11,
    Cleanup = 12,
    FreeSpace = 13,
}

impl BlockKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(BlockKind::Metadata),
            2 => Some(BlockKind::Wal),
            3 => Some(BlockKind::FolderTree),
            4 => Some(BlockKind::Folder),
            5 => Some(BlockKind::EmailBatch),
            6 => Some(BlockKind::FolderEnvelope),
            7 => Some(BlockKind::Segment),
            8 => Some(BlockKind::KeyManager),
            9 => Some(BlockKind::KeyExchange),
            10 => Some(BlockKind::ZoneTreeKv),
            11 => Some(BlockKind::ZoneTreeVector),
            12 => Some(BlockKind::Cleanup),
            13 => Some(BlockKind::FreeSpace),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            BlockKind::Metadata => "metadata",
            BlockKind::Wal => "wal",
            BlockKind::FolderTree => "folder-tree",
            BlockKind::Folder => "folder",
            BlockKind::EmailBatch => "email-batch",
            BlockKind::FolderEnvelope => "folder-envelope",
            BlockKind::Segment => "segment",
            BlockKind::KeyManager => "key-manager",
            BlockKind::KeyExchange => "key-exchange",
            BlockKind::ZoneTreeKv => "zonetree-kv",
            BlockKind::ZoneTreeVector => "zonetree-vector",
            BlockKind::Cleanup => "cleanup",
            BlockKind::FreeSpace => "free-space",
        }
    }
}

// ── Payload encoding ─────────────────────────────────────────────────────────

/// Structural serializer applied to the payload before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadEncoding {
    Protobuf = 0,
    /// Recognized on the wire; no serializer in this build.
    Capnproto = 1,
    Json = 2,
    Raw = 3,
}

impl PayloadEncoding {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PayloadEncoding::Protobuf),
            1 => Some(PayloadEncoding::Capnproto),
            2 => Some(PayloadEncoding::Json),
            3 => Some(PayloadEncoding::Raw),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PayloadEncoding::Protobuf => "protobuf",
            PayloadEncoding::Capnproto => "capnproto",
            PayloadEncoding::Json => "json",
            PayloadEncoding::Raw => "raw",
        }
    }
}

// ── Block ────────────────────────────────────────────────────────────────────

/// A fully materialized block: header fields plus the encoded payload bytes
/// exactly as framed on disk (post compression/encryption).  Immutable once
/// sealed; the engine never rewrites published frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub version: u16,
    pub kind: BlockKind,
    pub flags: u8,
    pub payload_encoding: PayloadEncoding,
    pub timestamp: i64,
    pub block_id: i64,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(kind: BlockKind, block_id: i64, encoding: PayloadEncoding, payload: Vec<u8>) -> Self {
        Self {
            version: BLOCK_FORMAT_VERSION,
            kind,
            flags: 0,
            payload_encoding: encoding,
            timestamp: chrono::Utc::now().timestamp(),
            block_id,
            payload,
        }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Total on-disk frame length for this block.
    #[inline]
    pub fn frame_len(&self) -> usize {
        FIXED_OVERHEAD + self.payload.len()
    }

    /// The 37 canonical header bytes (without the CRC).  Also the per-block
    /// input to the hash chain.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        buf[10] = self.kind as u8;
        buf[11] = self.flags;
        buf[12] = self.payload_encoding as u8;
        buf[13..21].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[21..29].copy_from_slice(&self.block_id.to_le_bytes());
        buf[29..37].copy_from_slice(&(self.payload.len() as i64).to_le_bytes());
        buf
    }

    /// Serialize the full frame: header, header CRC, payload, payload CRC,
    /// footer magic, total length.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());

        let header = self.header_bytes();
        out.extend_from_slice(&header);
        out.extend_from_slice(&crc32(&header).to_le_bytes());

        out.extend_from_slice(&self.payload);
        let payload_crc = if self.payload.is_empty() { 0 } else { crc32(&self.payload) };
        out.extend_from_slice(&payload_crc.to_le_bytes());

        out.extend_from_slice(&FOOTER_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.frame_len() as i64).to_le_bytes());
        out
    }

    /// Parse and fully validate one frame from `buf`.
    ///
    /// `offset` is the absolute file position of the frame start, used only
    /// for error reporting.  Validation order: header CRC, magic, kind,
    /// encoding, length bounds, payload CRC, footer magic, total length.
    /// Any mismatch aborts the read; the caller MUST NOT use partial data.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Block> {
        let header = FrameHeader::parse(buf, offset)?;
        let total = header.frame_len();
        if buf.len() < total {
            return Err(Error::Truncated {
                offset,
                declared: total as u64,
                available: buf.len() as u64,
            });
        }

        let payload_start = HEADER_WITH_CRC;
        let payload_end = payload_start + header.payload_length as usize;
        let payload = &buf[payload_start..payload_end];

        let stored_payload_crc =
            u32::from_le_bytes(buf[payload_end..payload_end + 4].try_into().unwrap());
        let expected_payload_crc = if payload.is_empty() { 0 } else { crc32(payload) };
        if stored_payload_crc != expected_payload_crc {
            return Err(Error::ChecksumMismatch {
                block_id: header.block_id,
                region: "payload",
                expected: expected_payload_crc,
                found: stored_payload_crc,
            });
        }

        let footer_magic =
            u64::from_le_bytes(buf[payload_end + 4..payload_end + 12].try_into().unwrap());
        if footer_magic != FOOTER_MAGIC {
            return Err(Error::FooterMismatch {
                block_id: header.block_id,
                detail: format!("footer magic {footer_magic:#018x}"),
            });
        }
        let total_length =
            i64::from_le_bytes(buf[payload_end + 12..payload_end + 20].try_into().unwrap());
        if total_length != total as i64 {
            return Err(Error::FooterMismatch {
                block_id: header.block_id,
                detail: format!("total_length {total_length}, frame is {total}"),
            });
        }

        Ok(Block {
            version: header.version,
            kind: header.kind,
            flags: header.flags,
            payload_encoding: header.payload_encoding,
            timestamp: header.timestamp,
            block_id: header.block_id,
            payload: payload.to_vec(),
        })
    }
}

// ── Frame header ─────────────────────────────────────────────────────────────

/// The parsed fixed header of a frame, validated through its CRC.  Used by
/// the scanner to size payload reads before committing to them.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u16,
    pub kind: BlockKind,
    pub flags: u8,
    pub payload_encoding: PayloadEncoding,
    pub timestamp: i64,
    pub block_id: i64,
    pub payload_length: i64,
}

impl FrameHeader {
    /// Total frame length implied by this header.
    #[inline]
    pub fn frame_len(&self) -> usize {
        FIXED_OVERHEAD + self.payload_length as usize
    }

    /// Parse and validate the 41 header bytes at the start of `buf`.
    ///
    /// Returns `Err` on any mismatch — magic, CRC32, unknown kind or
    /// encoding, or a negative length.  The caller MUST NOT attempt payload
    /// reads if this returns an error.
    pub fn parse(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < HEADER_WITH_CRC {
            return Err(Error::Truncated {
                offset,
                declared: HEADER_WITH_CRC as u64,
                available: buf.len() as u64,
            });
        }

        // 1. Magic first — the scanner probes arbitrary offsets.
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(Error::MagicMismatch { offset, found: magic });
        }

        // 2. Header CRC32 — cheapest full-header validity check.
        let stored_crc = u32::from_le_bytes(buf[HEADER_SIZE..HEADER_WITH_CRC].try_into().unwrap());
        let expected_crc = crc32(&buf[..HEADER_SIZE]);
        if stored_crc != expected_crc {
            // block_id is untrusted here; report the raw field for diagnostics.
            let raw_id = i64::from_le_bytes(buf[21..29].try_into().unwrap());
            return Err(Error::ChecksumMismatch {
                block_id: raw_id,
                region: "header",
                expected: expected_crc,
                found: stored_crc,
            });
        }

        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let kind = BlockKind::from_u8(buf[10]).ok_or(Error::UnknownKind { offset, kind: buf[10] })?;
        let flags = buf[11];
        let block_id = i64::from_le_bytes(buf[21..29].try_into().unwrap());
        let payload_encoding = PayloadEncoding::from_u8(buf[12]).ok_or_else(|| {
            Error::FooterMismatch {
                block_id,
                detail: format!("unknown payload encoding {}", buf[12]),
            }
        })?;
        let timestamp = i64::from_le_bytes(buf[13..21].try_into().unwrap());
        let payload_length = i64::from_le_bytes(buf[29..37].try_into().unwrap());
        if payload_length < 0 {
            return Err(Error::FooterMismatch {
                block_id,
                detail: format!("negative payload_length {payload_length}"),
            });
        }

        Ok(Self {
            version,
            kind,
            flags,
            payload_encoding,
            timestamp,
            block_id,
            payload_length,
        })
    }
}

// ── CRC helper ───────────────────────────────────────────────────────────────

#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_magic_is_complement() {
        assert_eq!(FOOTER_MAGIC, 0xFF11_BEE2_442E_EB11);
    }

    #[test]
    fn frame_round_trip() {
        let b = Block::new(
            BlockKind::EmailBatch,
            42,
            PayloadEncoding::Raw,
            b"payload bytes".to_vec(),
        );
        let frame = b.encode();
        assert_eq!(frame.len(), FIXED_OVERHEAD + 13);
        let back = Block::decode(&frame, 0).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn empty_payload_has_zero_crc() {
        let b = Block::new(BlockKind::Metadata, 1, PayloadEncoding::Json, Vec::new());
        let frame = b.encode();
        let crc =
            u32::from_le_bytes(frame[HEADER_WITH_CRC..HEADER_WITH_CRC + 4].try_into().unwrap());
        assert_eq!(crc, 0);
        assert_eq!(Block::decode(&frame, 0).unwrap(), b);
    }

    #[test]
    fn payload_flip_is_detected() {
        let b = Block::new(BlockKind::EmailBatch, 7, PayloadEncoding::Raw, vec![9u8; 64]);
        let mut frame = b.encode();
        frame[HEADER_WITH_CRC + 10] ^= 0x01;
        let err = Block::decode(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { region: "payload", .. }));
    }

    #[test]
    fn kind_zero_is_rejected() {
        let b = Block::new(BlockKind::Metadata, 1, PayloadEncoding::Json, Vec::new());
        let mut frame = b.encode();
        frame[10] = 0; // v1 enum base — must not be remapped
        let crc = crc32(&frame[..HEADER_SIZE]);
        frame[HEADER_SIZE..HEADER_WITH_CRC].copy_from_slice(&crc.to_le_bytes());
        let err = Block::decode(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::UnknownKind { kind: 0, .. }));
    }
}
