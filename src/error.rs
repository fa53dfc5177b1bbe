//! Crate-wide error type and taxonomy.
//!
//! Every fallible public operation returns [`Error`].  Variants carry the
//! offending identifier (block id, message-id, offset) so callers can report
//! precisely.  [`Error::class`] collapses the variants into the coarse
//! taxonomy used for policy decisions and CLI exit codes:
//!
//! | Class | Meaning |
//! |-------|---------|
//! | `Io` | underlying filesystem failure |
//! | `Framing` | magic mismatch, truncation, unknown kind |
//! | `Integrity` | checksum, auth tag, or hash-chain disagreement |
//! | `Policy` | duplicate identifiers, revoked keys |
//! | `Version` | unsupported or downgraded format version |
//! | `State` | locked vault, disposed handle, missing mapping |
//! | `Cancelled` | caller-requested cancellation honoured |
//! | `Internal` | invariant violation inside the engine |
//!
//! Integrity errors are always surfaced and never retried silently.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy.  See module docs for the class meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Io,
    Framing,
    Integrity,
    Policy,
    Version,
    State,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    // ── Io ──────────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ── Framing ─────────────────────────────────────────────────────────────
    #[error("Invalid block magic at offset {offset}: got {found:#018x}")]
    MagicMismatch { offset: u64, found: u64 },
    #[error("Truncated block at offset {offset}: {declared} bytes declared, {available} available")]
    Truncated {
        offset: u64,
        declared: u64,
        available: u64,
    },
    #[error("Unknown block kind {kind} at offset {offset}")]
    UnknownKind { offset: u64, kind: u8 },
    #[error("Footer mismatch for block {block_id}: {detail}")]
    FooterMismatch { block_id: i64, detail: String },

    // ── Integrity ───────────────────────────────────────────────────────────
    #[error("{region} CRC32 mismatch for block {block_id}: expected {expected:#010x}, got {found:#010x}")]
    ChecksumMismatch {
        block_id: i64,
        region: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("Hash chain invalid at block {block_id}: {reason}")]
    ChainInvalid { block_id: i64, reason: String },

    // ── Policy ──────────────────────────────────────────────────────────────
    #[error("Duplicate message-id {0:?}")]
    DuplicateMessageId(String),
    #[error("Duplicate envelope hash {0}")]
    DuplicateEnvelope(String),
    #[error("Encryption key for block {0} has been revoked")]
    RevokedKey(i64),

    // ── Version ─────────────────────────────────────────────────────────────
    #[error("Unsupported format version {found}: {detail}")]
    UnsupportedVersion { found: String, detail: String },
    #[error("Downgrade from {from} to {to} is not supported")]
    Downgrade { from: String, to: String },

    // ── State ───────────────────────────────────────────────────────────────
    #[error("Key manager is locked")]
    VaultLocked,
    #[error("Engine handle is disposed")]
    Disposed,
    #[error("Block {0} not found")]
    NotFound(i64),
    #[error("Email ({0}, {1}) not found")]
    EmailNotFound(i64, i32),

    // ── Cancelled ───────────────────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    // ── Wrapped module errors ───────────────────────────────────────────────
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Index store error: {0}")]
    Index(#[from] sled::Error),

    // ── Internal ────────────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            Io(_) => ErrorClass::Io,
            MagicMismatch { .. } | Truncated { .. } | UnknownKind { .. } | FooterMismatch { .. } => {
                ErrorClass::Framing
            }
            ChecksumMismatch { .. } | ChainInvalid { .. } => ErrorClass::Integrity,
            DuplicateMessageId(_) | DuplicateEnvelope(_) | RevokedKey(_) => ErrorClass::Policy,
            UnsupportedVersion { .. } | Downgrade { .. } => ErrorClass::Version,
            VaultLocked | Disposed | NotFound(_) | EmailNotFound(_, _) => ErrorClass::State,
            Cancelled => ErrorClass::Cancelled,
            Codec(e) => match e {
                CodecError::AuthenticationFailed { .. }
                | CodecError::NonceMismatch { .. }
                | CodecError::Decompression(_)
                | CodecError::ExtendedHeader(_) => ErrorClass::Integrity,
                CodecError::AlgorithmUnsupported { .. } | CodecError::EncodingUnsupported { .. } => {
                    ErrorClass::Version
                }
                CodecError::EncodingMismatch { .. } => ErrorClass::Framing,
                CodecError::MissingKey { .. } => ErrorClass::State,
                _ => ErrorClass::Internal,
            },
            Crypto(e) => match e {
                CryptoError::AuthenticationFailed | CryptoError::TooShort => ErrorClass::Integrity,
                CryptoError::MissingKey => ErrorClass::State,
                _ => ErrorClass::Internal,
            },
            Index(_) => ErrorClass::Io,
            Internal(_) => ErrorClass::Internal,
        }
    }

    /// True for errors that indicate on-disk corruption (CLI exit code 3).
    pub fn is_corruption(&self) -> bool {
        matches!(self.class(), ErrorClass::Framing | ErrorClass::Integrity)
    }
}
