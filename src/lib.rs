//! # emaildb — append-only block-structured email archival engine
//!
//! Format guarantees (frozen in major version 2):
//! - All numeric fields are little-endian; never negotiated
//! - Every block is self-describing: magic, version, kind, flags, id, length
//! - Header and payload each carry a mandatory CRC32; corrupt frames abort
//!   reads, and the footer magic is the bitwise complement of the header's
//! - Sealed blocks are immutable; supersession appends, compaction copies
//! - Compound email ids `(block_id, local_id)` are stable for the life of
//!   the database; re-filing an email touches only indexes and envelopes
//! - Algorithm identities (compression, encryption, payload encoding) are
//!   frozen one-byte ids; a reader missing one fails hard — no fallback
//! - The full block list is reconstructible by scanning forward for the
//!   header magic; the hash chain makes silent tampering evident

pub mod alloc;
pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod content;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod index;
pub mod keys;
pub mod migrate;
pub mod search;
pub mod store;
pub mod version;

// Flat re-exports for the most common types.
pub use alloc::BlockIdAllocator;
pub use block::{Block, BlockKind, PayloadEncoding, FIXED_OVERHEAD, HEADER_MAGIC};
pub use chain::{verify_proof, ChainEntry, ChainVerdict, ExistenceProof, HashChain};
pub use codec::{CodecError, CompressionAlgorithm};
pub use config::EmailDbConfig;
pub use content::{CompoundId, Envelope, HeaderContent};
pub use crypto::{CryptoError, EncryptionAlgorithm};
pub use db::EmailDb;
pub use engine::{BlockEngine, BlockHealth, BlockLocation, ScanQuality, ScanReport};
pub use error::{Error, ErrorClass, Result};
pub use index::IndexSet;
pub use keys::KeyManager;
pub use migrate::{migrate, MigrationOutcome};
pub use search::{SearchEngine, SearchQuery, SearchResult};
pub use store::{AppendOutcome, EmailStore};
pub use version::{capability, FormatVersion, UpgradePlan};
