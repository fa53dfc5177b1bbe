//! Hash chain — tamper evidence over sealed email batches.
//!
//! Each sealed email-batch block appends one entry to a sidecar log
//! (`<file>.chain`).  The chain hash links every entry to all of its
//! predecessors:
//!
//! ```text
//! block_hash   = SHA256(header_bytes ‖ entries_root)
//! entries_root = SHA256(h_0 ‖ … ‖ h_{n-1}),  h_i = SHA256(email_i)
//! chain_hash   = SHA256(block_hash ‖ previous_chain_hash)
//! ```
//!
//! The first entry links to a fixed genesis hash.  Sequences are contiguous
//! from 0, so a removed or reordered entry is always detectable.
//!
//! # On-disk entry layout (120 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   block_id             (LE i64)
//!    8     32   block_hash
//!   40     32   previous_chain_hash
//!   72     32   chain_hash
//!  104      8   timestamp            (LE i64)
//!  112      8   sequence             (LE u64)
//! ```
//!
//! # Existence proofs
//! Because `entries_root` is a single-level hash list over the plaintext
//! emails, a proof for one email is: its hash, the full sibling hash list,
//! the 37 canonical header bytes of the containing block, and the chain
//! segment from that block to the latest entry.  [`verify_proof`] replays
//! every hash step and is a pure function.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::content::CompoundId;
use crate::crypto::sha256;
use crate::error::{Error, Result};

/// Fixed serialized entry size.
pub const CHAIN_ENTRY_LEN: usize = 120;

/// Chain hash linked by the first entry.  SHA-256 of a domain-separation
/// tag; frozen for format major version 2.
pub static GENESIS_HASH: LazyLock<[u8; 32]> =
    LazyLock::new(|| sha256(&[b"emaildb.chain.genesis.v2"]));

// ── Entry ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub block_id: i64,
    pub block_hash: [u8; 32],
    pub previous_chain_hash: [u8; 32],
    pub chain_hash: [u8; 32],
    pub timestamp: i64,
    pub sequence: u64,
}

impl ChainEntry {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.write_i64::<LittleEndian>(self.block_id).expect("vec write");
        out.extend_from_slice(&self.block_hash);
        out.extend_from_slice(&self.previous_chain_hash);
        out.extend_from_slice(&self.chain_hash);
        out.write_i64::<LittleEndian>(self.timestamp).expect("vec write");
        out.write_u64::<LittleEndian>(self.sequence).expect("vec write");
    }

    fn read_from(mut r: impl Read) -> std::io::Result<Self> {
        let block_id = r.read_i64::<LittleEndian>()?;
        let mut block_hash = [0u8; 32];
        r.read_exact(&mut block_hash)?;
        let mut previous_chain_hash = [0u8; 32];
        r.read_exact(&mut previous_chain_hash)?;
        let mut chain_hash = [0u8; 32];
        r.read_exact(&mut chain_hash)?;
        let timestamp = r.read_i64::<LittleEndian>()?;
        let sequence = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            block_id,
            block_hash,
            previous_chain_hash,
            chain_hash,
            timestamp,
            sequence,
        })
    }
}

// ── Hash helpers ─────────────────────────────────────────────────────────────

/// Root of the single-level hash list over a batch's plaintext emails.
pub fn entries_root(entry_hashes: &[[u8; 32]]) -> [u8; 32] {
    let parts: Vec<&[u8]> = entry_hashes.iter().map(|h| h.as_slice()).collect();
    sha256(&parts)
}

/// Chained digest of one sealed block.
pub fn block_hash(header_bytes: &[u8], entry_hashes: &[[u8; 32]]) -> [u8; 32] {
    let root = entries_root(entry_hashes);
    sha256(&[header_bytes, &root])
}

// ── Verdict ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Valid,
    InvalidAt { block_id: i64, reason: String },
}

impl ChainVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainVerdict::Valid)
    }
}

// ── HashChain ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ChainState {
    file: File,
    entries: Vec<ChainEntry>,
}

#[derive(Debug)]
pub struct HashChain {
    path: PathBuf,
    state: Mutex<ChainState>,
    fsync_on_append: bool,
}

impl HashChain {
    /// Open (or create) the sidecar log and load every entry.  A trailing
    /// partial entry — crash mid-append — is ignored; the next `extend`
    /// rewrites from the last complete entry boundary.
    pub fn open(path: impl AsRef<Path>, fsync_on_append: bool) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let complete = raw.len() - raw.len() % CHAIN_ENTRY_LEN;
        let mut entries = Vec::with_capacity(complete / CHAIN_ENTRY_LEN);
        let mut cursor = &raw[..complete];
        while !cursor.is_empty() {
            entries.push(ChainEntry::read_from(&mut cursor)?);
        }

        Ok(Self {
            path,
            state: Mutex::new(ChainState { file, entries }),
            fsync_on_append,
        })
    }

    /// Extend the chain with a sealed block's digest.
    pub async fn extend(&self, block_id: i64, block_hash: [u8; 32]) -> Result<ChainEntry> {
        let mut st = self.state.lock().await;

        let (previous_chain_hash, sequence) = match st.entries.last() {
            Some(last) => (last.chain_hash, last.sequence + 1),
            None => (*GENESIS_HASH, 0),
        };
        let entry = ChainEntry {
            block_id,
            block_hash,
            previous_chain_hash,
            chain_hash: sha256(&[&block_hash, &previous_chain_hash]),
            timestamp: chrono::Utc::now().timestamp(),
            sequence,
        };

        // Append at the last complete entry boundary.
        let offset = (st.entries.len() * CHAIN_ENTRY_LEN) as u64;
        let mut buf = Vec::with_capacity(CHAIN_ENTRY_LEN);
        entry.write_to(&mut buf);
        use std::os::unix::fs::FileExt;
        st.file.write_all_at(&buf, offset)?;
        if self.fsync_on_append {
            st.file.sync_data()?;
        }
        st.entries.push(entry);
        debug!(block_id, sequence, "hash chain extended");
        Ok(entry)
    }

    pub async fn latest(&self) -> Option<ChainEntry> {
        self.state.lock().await.entries.last().copied()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn entry_for(&self, block_id: i64) -> Option<ChainEntry> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .find(|e| e.block_id == block_id)
            .copied()
    }

    /// All entries from `block_id`'s entry through the latest, for proofs.
    pub async fn segment_from(&self, block_id: i64) -> Result<Vec<ChainEntry>> {
        let st = self.state.lock().await;
        let start = st
            .entries
            .iter()
            .position(|e| e.block_id == block_id)
            .ok_or(Error::NotFound(block_id))?;
        Ok(st.entries[start..].to_vec())
    }

    pub async fn entries(&self) -> Vec<ChainEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Verify the internal linkage of the chain: contiguous sequences,
    /// previous-hash links, and the chain-hash recurrence.  Block re-hashing
    /// against the store is layered on top by the caller, which owns the
    /// decode pipeline.
    pub async fn verify_links(&self) -> ChainVerdict {
        let st = self.state.lock().await;
        let mut previous = *GENESIS_HASH;
        for (i, e) in st.entries.iter().enumerate() {
            if e.sequence != i as u64 {
                return ChainVerdict::InvalidAt {
                    block_id: e.block_id,
                    reason: format!("sequence gap: expected {}, found {}", i, e.sequence),
                };
            }
            if e.previous_chain_hash != previous {
                return ChainVerdict::InvalidAt {
                    block_id: e.block_id,
                    reason: "previous chain hash mismatch".into(),
                };
            }
            let expected = sha256(&[&e.block_hash, &e.previous_chain_hash]);
            if e.chain_hash != expected {
                return ChainVerdict::InvalidAt {
                    block_id: e.block_id,
                    reason: "chain hash mismatch".into(),
                };
            }
            previous = e.chain_hash;
        }
        ChainVerdict::Valid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── Existence proofs ─────────────────────────────────────────────────────────

/// Proof that one email is covered by the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistenceProof {
    pub compound_id: CompoundId,
    /// SHA-256 of the email bytes.
    pub email_hash: [u8; 32],
    /// Hash of every entry in the containing batch, in local-id order — the
    /// single-level Merkle hash list.
    pub entry_hashes: Vec<[u8; 32]>,
    /// Canonical header bytes of the containing block.
    pub header_bytes: Vec<u8>,
    /// Digest of the containing block, as recorded in the chain.
    pub block_hash: [u8; 32],
    /// Chain entries from the containing block through the latest.
    pub chain_segment: Vec<ChainEntry>,
}

/// Replay every hash step of `proof` against `email_bytes`.  Pure.
pub fn verify_proof(proof: &ExistenceProof, email_bytes: &[u8]) -> bool {
    // 1. The email bytes hash to the claimed leaf.
    if sha256(&[email_bytes]) != proof.email_hash {
        return false;
    }
    // 2. The leaf occupies the claimed slot in the batch hash list.
    let slot = proof.compound_id.local_id;
    if slot < 0 || proof.entry_hashes.get(slot as usize) != Some(&proof.email_hash) {
        return false;
    }
    // 3. The hash list reproduces the block digest.
    if block_hash(&proof.header_bytes, &proof.entry_hashes) != proof.block_hash {
        return false;
    }
    // 4. The segment starts at the containing block with that digest.
    let first = match proof.chain_segment.first() {
        Some(f) => f,
        None => return false,
    };
    if first.block_id != proof.compound_id.block_id || first.block_hash != proof.block_hash {
        return false;
    }
    // 5. The segment itself is a valid chain fragment.
    let mut previous = first.previous_chain_hash;
    let mut sequence = first.sequence;
    for (i, e) in proof.chain_segment.iter().enumerate() {
        if i > 0 {
            if e.previous_chain_hash != previous {
                return false;
            }
            if e.sequence != sequence + 1 {
                return false;
            }
            sequence = e.sequence;
        }
        if e.chain_hash != sha256(&[&e.block_hash, &e.previous_chain_hash]) {
            return false;
        }
        previous = e.chain_hash;
    }
    true
}
