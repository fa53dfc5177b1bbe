//! Secondary index set — six logical indexes over the ordered-KV sidecar.
//!
//! The sidecar is a `sled` database in `<file>.idx/`, one named tree per
//! logical index, treated as opaque by the storage core; only upsert /
//! try-get / range-scan / count are used.
//!
//! | Tree | Key | Value |
//! |------|-----|-------|
//! | `message_id` | message-id bytes | 12-byte compound id |
//! | `envelope_hash` | 32-byte SHA-256 | compound id |
//! | `content_hash` | 32-byte SHA-256 | compound id |
//! | `folder` | folder path bytes | 8-byte LE envelope-block id |
//! | `envelope_location` | compound id | 8-byte LE envelope-block id |
//! | `fulltext` | lowercased term | sorted `(compound id, occurrence count)` records |
//! | `index_metadata` | index name | JSON [`IndexMetadata`] |
//!
//! Compound-id keys are big-endian so range scans iterate in `(block, slot)`
//! order; folder keys are raw paths so a prefix scan enumerates a subtree.
//!
//! Updates are applied in a fixed sequence per insertion (message-id,
//! envelope-hash, content-hash, folder, envelope-location, full-text) and
//! every update is an idempotent upsert, so the crash-recovery reconcile
//! pass simply re-runs insertions.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::content::{CompoundId, Envelope};
use crate::error::{Error, Result};

pub const MESSAGE_ID: &str = "message_id";
pub const ENVELOPE_HASH: &str = "envelope_hash";
pub const CONTENT_HASH: &str = "content_hash";
pub const FOLDER: &str = "folder";
pub const ENVELOPE_LOCATION: &str = "envelope_location";
pub const FULLTEXT: &str = "fulltext";

const ALL_INDEXES: &[&str] = &[
    MESSAGE_ID,
    ENVELOPE_HASH,
    CONTENT_HASH,
    FOLDER,
    ENVELOPE_LOCATION,
    FULLTEXT,
];

const INDEX_VERSION: i32 = 1;

/// Per-index bookkeeping stored under `index_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub last_updated: i64,
    pub count: u64,
    pub index_version: i32,
}

#[derive(Debug)]
pub struct IndexSet {
    db: sled::Db,
    message_id: sled::Tree,
    envelope_hash: sled::Tree,
    content_hash: sled::Tree,
    folder: sled::Tree,
    envelope_location: sled::Tree,
    fulltext: sled::Tree,
    meta: sled::Tree,
    stopwords: HashSet<String>,
    min_token_len: usize,
}

impl IndexSet {
    pub fn open(
        dir: impl AsRef<Path>,
        stopwords: HashSet<String>,
        min_token_len: usize,
    ) -> Result<Self> {
        let db = sled::open(dir)?;
        Ok(Self {
            message_id: db.open_tree(MESSAGE_ID)?,
            envelope_hash: db.open_tree(ENVELOPE_HASH)?,
            content_hash: db.open_tree(CONTENT_HASH)?,
            folder: db.open_tree(FOLDER)?,
            envelope_location: db.open_tree(ENVELOPE_LOCATION)?,
            fulltext: db.open_tree(FULLTEXT)?,
            meta: db.open_tree("index_metadata")?,
            db,
            stopwords,
            min_token_len,
        })
    }

    // ── Insertion ────────────────────────────────────────────────────────────

    /// Apply all per-email index updates in the fixed sequence.
    ///
    /// Idempotent: re-running the same insertion after a crash converges.
    /// A present message-id mapped to a *different* compound id is a policy
    /// error carrying the conflicting identifier.
    pub async fn insert_email(
        &self,
        envelope: &Envelope,
        cid: CompoundId,
        envelope_block_id: i64,
        body_text: &str,
    ) -> Result<()> {
        // 1. message_id — uniqueness enforced when present.
        if !envelope.message_id.is_empty() {
            let key = envelope.message_id.as_bytes();
            match self.message_id.get(key)? {
                Some(existing) if existing.as_ref() != cid.to_key().as_slice() => {
                    return Err(Error::DuplicateMessageId(envelope.message_id.clone()));
                }
                _ => {
                    self.message_id.insert(key, cid.to_key().to_vec())?;
                }
            }
        }

        // 2. envelope_hash.
        self.envelope_hash
            .insert(envelope.envelope_hash.as_slice(), cid.to_key().to_vec())?;

        // 3. content_hash — collisions across envelopes are permitted; the
        //    first instance of the bytes stays authoritative.
        if self.content_hash.get(envelope.content_hash.as_slice())?.is_none() {
            self.content_hash
                .insert(envelope.content_hash.as_slice(), cid.to_key().to_vec())?;
        }

        // 4. folder.
        self.folder
            .insert(envelope.folder_path.as_bytes(), envelope_block_id.to_le_bytes().to_vec())?;

        // 5. envelope_location.
        self.envelope_location
            .insert(&cid.to_key(), envelope_block_id.to_le_bytes().to_vec())?;

        // 6. fulltext.
        let mut text = String::with_capacity(
            envelope.subject.len() + body_text.len() + envelope.from.len() + 64,
        );
        text.push_str(&envelope.subject);
        text.push(' ');
        text.push_str(body_text);
        text.push(' ');
        text.push_str(&envelope.from);
        for addr in envelope.to.iter().chain(envelope.cc.iter()) {
            text.push(' ');
            text.push_str(addr);
        }
        for (term, count) in self.term_counts(&text) {
            self.add_posting(&term, cid, count)?;
        }

        self.touch_all()?;
        debug!(%cid, message_id = %envelope.message_id, "indexed email");
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub async fn by_message_id(&self, message_id: &str) -> Result<Option<CompoundId>> {
        Ok(self
            .message_id
            .get(message_id.as_bytes())?
            .and_then(|v| CompoundId::from_key(&v)))
    }

    pub async fn by_envelope_hash(&self, hash: &[u8]) -> Result<Option<CompoundId>> {
        Ok(self.envelope_hash.get(hash)?.and_then(|v| CompoundId::from_key(&v)))
    }

    pub async fn by_content_hash(&self, hash: &[u8]) -> Result<Option<CompoundId>> {
        Ok(self.content_hash.get(hash)?.and_then(|v| CompoundId::from_key(&v)))
    }

    /// Latest envelope-block id for a folder path.
    pub async fn folder_block(&self, folder_path: &str) -> Result<Option<i64>> {
        Ok(self.folder.get(folder_path.as_bytes())?.map(|v| decode_i64(&v)))
    }

    /// All folders under `prefix`, with their latest envelope-block ids.
    pub async fn folders_under(&self, prefix: &str) -> Result<Vec<(String, i64)>> {
        let mut out = Vec::new();
        for item in self.folder.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item?;
            out.push((String::from_utf8_lossy(&k).into_owned(), decode_i64(&v)));
        }
        Ok(out)
    }

    /// Envelope-block id containing `cid`'s envelope.
    pub async fn envelope_block_of(&self, cid: CompoundId) -> Result<Option<i64>> {
        Ok(self.envelope_location.get(cid.to_key())?.map(|v| decode_i64(&v)))
    }

    /// Posting set for one term (already lowercased by the caller or not —
    /// the tokenizer normalizes either way).
    pub async fn terms_containing(&self, term: &str) -> Result<Vec<CompoundId>> {
        Ok(self
            .postings(term)
            .await?
            .into_iter()
            .map(|(cid, _)| cid)
            .collect())
    }

    /// Posting set with per-document occurrence counts, for ranking.
    pub async fn postings(&self, term: &str) -> Result<Vec<(CompoundId, u32)>> {
        let term = term.to_lowercase();
        Ok(self
            .fulltext
            .get(term.as_bytes())?
            .map(|v| decode_posting(&v))
            .unwrap_or_default())
    }

    /// Every indexed compound id, in `(block, slot)` order.  Backs field
    /// searches whose only predicate is not term-indexed (a bare date range).
    pub async fn all_email_ids(&self) -> Result<Vec<CompoundId>> {
        let mut out = Vec::new();
        for item in self.envelope_location.iter() {
            let (k, _) = item?;
            if let Some(cid) = CompoundId::from_key(&k) {
                out.push(cid);
            }
        }
        Ok(out)
    }

    // ── Folder maintenance ───────────────────────────────────────────────────

    /// Record a new envelope-block version for `folder_path` and repoint the
    /// envelope-location of every member at it.
    pub async fn record_folder_version(
        &self,
        folder_path: &str,
        envelope_block_id: i64,
        members: &[CompoundId],
    ) -> Result<()> {
        self.folder
            .insert(folder_path.as_bytes(), envelope_block_id.to_le_bytes().to_vec())?;
        for cid in members {
            self.envelope_location
                .insert(&cid.to_key(), envelope_block_id.to_le_bytes().to_vec())?;
        }
        self.touch(FOLDER)?;
        self.touch(ENVELOPE_LOCATION)?;
        Ok(())
    }

    // ── Tokenizer ────────────────────────────────────────────────────────────

    /// Lowercase, split on non-alphanumeric, drop short tokens and stopwords.
    pub fn tokenize(&self, text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= self.min_token_len)
            .filter(|t| !self.stopwords.contains(*t))
            .map(|t| t.to_string())
            .collect()
    }

    /// Admitted tokens with their occurrence counts — the per-document term
    /// frequencies fed into the posting lists.
    pub fn term_counts(&self, text: &str) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= self.min_token_len)
            .filter(|t| !self.stopwords.contains(*t))
        {
            *counts.entry(token.to_string()).or_insert(0u32) += 1;
        }
        counts
    }

    /// Merge one `(document, count)` pair into a term's posting map.
    /// Re-upserting the same pair is a no-op, so reconcile converges.
    fn add_posting(&self, term: &str, cid: CompoundId, count: u32) -> Result<()> {
        let key = term.as_bytes();
        let mut map: BTreeMap<CompoundId, u32> = self
            .fulltext
            .get(key)?
            .map(|v| decode_posting(&v).into_iter().collect())
            .unwrap_or_default();
        if map.insert(cid, count) != Some(count) {
            let mut value = Vec::with_capacity(map.len() * 16);
            for (c, n) in &map {
                value.extend_from_slice(&c.to_key());
                value.extend_from_slice(&n.to_le_bytes());
            }
            self.fulltext.insert(key, value)?;
        }
        Ok(())
    }

    // ── Metadata & maintenance ───────────────────────────────────────────────

    pub fn metadata(&self, name: &str) -> Result<IndexMetadata> {
        let stored: Option<IndexMetadata> = self
            .meta
            .get(name.as_bytes())?
            .and_then(|v| serde_json::from_slice(&v).ok());
        Ok(IndexMetadata {
            last_updated: stored.as_ref().map(|m| m.last_updated).unwrap_or(0),
            count: self.tree(name)?.len() as u64,
            index_version: stored.map(|m| m.index_version).unwrap_or(INDEX_VERSION),
        })
    }

    pub fn count(&self, name: &str) -> Result<u64> {
        Ok(self.tree(name)?.len() as u64)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn tree(&self, name: &str) -> Result<&sled::Tree> {
        match name {
            MESSAGE_ID => Ok(&self.message_id),
            ENVELOPE_HASH => Ok(&self.envelope_hash),
            CONTENT_HASH => Ok(&self.content_hash),
            FOLDER => Ok(&self.folder),
            ENVELOPE_LOCATION => Ok(&self.envelope_location),
            FULLTEXT => Ok(&self.fulltext),
            other => Err(Error::Internal(format!("unknown index {other}"))),
        }
    }

    fn touch(&self, name: &str) -> Result<()> {
        let m = IndexMetadata {
            last_updated: chrono::Utc::now().timestamp(),
            count: 0, // computed live by `metadata`
            index_version: INDEX_VERSION,
        };
        self.meta.insert(
            name.as_bytes(),
            serde_json::to_vec(&m).map_err(|e| Error::Internal(e.to_string()))?,
        )?;
        Ok(())
    }

    fn touch_all(&self) -> Result<()> {
        for name in ALL_INDEXES {
            self.touch(name)?;
        }
        Ok(())
    }
}

fn decode_i64(v: &[u8]) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&v[..8]);
    i64::from_le_bytes(b)
}

fn decode_posting(v: &[u8]) -> Vec<(CompoundId, u32)> {
    v.chunks_exact(16)
        .filter_map(|rec| {
            let cid = CompoundId::from_key(&rec[..12])?;
            let count = u32::from_le_bytes(rec[12..16].try_into().ok()?);
            Some((cid, count))
        })
        .collect()
}
