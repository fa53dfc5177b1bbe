//! Hybrid email store — packs many emails into size-bounded batch blocks.
//!
//! # Packing
//! Appends accumulate in a single open batch guarded by a mutex, which keeps
//! local-id assignment deterministic: the compound id `(block_id, local_id)`
//! is issued at insertion and never changes.  When an append would push the
//! batch payload past the configured threshold the batch is *sealed* — codec
//! encode, raw append, hash-chain extend, envelope blocks written, indexes
//! updated — and a fresh batch opens.  `flush` force-seals; `seal_if_idle`
//! bounds the crash data-loss window for slow writers.
//!
//! # Folders
//! Every change to a folder's envelope set writes a new folder-envelope
//! block that back-references the previous version; the folder index points
//! at the newest block, and superseded bytes remain on disk for proofs.
//! Moving an email touches only envelope blocks and indexes — the batch
//! bytes are immutable.
//!
//! # Dedup
//! An append whose envelope hash is already known (sealed or pending)
//! returns the existing compound id flagged as a duplicate.  A reused
//! message-id with a different envelope is a policy error.

pub mod batch;
pub mod envelope;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alloc::BlockIdAllocator;
use crate::block::{Block, BlockKind, PayloadEncoding};
use crate::chain::{self, HashChain};
use crate::codec::{self, serializer_for, ExtendedHeader};
use crate::config::EmailDbConfig;
use crate::content::{BlockContent, CompoundId, Envelope, EnvelopeEntry, FolderEnvelopeContent};
use crate::crypto::EncryptionAlgorithm;
use crate::engine::BlockEngine;
use crate::error::{Error, Result};
use crate::index::IndexSet;
use crate::keys::KeyManager;

use batch::{BatchEntry, BATCH_PREFIX_LEN, ENTRY_HEADER_LEN};

/// Result of an append: the issued (or pre-existing) compound id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub compound_id: CompoundId,
    pub was_duplicate: bool,
}

#[derive(Debug)]
struct PendingEmail {
    envelope: Envelope,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct OpenBatch {
    block_id: i64,
    pending: Vec<PendingEmail>,
    payload_size: usize,
    last_append: i64,
}

impl OpenBatch {
    fn fresh(alloc: &BlockIdAllocator) -> Self {
        Self {
            block_id: alloc.next(BlockKind::EmailBatch),
            pending: Vec::new(),
            payload_size: BATCH_PREFIX_LEN,
            last_append: 0,
        }
    }
}

#[derive(Debug)]
pub struct EmailStore {
    engine: Arc<BlockEngine>,
    indexes: Arc<IndexSet>,
    chain: Arc<HashChain>,
    alloc: Arc<BlockIdAllocator>,
    keys: Arc<KeyManager>,
    config: EmailDbConfig,
    current: Mutex<OpenBatch>,
}

impl EmailStore {
    pub fn new(
        engine: Arc<BlockEngine>,
        indexes: Arc<IndexSet>,
        chain: Arc<HashChain>,
        alloc: Arc<BlockIdAllocator>,
        keys: Arc<KeyManager>,
        config: EmailDbConfig,
    ) -> Self {
        let current = Mutex::new(OpenBatch::fresh(&alloc));
        Self {
            engine,
            indexes,
            chain,
            alloc,
            keys,
            config,
            current,
        }
    }

    // ── Append ───────────────────────────────────────────────────────────────

    /// Pack one email into the open batch, sealing first when it would
    /// overflow.  Duplicate envelopes return the existing compound id.
    pub async fn append_email(
        &self,
        bytes: Vec<u8>,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        let env = envelope::seal_envelope(envelope, &bytes);

        // Dedup against sealed data first.
        if let Some(existing) = self.indexes.by_envelope_hash(&env.envelope_hash).await? {
            debug!(%existing, "append deduplicated by envelope hash");
            return Ok(AppendOutcome { compound_id: existing, was_duplicate: true });
        }
        if !env.message_id.is_empty()
            && self.indexes.by_message_id(&env.message_id).await?.is_some()
        {
            return Err(Error::DuplicateMessageId(env.message_id));
        }

        let mut cur = self.current.lock().await;

        // Dedup against the open batch.
        for (i, p) in cur.pending.iter().enumerate() {
            if p.envelope.envelope_hash == env.envelope_hash {
                return Ok(AppendOutcome {
                    compound_id: CompoundId::new(cur.block_id, i as i32),
                    was_duplicate: true,
                });
            }
            if !env.message_id.is_empty() && p.envelope.message_id == env.message_id {
                return Err(Error::DuplicateMessageId(env.message_id));
            }
        }

        let entry_size = ENTRY_HEADER_LEN + bytes.len();
        if !cur.pending.is_empty() && cur.payload_size + entry_size > self.config.block_size_bytes
        {
            self.seal_locked(&mut cur, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let local_id = cur.pending.len() as i32;
        let compound_id = CompoundId::new(cur.block_id, local_id);
        cur.pending.push(PendingEmail { envelope: env, bytes });
        cur.payload_size += entry_size;
        cur.last_append = chrono::Utc::now().timestamp();

        if cancel.is_cancelled() {
            // Roll the just-added entry back; nothing has been published.
            cur.pending.pop();
            cur.payload_size -= entry_size;
            return Err(Error::Cancelled);
        }

        Ok(AppendOutcome { compound_id, was_duplicate: false })
    }

    /// Seal the open batch regardless of size.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        let mut cur = self.current.lock().await;
        self.seal_locked(&mut cur, cancel).await
    }

    /// Seal the open batch when nothing has been appended for
    /// `max_idle_secs`.  Returns whether a seal happened.
    pub async fn seal_if_idle(&self, max_idle_secs: i64) -> Result<bool> {
        let mut cur = self.current.lock().await;
        if cur.pending.is_empty()
            || chrono::Utc::now().timestamp() - cur.last_append < max_idle_secs
        {
            return Ok(false);
        }
        self.seal_locked(&mut cur, &CancellationToken::new()).await?;
        Ok(true)
    }

    pub async fn pending_count(&self) -> usize {
        self.current.lock().await.pending.len()
    }

    async fn seal_locked(&self, cur: &mut OpenBatch, cancel: &CancellationToken) -> Result<()> {
        if cur.pending.is_empty() {
            return Ok(());
        }

        let emails: Vec<(u32, Vec<u8>)> = cur
            .pending
            .iter()
            .map(|p| (p.envelope.flags, p.bytes.clone()))
            .collect();
        let payload = batch::encode_batch(&emails);
        let hashes = batch::entry_hashes(cur.pending.iter().map(|p| p.bytes.as_slice()));

        // Encryption key first: the vault block must be durable before any
        // payload depends on it.
        let key = if self.config.encryption != EncryptionAlgorithm::None {
            let material = self.keys.generate_key(cur.block_id, self.config.encryption)?;
            self.persist_vault(cancel).await?;
            Some(material)
        } else {
            None
        };

        let encoded = codec::encode_payload(
            &payload,
            cur.block_id,
            self.config.compression,
            self.config.compression_level,
            self.config.encryption,
            key.as_deref().map(|k| k.as_slice()),
            cur.block_id,
        )?;

        let mut block = Block::new(
            BlockKind::EmailBatch,
            cur.block_id,
            PayloadEncoding::Raw,
            encoded.bytes,
        );
        block.flags = encoded.flags;
        self.engine.append(&block, cancel).await?;

        let block_hash = chain::block_hash(&block.header_bytes(), &hashes);
        self.chain.extend(cur.block_id, block_hash).await?;

        // Envelope blocks + index updates, grouped per folder.
        let mut by_folder: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, p) in cur.pending.iter().enumerate() {
            by_folder.entry(p.envelope.folder_path.clone()).or_default().push(i);
        }
        for (folder, members) in by_folder {
            let entries: Vec<EnvelopeEntry> = members
                .iter()
                .map(|&i| EnvelopeEntry {
                    block_id: cur.block_id,
                    local_id: i as i32,
                    envelope: Some(cur.pending[i].envelope.clone()),
                })
                .collect();
            let envelope_block_id = self
                .write_folder_version(&folder, entries, None, cancel)
                .await?;
            for &i in &members {
                let p = &cur.pending[i];
                let cid = CompoundId::new(cur.block_id, i as i32);
                let body = String::from_utf8_lossy(&p.bytes);
                self.indexes
                    .insert_email(&p.envelope, cid, envelope_block_id, &body)
                    .await?;
            }
        }

        info!(
            block_id = cur.block_id,
            emails = cur.pending.len(),
            payload = cur.payload_size,
            "sealed email batch"
        );

        cur.pending.clear();
        cur.payload_size = BATCH_PREFIX_LEN;
        cur.block_id = self.alloc.next(BlockKind::EmailBatch);
        cur.last_append = 0;
        Ok(())
    }

    /// Persist the key vault as a fresh key-manager block (newest id wins).
    async fn persist_vault(&self, cancel: &CancellationToken) -> Result<()> {
        let content = BlockContent::KeyManager(self.keys.to_content()?);
        let bytes = serializer_for(PayloadEncoding::Json).to_bytes(&content)?;
        let block = Block::new(
            BlockKind::KeyManager,
            self.alloc.next(BlockKind::KeyManager),
            PayloadEncoding::Json,
            bytes,
        );
        self.engine.append(&block, cancel).await?;
        Ok(())
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Exact bytes appended under `cid` — from the open batch when unsealed.
    pub async fn read_email(&self, cid: CompoundId) -> Result<Vec<u8>> {
        {
            let cur = self.current.lock().await;
            if cid.block_id == cur.block_id {
                return cur
                    .pending
                    .get(cid.local_id as usize)
                    .map(|p| p.bytes.clone())
                    .ok_or(Error::EmailNotFound(cid.block_id, cid.local_id));
            }
        }
        let (_, entries) = self.read_batch(cid.block_id).await?;
        entries
            .into_iter()
            .find(|e| e.local_id == cid.local_id)
            .map(|e| e.bytes)
            .ok_or(Error::EmailNotFound(cid.block_id, cid.local_id))
    }

    /// Read and fully decode one sealed batch block.
    pub async fn read_batch(&self, block_id: i64) -> Result<(Block, Vec<BatchEntry>)> {
        let block = self.engine.read(block_id).await?;
        if block.kind != BlockKind::EmailBatch {
            return Err(Error::NotFound(block_id));
        }
        let key = if block.is_encrypted() {
            let (ext, _) = ExtendedHeader::parse(&block.payload)?;
            Some(self.keys.get_key(ext.key_id)?)
        } else {
            None
        };
        let plain = codec::decode_payload(
            &block.payload,
            block.flags,
            block.block_id,
            key.as_deref().map(|k| k.as_slice()),
        )?;
        let entries = batch::decode_batch(&plain)?;
        Ok((block, entries))
    }

    // ── Folders ──────────────────────────────────────────────────────────────

    /// Envelopes of `folder_path`, from the newest envelope block.
    pub async fn list_folder(&self, folder_path: &str) -> Result<Vec<Envelope>> {
        match self.read_folder_content(folder_path).await? {
            Some((_, content)) => Ok(content
                .entries
                .into_iter()
                .filter_map(|e| e.envelope)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Compound ids currently filed under `folder_path`.
    pub async fn folder_members(&self, folder_path: &str) -> Result<Vec<CompoundId>> {
        match self.read_folder_content(folder_path).await? {
            Some((_, content)) => {
                Ok(content.entries.iter().map(|e| e.compound_id()).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Re-file an email.  Index-only: new envelope-block versions for the
    /// two folders; the batch bytes never move.  Idempotent.
    pub async fn move_email(
        &self,
        cid: CompoundId,
        new_folder: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // An unsealed email just changes its pending envelope.
        {
            let mut cur = self.current.lock().await;
            if cid.block_id == cur.block_id {
                let p = cur
                    .pending
                    .get_mut(cid.local_id as usize)
                    .ok_or(Error::EmailNotFound(cid.block_id, cid.local_id))?;
                p.envelope.folder_path = new_folder.to_string();
                return Ok(());
            }
        }

        let envelope_block = self
            .indexes
            .envelope_block_of(cid)
            .await?
            .ok_or(Error::EmailNotFound(cid.block_id, cid.local_id))?;
        let content = self.read_envelope_block(envelope_block).await?;
        let entry = content
            .entries
            .iter()
            .find(|e| e.compound_id() == cid)
            .ok_or(Error::EmailNotFound(cid.block_id, cid.local_id))?;
        let mut env = entry
            .envelope
            .clone()
            .ok_or_else(|| Error::Internal(format!("envelope entry {cid} has no envelope")))?;

        if env.folder_path == new_folder {
            return Ok(());
        }
        let old_folder = std::mem::replace(&mut env.folder_path, new_folder.to_string());

        // New folder first, then the removal: a crash between the two leaves
        // the email visible in both listings, never in neither.
        self.write_folder_version(
            new_folder,
            vec![EnvelopeEntry {
                block_id: cid.block_id,
                local_id: cid.local_id,
                envelope: Some(env),
            }],
            None,
            cancel,
        )
        .await?;
        self.write_folder_version(&old_folder, Vec::new(), Some(cid), cancel)
            .await?;
        debug!(%cid, from = %old_folder, to = %new_folder, "moved email");
        Ok(())
    }

    /// Write the next envelope-block version for `folder_path`: current
    /// entries minus `remove`, plus `add`.  Returns the new block id.
    async fn write_folder_version(
        &self,
        folder_path: &str,
        add: Vec<EnvelopeEntry>,
        remove: Option<CompoundId>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let current = self.read_folder_content(folder_path).await?;
        let (previous_block_id, version, mut entries) = match current {
            Some((id, c)) => (id, c.version + 1, c.entries),
            None => (0, 1, Vec::new()),
        };
        if let Some(cid) = remove {
            entries.retain(|e| e.compound_id() != cid);
        }
        entries.extend(add);

        let new_id = self.alloc.next(BlockKind::FolderEnvelope);
        let content = FolderEnvelopeContent {
            folder_path: folder_path.to_string(),
            version,
            previous_block_id,
            entries,
        };
        let members: Vec<CompoundId> = content.entries.iter().map(|e| e.compound_id()).collect();

        let plain = serializer_for(PayloadEncoding::Json)
            .to_bytes(&BlockContent::FolderEnvelope(content))?;
        let encoded = codec::encode_payload(
            &plain,
            new_id,
            self.config.compression,
            self.config.compression_level,
            EncryptionAlgorithm::None,
            None,
            0,
        )?;
        let mut block = Block::new(BlockKind::FolderEnvelope, new_id, PayloadEncoding::Json, encoded.bytes);
        block.flags = encoded.flags;
        self.engine.append(&block, cancel).await?;

        self.indexes
            .record_folder_version(folder_path, new_id, &members)
            .await?;
        Ok(new_id)
    }

    async fn read_folder_content(
        &self,
        folder_path: &str,
    ) -> Result<Option<(i64, FolderEnvelopeContent)>> {
        match self.indexes.folder_block(folder_path).await? {
            Some(id) => Ok(Some((id, self.read_envelope_block(id).await?))),
            None => Ok(None),
        }
    }

    /// Read and decode one folder-envelope block.
    pub async fn read_envelope_block(&self, block_id: i64) -> Result<FolderEnvelopeContent> {
        let block = self.engine.read(block_id).await?;
        if block.kind != BlockKind::FolderEnvelope {
            return Err(Error::NotFound(block_id));
        }
        let plain = codec::decode_payload(&block.payload, block.flags, block.block_id, None)?;
        let content = serializer_for(block.payload_encoding).from_bytes(&plain)?;
        Ok(content.into_folder_envelope()?)
    }

    // ── Reconcile ────────────────────────────────────────────────────────────

    /// Rebuild missing index entries from batch + envelope blocks.
    ///
    /// Walks every folder-envelope block, keeps the newest version per
    /// folder, and re-runs the insertion sequence for each listed email.
    /// Idempotent; safe after a crash between sealing and indexing.
    pub async fn reconcile(&self) -> Result<u64> {
        let locations = self.engine.locations();
        let mut latest: HashMap<String, (u64, i64, FolderEnvelopeContent)> = HashMap::new();

        for (&block_id, _) in locations.iter() {
            let block = match self.engine.read(block_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(block_id, error = %e, "reconcile skipping unreadable block");
                    continue;
                }
            };
            if block.kind != BlockKind::FolderEnvelope {
                continue;
            }
            let plain = codec::decode_payload(&block.payload, block.flags, block.block_id, None)?;
            let content = serializer_for(block.payload_encoding)
                .from_bytes(&plain)?
                .into_folder_envelope()?;
            let newer = match latest.get(&content.folder_path) {
                Some((v, id, _)) => {
                    content.version > *v || (content.version == *v && block_id > *id)
                }
                None => true,
            };
            if newer {
                latest.insert(content.folder_path.clone(), (content.version, block_id, content));
            }
        }

        let mut restored = 0u64;
        for (folder, (_, block_id, content)) in latest {
            let members: Vec<CompoundId> =
                content.entries.iter().map(|e| e.compound_id()).collect();
            self.indexes
                .record_folder_version(&folder, block_id, &members)
                .await?;
            for entry in &content.entries {
                let env = match &entry.envelope {
                    Some(e) => e,
                    None => continue,
                };
                let cid = entry.compound_id();
                let body = match self.read_email(cid).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        warn!(%cid, error = %e, "reconcile skipping unreadable email");
                        continue;
                    }
                };
                self.indexes.insert_email(env, cid, block_id, &body).await?;
                restored += 1;
            }
        }
        info!(restored, "index reconcile complete");
        Ok(restored)
    }
}
