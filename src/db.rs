//! High-level [`EmailDb`] API — the primary embedding surface.
//!
//! ```no_run
//! use emaildb::{EmailDb, EmailDbConfig, Envelope};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> emaildb::Result<()> {
//! let cancel = CancellationToken::new();
//! let db = EmailDb::create("mail.edb", EmailDbConfig::default()).await?;
//! let envelope = Envelope {
//!     message_id: "m1@example.com".into(),
//!     from: "alice@example.com".into(),
//!     subject: "hello".into(),
//!     folder_path: "/inbox".into(),
//!     ..Default::default()
//! };
//! let outcome = db.append_email(b"raw email".to_vec(), envelope, &cancel).await?;
//! db.flush(&cancel).await?;
//! let bytes = db.read_email(outcome.compound_id).await?;
//! assert_eq!(bytes, b"raw email");
//! # Ok(())
//! # }
//! ```
//!
//! One `EmailDb` owns a block file plus two sidecars: the ordered-KV index
//! directory (`<file>.idx/`) and the hash-chain log (`<file>.chain`).  The
//! header snapshot held in memory is immutable; updates write a superseding
//! metadata block and swap the snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alloc::{BlockIdAllocator, HEADER_BLOCK_ID};
use crate::block::{Block, BlockKind, PayloadEncoding};
use crate::chain::{self, ChainVerdict, ExistenceProof, HashChain};
use crate::codec::serializer_for;
use crate::config::EmailDbConfig;
use crate::content::{BlockContent, CompoundId, Envelope, HeaderContent};
use crate::engine::{BlockEngine, BlockLocation, ScanReport};
use crate::error::{Error, Result};
use crate::index::IndexSet;
use crate::keys::KeyManager;
use crate::search::{SearchEngine, SearchQuery, SearchResult};
use crate::store::{batch, AppendOutcome, EmailStore};
use crate::version::{self, FormatVersion};

/// Suffix of the index sidecar directory.
pub const INDEX_SIDECAR_SUFFIX: &str = ".idx";
/// Suffix of the hash-chain sidecar log.
pub const CHAIN_SIDECAR_SUFFIX: &str = ".chain";

#[derive(Debug)]
pub struct EmailDb {
    path: PathBuf,
    config: EmailDbConfig,
    engine: Arc<BlockEngine>,
    indexes: Arc<IndexSet>,
    chain: Arc<HashChain>,
    keys: Arc<KeyManager>,
    store: Arc<EmailStore>,
    search: SearchEngine,
    header: RwLock<HeaderContent>,
    writable: bool,
}

pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl EmailDb {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Create a fresh database with the default capability set.
    pub async fn create(path: impl AsRef<Path>, config: EmailDbConfig) -> Result<Self> {
        Self::create_with(path, config, version::CURRENT, version::capability::DEFAULT).await
    }

    /// Create a fresh database with an explicit version and capability mask.
    pub async fn create_with(
        path: impl AsRef<Path>,
        config: EmailDbConfig,
        file_version: FormatVersion,
        capabilities: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let engine = BlockEngine::open(
            &path,
            true,
            config.fsync_on_append,
            config.max_parallel_readers,
        )
        .await?;
        if engine.block_count() > 0 {
            return Err(Error::Internal(format!(
                "{} already contains blocks; open it instead",
                path.display()
            )));
        }

        let header = version::new_header(file_version, capabilities);
        let payload = serializer_for(PayloadEncoding::Json)
            .to_bytes(&BlockContent::Header(header.clone()))?;
        let block = Block::new(
            BlockKind::Metadata,
            HEADER_BLOCK_ID,
            PayloadEncoding::Json,
            payload,
        );
        engine.append(&block, &CancellationToken::new()).await?;
        info!(path = %path.display(), version = %file_version, "created database");

        Self::assemble(path, config, engine, header, true)
    }

    /// Open an existing database.  Strict: a missing or invalid header block
    /// refuses the open; the recovery scan (`scan`) enumerates salvageable
    /// blocks without this gate.
    pub async fn open(path: impl AsRef<Path>, config: EmailDbConfig) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let engine = BlockEngine::open(
            &path,
            false,
            config.fsync_on_append,
            config.max_parallel_readers,
        )
        .await?;

        let header_block = engine.read(HEADER_BLOCK_ID).await?;
        if header_block.kind != BlockKind::Metadata {
            return Err(Error::UnknownKind { offset: 0, kind: header_block.kind as u8 });
        }
        let header = serializer_for(header_block.payload_encoding)
            .from_bytes(&header_block.payload)?
            .into_header()?;

        let file_version = version::detect_version(&header);
        version::check_compatibility(file_version)?;
        let writable = version::is_writable(file_version);
        info!(
            path = %path.display(),
            version = %file_version,
            writable,
            capabilities = ?version::capability::names(header.capabilities),
            "opened database"
        );

        let db = Self::assemble(path, config, engine, header, writable)?;
        if db.config.verify_chain_on_open {
            if let ChainVerdict::InvalidAt { block_id, reason } = db.verify().await? {
                return Err(Error::ChainInvalid { block_id, reason });
            }
        }
        Ok(db)
    }

    fn assemble(
        path: PathBuf,
        config: EmailDbConfig,
        engine: BlockEngine,
        header: HeaderContent,
        writable: bool,
    ) -> Result<Self> {
        let engine = Arc::new(engine);
        let alloc = Arc::new(BlockIdAllocator::new());
        for id in engine.locations().keys() {
            alloc.register(*id);
        }

        let indexes = Arc::new(IndexSet::open(
            sidecar_path(&path, INDEX_SIDECAR_SUFFIX),
            config.stopwords.clone(),
            config.min_token_len,
        )?);
        let chain = Arc::new(HashChain::open(
            sidecar_path(&path, CHAIN_SIDECAR_SUFFIX),
            config.fsync_on_append,
        )?);
        let keys = Arc::new(KeyManager::new());
        let store = Arc::new(EmailStore::new(
            Arc::clone(&engine),
            Arc::clone(&indexes),
            Arc::clone(&chain),
            Arc::clone(&alloc),
            Arc::clone(&keys),
            config.clone(),
        ));
        let search = SearchEngine::new(
            Arc::clone(&indexes),
            Arc::clone(&store),
            config.envelope_cache_entries,
        );

        Ok(Self {
            path,
            config,
            engine,
            indexes,
            chain,
            keys,
            store,
            search,
            header: RwLock::new(header),
            writable,
        })
    }

    /// Replace the header snapshot: mutate a copy, stamp `modified_at`,
    /// append a superseding metadata block, then swap the snapshot.
    pub async fn update_header(
        &self,
        mutate: impl FnOnce(&mut HeaderContent),
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut next = self.header.read().clone();
        mutate(&mut next);
        next.modified_at = chrono::Utc::now().timestamp();

        let payload = serializer_for(PayloadEncoding::Json)
            .to_bytes(&BlockContent::Header(next.clone()))?;
        let block = Block::new(
            BlockKind::Metadata,
            HEADER_BLOCK_ID,
            PayloadEncoding::Json,
            payload,
        );
        self.engine.append(&block, cancel).await?;
        *self.header.write() = next;
        Ok(())
    }

    // ── Key management ───────────────────────────────────────────────────────

    /// Unlock the key vault.  A file with no key-manager block yet gets a
    /// fresh vault under this master key.
    pub async fn unlock_keys(&self, master_key: [u8; 32]) -> Result<()> {
        let latest = self
            .engine
            .locations()
            .keys()
            .copied()
            .filter(|&id| BlockIdAllocator::id_matches_kind(id, BlockKind::KeyManager))
            .max();
        match latest {
            Some(block_id) => {
                let block = self.engine.read(block_id).await?;
                let content = serializer_for(block.payload_encoding)
                    .from_bytes(&block.payload)?
                    .into_key_manager()?;
                self.keys.unlock(&master_key, &content)
            }
            None => {
                self.keys.initialize(master_key);
                Ok(())
            }
        }
    }

    /// Zero in-memory key material and lock the vault.
    pub fn lock_keys(&self) {
        self.keys.lock();
    }

    pub fn keys_unlocked(&self) -> bool {
        self.keys.is_unlocked()
    }

    // ── Email operations ─────────────────────────────────────────────────────

    pub async fn append_email(
        &self,
        bytes: Vec<u8>,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        self.ensure_writable()?;
        self.store.append_email(bytes, envelope, cancel).await
    }

    pub async fn read_email(&self, cid: CompoundId) -> Result<Vec<u8>> {
        self.store.read_email(cid).await
    }

    pub async fn move_email(
        &self,
        cid: CompoundId,
        new_folder: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.store.move_email(cid, new_folder, cancel).await
    }

    pub async fn list_folder(&self, folder_path: &str) -> Result<Vec<Envelope>> {
        self.store.list_folder(folder_path).await
    }

    /// Seal the open batch.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        self.store.flush(cancel).await
    }

    // ── Index lookups ────────────────────────────────────────────────────────

    pub async fn by_message_id(&self, message_id: &str) -> Result<Option<CompoundId>> {
        self.indexes.by_message_id(message_id).await
    }

    pub async fn by_envelope_hash(&self, hash: &[u8]) -> Result<Option<CompoundId>> {
        self.indexes.by_envelope_hash(hash).await
    }

    pub async fn by_content_hash(&self, hash: &[u8]) -> Result<Option<CompoundId>> {
        self.indexes.by_content_hash(hash).await
    }

    /// File location of the batch block containing `cid`.
    pub fn location_of(&self, cid: CompoundId) -> Option<BlockLocation> {
        self.engine.locations().get(&cid.block_id).copied()
    }

    /// Envelope-block id holding `cid`'s envelope.
    pub async fn envelope_block_of(&self, cid: CompoundId) -> Result<Option<i64>> {
        self.indexes.envelope_block_of(cid).await
    }

    /// All folders under `prefix`, with their latest envelope-block ids.
    pub async fn folders_under(&self, prefix: &str) -> Result<Vec<(String, i64)>> {
        self.indexes.folders_under(prefix).await
    }

    /// Rebuild missing index entries from batch + envelope blocks.
    pub async fn reconcile(&self) -> Result<u64> {
        self.store.reconcile().await
    }

    // ── Search ───────────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search.search(query, limit).await
    }

    pub async fn advanced_search(
        &self,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search.advanced_search(query, limit).await
    }

    // ── Integrity ────────────────────────────────────────────────────────────

    /// Full hash-chain verification: linkage, then a re-hash of every sealed
    /// batch through the decode pipeline.
    pub async fn verify(&self) -> Result<ChainVerdict> {
        let verdict = self.chain.verify_links().await;
        if !verdict.is_valid() {
            return Ok(verdict);
        }
        for entry in self.chain.entries().await {
            match self.store.read_batch(entry.block_id).await {
                Ok((block, entries)) => {
                    let hashes = batch::entry_hashes(entries.iter().map(|e| e.bytes.as_slice()));
                    let recomputed = chain::block_hash(&block.header_bytes(), &hashes);
                    if recomputed != entry.block_hash {
                        return Ok(ChainVerdict::InvalidAt {
                            block_id: entry.block_id,
                            reason: "block hash mismatch".into(),
                        });
                    }
                }
                Err(Error::NotFound(_)) => {
                    return Ok(ChainVerdict::InvalidAt {
                        block_id: entry.block_id,
                        reason: "block missing".into(),
                    });
                }
                Err(e) if e.is_corruption() => {
                    return Ok(ChainVerdict::InvalidAt {
                        block_id: entry.block_id,
                        reason: "block hash mismatch".into(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ChainVerdict::Valid)
    }

    /// Build the existence proof for one stored email.
    pub async fn existence_proof(&self, cid: CompoundId) -> Result<ExistenceProof> {
        let (block, entries) = self.store.read_batch(cid.block_id).await?;
        let hashes = batch::entry_hashes(entries.iter().map(|e| e.bytes.as_slice()));
        let slot = cid.local_id as usize;
        if slot >= hashes.len() {
            return Err(Error::EmailNotFound(cid.block_id, cid.local_id));
        }
        Ok(ExistenceProof {
            compound_id: cid,
            email_hash: hashes[slot],
            header_bytes: block.header_bytes().to_vec(),
            block_hash: chain::block_hash(&block.header_bytes(), &hashes),
            entry_hashes: hashes,
            chain_segment: self.chain.segment_from(cid.block_id).await?,
        })
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Recovery scan of the block file (read-only).
    pub async fn scan(&self) -> Result<ScanReport> {
        self.engine.scan().await
    }

    /// Copy all reachable blocks to `target_path`; the caller renames.
    pub async fn compact(
        &self,
        target_path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.engine.compact(target_path, cancel).await
    }

    /// Seal, flush sidecars, and dispose the engine handle.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if self.writable {
            self.store.flush(cancel).await?;
        }
        self.indexes.flush().await?;
        self.engine.dispose().await;
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EmailDbConfig {
        &self.config
    }

    /// Immutable snapshot of the header content.
    pub fn header(&self) -> HeaderContent {
        self.header.read().clone()
    }

    pub fn detect_version(&self) -> FormatVersion {
        version::detect_version(&self.header.read())
    }

    pub fn capabilities(&self) -> u64 {
        self.header.read().capabilities
    }

    pub fn locations(&self) -> std::collections::HashMap<i64, BlockLocation> {
        self.engine.locations()
    }

    pub async fn chain_len(&self) -> usize {
        self.chain.len().await
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::UnsupportedVersion {
                found: self.detect_version().to_string(),
                detail: "file major differs from implementation; read-only until migrated".into(),
            });
        }
        Ok(())
    }
}
