//! Raw block engine — append, read, scan, compact.
//!
//! # Writer
//! A single writer appends fully framed blocks at the file tail.  `append`
//! holds the writer lock across one contiguous write + fsync + location-map
//! update, so readers never observe a partial block.  An I/O failure leaves
//! the map untouched: whatever bytes landed on disk are invisible and the
//! next recovery scan skips them.
//!
//! # Readers
//! Reads are positioned (`pread`) against a shared descriptor, so any number
//! of readers proceed concurrently under a short reader lock; a semaphore
//! bounds in-flight reads.  Every read re-validates the full frame — header
//! CRC, payload CRC, footer — and surfaces mismatches, never suppresses them.
//!
//! # Recovery
//! `open` rebuilds the in-memory block-location index with the same forward
//! scan exposed as [`BlockEngine::scan`]; see `scan.rs` for the chunked magic
//! search and health reporting.

mod scan;

pub use scan::{BlockHealth, ScanQuality, ScanReport, ScannedBlock};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::error::{Error, Result};

/// Where a block's frame lives inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
struct WriterState {
    tail: u64,
    disposed: bool,
}

#[derive(Debug)]
pub struct BlockEngine {
    path: PathBuf,
    file: Arc<File>,
    state: RwLock<WriterState>,
    locations: DashMap<i64, BlockLocation>,
    readers: Semaphore,
    fsync_on_append: bool,
}

impl BlockEngine {
    /// Open `path`, scanning the existing frames to rebuild the location
    /// index.  The tail is the physical end of file, so a partial frame left
    /// by a crash is never overwritten — the next append lands after it.
    pub async fn open(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        fsync_on_append: bool,
        max_parallel_readers: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(&path)?;
        let len = file.metadata()?.len();

        let engine = Self {
            path,
            file: Arc::new(file),
            state: RwLock::new(WriterState { tail: len, disposed: false }),
            locations: DashMap::new(),
            readers: Semaphore::new(max_parallel_readers.max(1)),
            fsync_on_append,
        };

        if len > 0 {
            let report = engine.scan().await?;
            // Payload-corrupt frames stay mapped: their headers are sound, and
            // a read must surface the checksum mismatch, not a missing id.
            // Header-corrupt and truncated candidates are invisible.
            for sb in report.blocks.iter().filter(|b| {
                matches!(b.health, BlockHealth::Healthy | BlockHealth::PayloadCorrupt)
            }) {
                // Later frames win: a re-appended id supersedes the old block.
                engine.locations.insert(
                    sb.block_id,
                    BlockLocation { offset: sb.offset, length: sb.length },
                );
            }
            info!(
                path = %engine.path.display(),
                blocks = engine.locations.len(),
                quality = ?report.quality,
                "opened block file"
            );
            if report.healthy != report.total_candidates {
                warn!(
                    corrupt = report.header_corrupt + report.payload_corrupt,
                    truncated = report.truncated,
                    "scan skipped unusable frames"
                );
            }
        }

        Ok(engine)
    }

    /// Serialize `block` and append it at the tail.
    ///
    /// The new location is published only after the write (and fsync, when
    /// enabled) succeeds.  Cancellation is honoured before the first byte is
    /// written; once the write starts the append runs to completion so the
    /// file never carries a deliberately abandoned frame.
    pub async fn append(&self, block: &Block, cancel: &CancellationToken) -> Result<BlockLocation> {
        let frame = block.encode();

        let mut st = self.state.write().await;
        if st.disposed {
            return Err(Error::Disposed);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let offset = st.tail;
        let file = Arc::clone(&self.file);
        let fsync = self.fsync_on_append;
        let len = frame.len() as u64;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            file.write_all_at(&frame, offset)?;
            if fsync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("append task failed: {e}")))??;

        let location = BlockLocation { offset, length: len };
        self.locations.insert(block.block_id, location);
        st.tail = offset + len;
        debug!(block_id = block.block_id, kind = block.kind.name(), offset, len, "appended block");
        Ok(location)
    }

    /// Read and fully validate the block mapped to `block_id`.
    pub async fn read(&self, block_id: i64) -> Result<Block> {
        {
            let st = self.state.read().await;
            if st.disposed {
                return Err(Error::Disposed);
            }
        }
        let location = self
            .locations
            .get(&block_id)
            .map(|loc| *loc)
            .ok_or(Error::NotFound(block_id))?;

        let _permit = self
            .readers
            .acquire()
            .await
            .map_err(|_| Error::Disposed)?;

        let file = Arc::clone(&self.file);
        let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; location.length as usize];
            file.read_exact_at(&mut buf, location.offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| Error::Internal(format!("read task failed: {e}")))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Truncated {
                    offset: location.offset,
                    declared: location.length,
                    available: 0,
                }
            } else {
                Error::Io(e)
            }
        })?;

        let block = Block::decode(&buf, location.offset)?;
        if block.block_id != block_id {
            return Err(Error::Internal(format!(
                "location map points block {block_id} at a frame for block {}",
                block.block_id
            )));
        }
        Ok(block)
    }

    /// Forward recovery scan over the whole file.  Read-only: the location
    /// map is not touched.  See [`ScanReport`].
    pub async fn scan(&self) -> Result<ScanReport> {
        let file = Arc::clone(&self.file);
        let len = file.metadata()?.len();
        tokio::task::spawn_blocking(move || scan::scan_frames(&file, len))
            .await
            .map_err(|e| Error::Internal(format!("scan task failed: {e}")))?
    }

    /// Copy every block reachable through the current location map to
    /// `target_path`, in file order.  The source file is untouched; the
    /// caller renames the target into place when satisfied.
    pub async fn compact(
        &self,
        target_path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let target =
            BlockEngine::open(target_path, true, self.fsync_on_append, 1).await?;

        let mut live: Vec<(i64, BlockLocation)> = self
            .locations
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        live.sort_by_key(|(_, loc)| loc.offset);

        let mut copied = 0u64;
        for (block_id, _) in live {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let block = self.read(block_id).await?;
            target.append(&block, cancel).await?;
            copied += 1;
        }
        info!(copied, source = %self.path.display(), target = %target.path().display(), "compaction complete");
        target.dispose().await;
        Ok(copied)
    }

    /// Read-only snapshot of the block-location index.
    pub fn locations(&self) -> HashMap<i64, BlockLocation> {
        self.locations.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn contains(&self, block_id: i64) -> bool {
        self.locations.contains_key(&block_id)
    }

    pub fn block_count(&self) -> usize {
        self.locations.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn file_len(&self) -> u64 {
        self.state.read().await.tail
    }

    /// Mark the handle disposed.  Subsequent appends and reads fail with
    /// `State`; in-flight operations complete.
    pub async fn dispose(&self) {
        let mut st = self.state.write().await;
        st.disposed = true;
    }
}
