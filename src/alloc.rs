//! Block-id allocation: a range-partitioned 64-bit space.
//!
//! Each allocatable [`BlockKind`] owns a disjoint window of `10^13` ids, so a
//! block's kind is recoverable from its id alone and ids never collide across
//! kinds.  System blocks sit at fixed low ids below every window.
//!
//! The allocator is an owned value passed into the engine at construction —
//! tests instantiate their own.  `register` is fed every id observed during a
//! recovery scan so `next` continues monotonically past any existing block.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::block::BlockKind;

/// Width of one per-kind id window.
pub const ID_WINDOW: i64 = 10_000_000_000_000; // 10^13

/// Fixed id of the header block (the first metadata block, carrying
/// `HeaderContent`).
pub const HEADER_BLOCK_ID: i64 = 0;
/// Fixed id for non-header metadata blocks.
pub const METADATA_BLOCK_ID: i64 = 1;
/// Fixed id of the folder-tree block.
pub const FOLDER_TREE_BLOCK_ID: i64 = 2;
/// Fixed id reserved for the WAL kind.
pub const WAL_BLOCK_ID: i64 = 3;

/// Window index per allocatable kind.  Windows start at 1; window 0 is the
/// fixed system range.
fn window_of(kind: BlockKind) -> Option<usize> {
    match kind {
        BlockKind::EmailBatch => Some(1),
        BlockKind::Folder => Some(2),
        BlockKind::FolderEnvelope => Some(3),
        BlockKind::Segment => Some(4),
        BlockKind::Cleanup => Some(5),
        BlockKind::KeyManager => Some(6),
        BlockKind::KeyExchange => Some(7),
        BlockKind::ZoneTreeKv => Some(8),
        BlockKind::ZoneTreeVector => Some(9),
        BlockKind::FreeSpace => Some(10),
        // Fixed-id kinds are never allocated from a window.
        BlockKind::Metadata | BlockKind::Wal | BlockKind::FolderTree => None,
    }
}

const WINDOW_COUNT: usize = 11;

#[derive(Debug)]
pub struct BlockIdAllocator {
    counters: [AtomicI64; WINDOW_COUNT],
}

impl Default for BlockIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIdAllocator {
    pub fn new() -> Self {
        let counters = std::array::from_fn(|w| AtomicI64::new(w as i64 * ID_WINDOW));
        Self { counters }
    }

    /// Allocate the next id for `kind`.
    ///
    /// # Panics
    /// Panics if `kind` has no window (metadata / wal / folder-tree use fixed
    /// system ids) — that is a programming error, not a runtime condition.
    pub fn next(&self, kind: BlockKind) -> i64 {
        let w = window_of(kind)
            .unwrap_or_else(|| panic!("block kind {} has a fixed id", kind.name()));
        self.counters[w].fetch_add(1, Ordering::SeqCst)
    }

    /// Record an id observed during recovery, bumping the owning window's
    /// counter monotonically past it.  Ids outside every window (the fixed
    /// system range) are ignored.
    pub fn register(&self, existing_id: i64) {
        let w = (existing_id / ID_WINDOW) as usize;
        if w == 0 || w >= WINDOW_COUNT {
            return;
        }
        let counter = &self.counters[w];
        let mut current = counter.load(Ordering::SeqCst);
        while existing_id >= current {
            match counter.compare_exchange(
                current,
                existing_id + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Range-membership check: does `id` belong to `kind`?
    pub fn id_matches_kind(id: i64, kind: BlockKind) -> bool {
        match kind {
            BlockKind::Metadata => id == HEADER_BLOCK_ID || id == METADATA_BLOCK_ID,
            BlockKind::FolderTree => id == FOLDER_TREE_BLOCK_ID,
            BlockKind::Wal => id == WAL_BLOCK_ID,
            _ => match window_of(kind) {
                Some(w) => {
                    let base = w as i64 * ID_WINDOW;
                    id >= base && id < base + ID_WINDOW
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_disjoint_and_monotone() {
        let alloc = BlockIdAllocator::new();
        let a = alloc.next(BlockKind::EmailBatch);
        let b = alloc.next(BlockKind::EmailBatch);
        let f = alloc.next(BlockKind::Folder);
        assert_eq!(b, a + 1);
        assert!(BlockIdAllocator::id_matches_kind(a, BlockKind::EmailBatch));
        assert!(BlockIdAllocator::id_matches_kind(f, BlockKind::Folder));
        assert!(!BlockIdAllocator::id_matches_kind(f, BlockKind::EmailBatch));
    }

    #[test]
    fn register_bumps_past_observed() {
        let alloc = BlockIdAllocator::new();
        alloc.register(ID_WINDOW + 500);
        assert_eq!(alloc.next(BlockKind::EmailBatch), ID_WINDOW + 501);
        // System ids never disturb a window counter.
        alloc.register(HEADER_BLOCK_ID);
        alloc.register(WAL_BLOCK_ID);
        assert_eq!(alloc.next(BlockKind::EmailBatch), ID_WINDOW + 502);
    }
}
