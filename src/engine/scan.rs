//! Forward recovery scan — rebuild the block list without any external state.
//!
//! # How it works
//!
//! The file is read in overlapping chunks; the overlap is `sizeof(magic) - 1`
//! bytes, so a header magic spanning a chunk boundary is detected exactly
//! once.  Every candidate offset is probed independently: parse the 41-byte
//! header, verify its CRC32, read the declared frame, verify payload CRC and
//! footer.  A candidate that validates fully advances the scan past its
//! payload, so magic bytes *inside* a valid payload are never probed; a
//! candidate that fails is recorded and the search resumes one byte later.
//!
//! Duplicate block ids are reported in file order; the caller applying the
//! report keeps the last occurrence (newest wins).
//!
//! ## Block health
//!
//! | Verdict | Meaning |
//! |---------|---------|
//! | `Healthy` | full frame validates; block is usable |
//! | `HeaderCorrupt` | magic found but header CRC/kind invalid; skipped |
//! | `TruncatedPayload` | header valid, file ends before the declared length |
//! | `PayloadCorrupt` | header valid, payload CRC or footer disagrees |
//!
//! A truncated tail frame (crash mid-append) therefore degrades to a single
//! `TruncatedPayload` record and everything before it stays readable.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::block::{Block, BlockKind, FrameHeader, HEADER_MAGIC, HEADER_WITH_CRC};
use crate::error::Result;

/// Chunk size for the forward scan.
const SCAN_CHUNK: usize = 256 * 1024;
const MAGIC_LEN: usize = 8;

// ── Types ─────────────────────────────────────────────────────────────────────

/// The health verdict for one scanned candidate offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHealth {
    Healthy,
    HeaderCorrupt,
    TruncatedPayload { declared: u64, available: u64 },
    PayloadCorrupt,
}

/// Diagnostic record for one candidate frame.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    /// Absolute byte offset of the candidate header.
    pub offset: u64,
    /// From the parsed header; 0 when the header itself is corrupt.
    pub block_id: i64,
    pub kind: Option<BlockKind>,
    /// Declared frame length; 0 when the header is corrupt.
    pub length: u64,
    pub health: BlockHealth,
}

/// Overall quality of a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanQuality {
    /// Every candidate validated (or the file is empty).
    Full,
    /// At least half of the candidates validated.
    Partial,
    /// Fewer than half validated; results unreliable.
    Catastrophic,
}

/// Complete report produced by a recovery scan.
#[derive(Debug)]
pub struct ScanReport {
    pub total_candidates: usize,
    pub healthy: usize,
    pub header_corrupt: usize,
    pub truncated: usize,
    pub payload_corrupt: usize,
    pub bytes_scanned: u64,
    /// Per-candidate records in file order.
    pub blocks: Vec<ScannedBlock>,
    pub quality: ScanQuality,
}

impl ScanReport {
    /// Offsets of the healthy frames, in append order.
    pub fn offsets(&self) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|b| b.health == BlockHealth::Healthy)
            .map(|b| b.offset)
            .collect()
    }

    /// Healthy block ids in append order (duplicates included).
    pub fn block_ids(&self) -> Vec<i64> {
        self.blocks
            .iter()
            .filter(|b| b.health == BlockHealth::Healthy)
            .map(|b| b.block_id)
            .collect()
    }

    pub fn health_pct(&self) -> f64 {
        if self.total_candidates == 0 {
            return 100.0;
        }
        self.healthy as f64 / self.total_candidates as f64 * 100.0
    }

    /// Summary line for display.
    pub fn summary(&self) -> String {
        format!(
            "{:?} scan: {}/{} frames healthy ({:.1}%), {} truncated, {} corrupt, {:.2} MiB scanned",
            self.quality,
            self.healthy,
            self.total_candidates,
            self.health_pct(),
            self.truncated,
            self.header_corrupt + self.payload_corrupt,
            self.bytes_scanned as f64 / 1024.0 / 1024.0,
        )
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

pub(crate) fn scan_frames(file: &File, file_len: u64) -> Result<ScanReport> {
    let magic = HEADER_MAGIC.to_le_bytes();

    let mut blocks: Vec<ScannedBlock> = Vec::new();
    let mut healthy = 0usize;
    let mut header_corrupt = 0usize;
    let mut truncated = 0usize;
    let mut payload_corrupt = 0usize;

    // Candidates inside a validated frame are payload bytes, not headers.
    let mut next_unclaimed: u64 = 0;

    let mut base: u64 = 0;
    while base < file_len {
        let want = SCAN_CHUNK + MAGIC_LEN - 1;
        let avail = (file_len - base).min(want as u64) as usize;
        let mut chunk = vec![0u8; avail];
        file.read_exact_at(&mut chunk, base)?;

        // Window starts are owned by this chunk only up to SCAN_CHUNK; the
        // overlap bytes exist so a window starting near the edge completes.
        let limit = avail.min(SCAN_CHUNK);
        for p in 0..limit {
            if p + MAGIC_LEN > avail {
                break;
            }
            if chunk[p..p + MAGIC_LEN] != magic {
                continue;
            }
            let offset = base + p as u64;
            if offset < next_unclaimed {
                continue;
            }

            let sb = probe(file, offset, file_len)?;
            match sb.health {
                BlockHealth::Healthy => {
                    healthy += 1;
                    next_unclaimed = offset + sb.length;
                }
                BlockHealth::HeaderCorrupt => header_corrupt += 1,
                BlockHealth::TruncatedPayload { .. } => truncated += 1,
                BlockHealth::PayloadCorrupt => payload_corrupt += 1,
            }
            blocks.push(sb);
        }

        base += SCAN_CHUNK as u64;
    }

    let total_candidates = blocks.len();
    let quality = if total_candidates == 0 || healthy == total_candidates {
        ScanQuality::Full
    } else if healthy * 2 >= total_candidates {
        ScanQuality::Partial
    } else {
        ScanQuality::Catastrophic
    };

    Ok(ScanReport {
        total_candidates,
        healthy,
        header_corrupt,
        truncated,
        payload_corrupt,
        bytes_scanned: file_len,
        blocks,
        quality,
    })
}

/// Probe one candidate offset: header first, then the full frame.
fn probe(file: &File, offset: u64, file_len: u64) -> Result<ScannedBlock> {
    let available = file_len - offset;
    if available < HEADER_WITH_CRC as u64 {
        return Ok(ScannedBlock {
            offset,
            block_id: 0,
            kind: None,
            length: 0,
            health: BlockHealth::TruncatedPayload {
                declared: HEADER_WITH_CRC as u64,
                available,
            },
        });
    }

    let mut hdr = [0u8; HEADER_WITH_CRC];
    file.read_exact_at(&mut hdr, offset)?;
    let header = match FrameHeader::parse(&hdr, offset) {
        Ok(h) => h,
        Err(_) => {
            return Ok(ScannedBlock {
                offset,
                block_id: 0,
                kind: None,
                length: 0,
                health: BlockHealth::HeaderCorrupt,
            });
        }
    };

    let total = header.frame_len() as u64;
    if available < total {
        return Ok(ScannedBlock {
            offset,
            block_id: header.block_id,
            kind: Some(header.kind),
            length: total,
            health: BlockHealth::TruncatedPayload { declared: total, available },
        });
    }

    let mut frame = vec![0u8; total as usize];
    file.read_exact_at(&mut frame, offset)?;
    let health = match Block::decode(&frame, offset) {
        Ok(_) => BlockHealth::Healthy,
        Err(_) => BlockHealth::PayloadCorrupt,
    };

    Ok(ScannedBlock {
        offset,
        block_id: header.block_id,
        kind: Some(header.kind),
        length: total,
        health,
    })
}
