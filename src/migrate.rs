//! Migration driver — execute version upgrades planned by `version`.
//!
//! A minor upgrade rewrites the header only, expressed append-only: a
//! superseding metadata block under the fixed header id, which newest-wins
//! on the next recovery scan.  A major upgrade walks every reachable block
//! into a fresh file — re-framed at the current block format version,
//! payloads and block ids preserved so compound ids survive — and atomically
//! renames it over the original.  Downgrades and major-skips never reach
//! this module; [`plan_upgrade`] refuses them.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alloc::HEADER_BLOCK_ID;
use crate::block::{Block, BlockKind, PayloadEncoding, BLOCK_FORMAT_VERSION};
use crate::codec::serializer_for;
use crate::content::BlockContent;
use crate::engine::BlockEngine;
use crate::error::{Error, Result};
use crate::version::{
    check_compatibility, default_block_format_versions, detect_version, plan_upgrade,
    FormatVersion, UpgradePlan,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub plan: UpgradePlan,
    pub from: FormatVersion,
    pub to: FormatVersion,
    pub blocks_rewritten: u64,
}

/// Upgrade the file at `path` to `to`.
pub async fn migrate(
    path: impl AsRef<Path>,
    to: FormatVersion,
    cancel: &CancellationToken,
) -> Result<MigrationOutcome> {
    let path = path.as_ref();
    let engine = BlockEngine::open(path, false, true, 4).await?;

    let header_block = engine.read(HEADER_BLOCK_ID).await?;
    let header = serializer_for(header_block.payload_encoding)
        .from_bytes(&header_block.payload)?
        .into_header()?;
    let from = detect_version(&header);
    check_compatibility(from)?;

    let plan = plan_upgrade(from, to)?;
    let outcome = match plan {
        UpgradePlan::None => MigrationOutcome { plan, from, to, blocks_rewritten: 0 },
        UpgradePlan::InPlace => {
            let mut next = header.clone();
            next.file_version = to.pack();
            next.modified_at = chrono::Utc::now().timestamp();
            let payload =
                serializer_for(PayloadEncoding::Json).to_bytes(&BlockContent::Header(next))?;
            let block = Block::new(
                BlockKind::Metadata,
                HEADER_BLOCK_ID,
                PayloadEncoding::Json,
                payload,
            );
            engine.append(&block, cancel).await?;
            info!(%from, %to, "in-place header upgrade");
            MigrationOutcome { plan, from, to, blocks_rewritten: 0 }
        }
        UpgradePlan::Migration => {
            let rewritten = rewrite_blocks(path, &engine, &header_block, to, cancel).await?;
            info!(%from, %to, rewritten, "major migration complete");
            MigrationOutcome { plan, from, to, blocks_rewritten: rewritten }
        }
    };
    engine.dispose().await;
    Ok(outcome)
}

/// Walk all reachable blocks into `<path>.migrating`, then rename over the
/// original.  Block ids are preserved throughout, so compound ids survive.
async fn rewrite_blocks(
    path: &Path,
    engine: &BlockEngine,
    header_block: &Block,
    to: FormatVersion,
    cancel: &CancellationToken,
) -> Result<u64> {
    let target_path = crate::db::sidecar_path(path, ".migrating");
    if target_path.exists() {
        std::fs::remove_file(&target_path)?;
    }
    let target = BlockEngine::open(&target_path, true, true, 4).await?;

    let mut live: Vec<(i64, u64)> = engine
        .locations()
        .into_iter()
        .map(|(id, loc)| (id, loc.offset))
        .collect();
    live.sort_by_key(|(_, offset)| *offset);

    let mut rewritten = 0u64;
    for (block_id, _) in live {
        if cancel.is_cancelled() {
            target.dispose().await;
            std::fs::remove_file(&target_path)?;
            return Err(Error::Cancelled);
        }
        let mut block = engine.read(block_id).await?;

        if block_id == HEADER_BLOCK_ID {
            let mut header = serializer_for(header_block.payload_encoding)
                .from_bytes(&header_block.payload)?
                .into_header()?;
            header.file_version = to.pack();
            header.modified_at = chrono::Utc::now().timestamp();
            header.block_format_versions = default_block_format_versions();
            block.payload =
                serializer_for(block.payload_encoding).to_bytes(&BlockContent::Header(header))?;
        }
        if block.version != BLOCK_FORMAT_VERSION {
            block.version = BLOCK_FORMAT_VERSION;
            rewritten += 1;
        }
        target.append(&block, cancel).await?;
    }

    target.dispose().await;
    std::fs::rename(&target_path, path)?;
    Ok(rewritten)
}
