//! Format version negotiation and capability gating.
//!
//! The file format version is a `major.minor.patch` triple packed into an
//! `i32` as `(major << 24) | (minor << 16) | patch` and carried by the
//! header block.  Compatibility is decided once at `open`:
//!
//! - same major as the implementation: readable and writable;
//! - newer major on disk: refuse;
//! - older than [`MINIMUM_SUPPORTED`]: refuse;
//! - upgrades within a major rewrite the header only, one major up walks the
//!   blocks; downgrades and major-skips are refused (see [`plan_upgrade`]).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::{BlockKind, BLOCK_FORMAT_VERSION};
use crate::content::HeaderContent;
use crate::error::{Error, Result};

/// Format version written by this implementation.
pub const CURRENT: FormatVersion = FormatVersion { major: 2, minor: 0, patch: 0 };

/// Oldest major this implementation can open (via migration for majors
/// below [`CURRENT`]).
pub const MINIMUM_SUPPORTED: FormatVersion = FormatVersion { major: 1, minor: 0, patch: 0 };

// ── FormatVersion ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl FormatVersion {
    pub const fn new(major: u8, minor: u8, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Pack as `(major << 24) | (minor << 16) | patch`.
    pub fn pack(self) -> i32 {
        ((self.major as i32) << 24) | ((self.minor as i32) << 16) | self.patch as i32
    }

    pub fn unpack(v: i32) -> Self {
        Self {
            major: ((v >> 24) & 0xFF) as u8,
            minor: ((v >> 16) & 0xFF) as u8,
            patch: (v & 0xFFFF) as u16,
        }
    }

    /// Parse `"2.1.0"` (CLI `migrate` argument).
    pub fn parse(s: &str) -> Option<Self> {
        let mut it = s.split('.');
        let major = it.next()?.parse().ok()?;
        let minor = it.next()?.parse().ok()?;
        let patch = it.next().unwrap_or("0").parse().ok()?;
        if it.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// Capability bitmask flags declared by the header block.
pub mod capability {
    pub const COMPRESSION: u64 = 1 << 0;
    pub const ENCRYPTION: u64 = 1 << 1;
    pub const EMAIL_BATCHING: u64 = 1 << 2;
    pub const ENVELOPE_BLOCKS: u64 = 1 << 3;
    pub const IN_BAND_KEY_MANAGEMENT: u64 = 1 << 4;
    pub const HASH_CHAIN: u64 = 1 << 5;
    pub const FULL_TEXT_SEARCH: u64 = 1 << 6;
    pub const FOLDER_HIERARCHY: u64 = 1 << 7;
    pub const DEDUP: u64 = 1 << 8;
    pub const SUPERSEDING: u64 = 1 << 9;
    pub const ATOMIC_TRANSACTIONS: u64 = 1 << 10;

    const ALL: &[(u64, &str)] = &[
        (COMPRESSION, "compression"),
        (ENCRYPTION, "encryption"),
        (EMAIL_BATCHING, "email-batching"),
        (ENVELOPE_BLOCKS, "envelope-blocks"),
        (IN_BAND_KEY_MANAGEMENT, "in-band-key-management"),
        (HASH_CHAIN, "hash-chain"),
        (FULL_TEXT_SEARCH, "full-text-search"),
        (FOLDER_HIERARCHY, "folder-hierarchy"),
        (DEDUP, "dedup"),
        (SUPERSEDING, "superseding"),
        (ATOMIC_TRANSACTIONS, "atomic-transactions"),
    ];

    /// Capabilities written into a fresh file by this implementation.
    pub const DEFAULT: u64 = COMPRESSION
        | ENCRYPTION
        | EMAIL_BATCHING
        | ENVELOPE_BLOCKS
        | IN_BAND_KEY_MANAGEMENT
        | HASH_CHAIN
        | FULL_TEXT_SEARCH
        | FOLDER_HIERARCHY
        | DEDUP
        | SUPERSEDING;

    /// Decode a bitmask into capability names (diagnostics only).
    pub fn names(mask: u64) -> Vec<&'static str> {
        ALL.iter().filter(|(bit, _)| mask & bit != 0).map(|(_, n)| *n).collect()
    }
}

// ── Compatibility gating ─────────────────────────────────────────────────────

/// Gate an `open` on the on-disk version.  Same major: full access.
pub fn check_compatibility(file: FormatVersion) -> Result<()> {
    if file.major > CURRENT.major {
        return Err(Error::UnsupportedVersion {
            found: file.to_string(),
            detail: format!("newer than this implementation ({CURRENT})"),
        });
    }
    if file.major < MINIMUM_SUPPORTED.major {
        return Err(Error::UnsupportedVersion {
            found: file.to_string(),
            detail: format!("below minimum supported {MINIMUM_SUPPORTED}"),
        });
    }
    Ok(())
}

/// True when the file can be written (not just read) by this build.
pub fn is_writable(file: FormatVersion) -> bool {
    file.major == CURRENT.major
}

// ── Upgrade planning ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePlan {
    /// Versions are equal; nothing to do.
    None,
    /// Same major: rewrite the header block only.
    InPlace,
    /// One major up: walk blocks, rewriting kinds whose format changed.
    Migration,
}

pub fn plan_upgrade(from: FormatVersion, to: FormatVersion) -> Result<UpgradePlan> {
    if to == from {
        return Ok(UpgradePlan::None);
    }
    if to.major < from.major {
        return Err(Error::Downgrade {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if to.major == from.major {
        return Ok(UpgradePlan::InPlace);
    }
    if to.major == from.major + 1 {
        return Ok(UpgradePlan::Migration);
    }
    Err(Error::UnsupportedVersion {
        found: to.to_string(),
        detail: format!("cannot skip majors upgrading from {from}"),
    })
}

// ── Header construction ──────────────────────────────────────────────────────

/// Per-kind block format versions written by this implementation.
pub fn default_block_format_versions() -> HashMap<u32, i32> {
    [
        BlockKind::Metadata,
        BlockKind::Wal,
        BlockKind::FolderTree,
        BlockKind::Folder,
        BlockKind::EmailBatch,
        BlockKind::FolderEnvelope,
        BlockKind::KeyManager,
        BlockKind::KeyExchange,
        BlockKind::ZoneTreeKv,
        BlockKind::ZoneTreeVector,
        BlockKind::Cleanup,
        BlockKind::FreeSpace,
    ]
    .into_iter()
    .map(|k| (k as u8 as u32, BLOCK_FORMAT_VERSION as i32))
    .collect()
}

/// A fresh header payload for a newly created file.
pub fn new_header(version: FormatVersion, capabilities: u64) -> HeaderContent {
    let now = chrono::Utc::now().timestamp();
    HeaderContent {
        file_version: version.pack(),
        created_at: now,
        modified_at: now,
        first_metadata_offset: 0,
        first_folder_tree_offset: 0,
        first_cleanup_offset: 0,
        capabilities,
        block_format_versions: default_block_format_versions(),
        metadata: HashMap::new(),
    }
}

/// Extract the version triple from a header payload.
pub fn detect_version(header: &HeaderContent) -> FormatVersion {
    FormatVersion::unpack(header.file_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let v = FormatVersion::new(2, 1, 7);
        assert_eq!(FormatVersion::unpack(v.pack()), v);
        assert_eq!(v.pack(), (2 << 24) | (1 << 16) | 7);
    }

    #[test]
    fn newer_major_is_rejected() {
        let err = check_compatibility(FormatVersion::new(3, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
        assert!(check_compatibility(FormatVersion::new(2, 5, 1)).is_ok());
        assert!(check_compatibility(FormatVersion::new(1, 0, 0)).is_ok());
        assert!(check_compatibility(FormatVersion::new(0, 9, 0)).is_err());
    }

    #[test]
    fn upgrade_plans() {
        let v2 = FormatVersion::new(2, 0, 0);
        assert_eq!(plan_upgrade(v2, v2).unwrap(), UpgradePlan::None);
        assert_eq!(
            plan_upgrade(v2, FormatVersion::new(2, 1, 0)).unwrap(),
            UpgradePlan::InPlace
        );
        assert_eq!(
            plan_upgrade(FormatVersion::new(1, 3, 0), FormatVersion::new(2, 0, 0)).unwrap(),
            UpgradePlan::Migration
        );
        assert!(matches!(
            plan_upgrade(v2, FormatVersion::new(1, 0, 0)),
            Err(Error::Downgrade { .. })
        ));
        assert!(plan_upgrade(FormatVersion::new(1, 0, 0), FormatVersion::new(3, 0, 0)).is_err());
    }

    #[test]
    fn capability_names_decode() {
        let names = capability::names(capability::HASH_CHAIN | capability::DEDUP);
        assert_eq!(names, vec!["hash-chain", "dedup"]);
    }
}
