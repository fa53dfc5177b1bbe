//! Tunable options passed to [`EmailDb::create`] and [`EmailDb::open`].
//!
//! [`EmailDb::create`]: crate::db::EmailDb::create
//! [`EmailDb::open`]: crate::db::EmailDb::open

use std::collections::HashSet;

use crate::codec::CompressionAlgorithm;
use crate::crypto::EncryptionAlgorithm;

/// Default batch sealing threshold: 512 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 512 * 1024;
/// Default envelope-block LRU capacity.
pub const DEFAULT_ENVELOPE_CACHE_ENTRIES: usize = 100;
/// Tokens shorter than this never reach the full-text index.
pub const DEFAULT_MIN_TOKEN_LEN: usize = 3;

/// Fixed default stopword set for the full-text tokenizer.  Callers replace
/// the whole set via [`EmailDbConfig::stopwords`]; there is no merge.
pub const DEFAULT_STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "him", "his", "how", "its", "new", "now", "see", "two", "who",
    "way", "did", "get", "let", "she", "too", "use", "that", "with", "have", "this", "will",
    "your", "from", "they", "been", "were", "said", "each", "which", "their", "about", "would",
    "there", "what", "into",
];

#[derive(Debug, Clone)]
pub struct EmailDbConfig {
    /// Seal the open email batch once its payload would exceed this size.
    pub block_size_bytes: usize,
    /// Capacity of the envelope-block LRU used for search hydration.
    pub envelope_cache_entries: usize,
    /// fsync after every appended block.  Disable only for bulk import.
    pub fsync_on_append: bool,
    /// Stopwords excluded from the full-text index.
    pub stopwords: HashSet<String>,
    /// Minimum token length admitted to the full-text index.
    pub min_token_len: usize,
    /// Upper bound on concurrent block reads.
    pub max_parallel_readers: usize,
    /// Compression applied to sealed email batches and envelope blocks.
    pub compression: CompressionAlgorithm,
    pub compression_level: i32,
    /// Encryption applied to sealed email batches.  Anything other than
    /// `None` requires an unlocked key manager.
    pub encryption: EncryptionAlgorithm,
    /// Run a full hash-chain verification during `open` (archival mode).
    pub verify_chain_on_open: bool,
}

impl Default for EmailDbConfig {
    fn default() -> Self {
        Self {
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            envelope_cache_entries: DEFAULT_ENVELOPE_CACHE_ENTRIES,
            fsync_on_append: true,
            stopwords: DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect(),
            min_token_len: DEFAULT_MIN_TOKEN_LEN,
            max_parallel_readers: 16,
            compression: CompressionAlgorithm::Zstd,
            compression_level: 3,
            encryption: EncryptionAlgorithm::None,
            verify_chain_on_open: false,
        }
    }
}
