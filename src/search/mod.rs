//! Search optimizer — conjunctive term search over the full-text index.
//!
//! Query terms are tokenized with the same rules as indexing (lowercase,
//! minimum length, stopword filter); each term's posting set is fetched and
//! the sets are intersected.  Matches are ranked by term frequency — the
//! summed occurrence counts stored in the postings — with a mild recency
//! boost (block ids are monotone with time), trimmed to the requested top-K
//! *before* hydration, then hydrated one envelope block per group: results
//! are clustered by their envelope-block id so each block is read at most
//! once, through an LRU.
//!
//! Field search intersects whatever predicates are given; a query whose only
//! predicate is a date range falls back to scanning every indexed email and
//! filtering on the hydrated envelopes.
//!
//! Envelope blocks are immutable and their ids are never reused, so the LRU
//! never serves stale data; entries leave only by capacity eviction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::alloc::ID_WINDOW;
use crate::content::{CompoundId, Envelope, FolderEnvelopeContent};
use crate::error::Result;
use crate::index::IndexSet;
use crate::store::EmailStore;

/// One ranked hit, hydrated with its envelope when available.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub compound_id: CompoundId,
    pub score: f64,
    pub envelope: Option<Envelope>,
}

/// Field-match query for [`SearchEngine::advanced_search`].  Every provided
/// field must match (intersection semantics).
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    /// Inclusive `(start, end)` bounds on the envelope date.
    pub date_range: Option<(i64, i64)>,
    pub folder: Option<String>,
}

#[derive(Debug)]
pub struct SearchEngine {
    indexes: Arc<IndexSet>,
    store: Arc<EmailStore>,
    envelope_cache: Mutex<LruCache<i64, Arc<FolderEnvelopeContent>>>,
}

impl SearchEngine {
    pub fn new(indexes: Arc<IndexSet>, store: Arc<EmailStore>, cache_entries: usize) -> Self {
        let cap = NonZeroUsize::new(cache_entries.max(1)).expect("non-zero cache capacity");
        Self {
            indexes,
            store,
            envelope_cache: Mutex::new(LruCache::new(cap)),
        }
    }

    // ── Keyword search ───────────────────────────────────────────────────────

    /// Conjunctive keyword search: every usable term must match.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let terms = self.indexes.tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        // Intersect posting sets, accumulating per-document term frequency
        // (the summed occurrence counts of every matched query term).
        let mut stats: HashMap<CompoundId, (usize, u32)> = HashMap::new();
        for term in &terms {
            let posting = self.indexes.postings(term).await?;
            if posting.is_empty() {
                return Ok(Vec::new());
            }
            for (cid, count) in posting {
                let entry = stats.entry(cid).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += count;
            }
        }

        let mut scored: Vec<(CompoundId, f64)> = stats
            .into_iter()
            .filter(|(_, (matched, _))| *matched == terms.len())
            .map(|(cid, (_, tf))| (cid, score(tf, cid)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        debug!(terms = terms.len(), hits = scored.len(), "keyword search");
        self.hydrate(scored).await
    }

    // ── Advanced search ──────────────────────────────────────────────────────

    /// Intersect independent field-match sets, then filter precisely against
    /// the hydrated envelopes.
    pub async fn advanced_search(
        &self,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut candidates: Option<HashSet<CompoundId>> = None;
        let mut tf: HashMap<CompoundId, u32> = HashMap::new();

        for field in [&query.from, &query.to, &query.subject].into_iter().flatten() {
            let mut set: Option<HashSet<CompoundId>> = None;
            for term in self.indexes.tokenize(field) {
                let posting = self.indexes.postings(&term).await?;
                for &(cid, count) in &posting {
                    *tf.entry(cid).or_insert(0) += count;
                }
                let ids: HashSet<CompoundId> =
                    posting.into_iter().map(|(cid, _)| cid).collect();
                set = Some(match set {
                    Some(s) => s.intersection(&ids).copied().collect(),
                    None => ids,
                });
            }
            if let Some(set) = set {
                candidates = Some(match candidates {
                    Some(c) => c.intersection(&set).copied().collect(),
                    None => set,
                });
            }
        }

        if let Some(folder) = &query.folder {
            let members: HashSet<CompoundId> =
                self.store.folder_members(folder).await?.into_iter().collect();
            candidates = Some(match candidates {
                Some(c) => c.intersection(&members).copied().collect(),
                None => members,
            });
        }

        let candidates = match candidates {
            Some(c) => c,
            // A bare date range carries no postings: every indexed email is a
            // candidate and the precise date filter runs after hydration.
            None if query.date_range.is_some() => {
                self.indexes.all_email_ids().await?.into_iter().collect()
            }
            None => return Ok(Vec::new()),
        };

        let mut scored: Vec<(CompoundId, f64)> = candidates
            .into_iter()
            .map(|cid| (cid, score(tf.get(&cid).copied().unwrap_or(1), cid)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let hydrated = self.hydrate(scored).await?;
        let mut out: Vec<SearchResult> = hydrated
            .into_iter()
            .filter(|r| match &r.envelope {
                Some(env) => matches_query(env, query),
                None => false,
            })
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    // ── Hydration ────────────────────────────────────────────────────────────

    async fn hydrate(&self, scored: Vec<(CompoundId, f64)>) -> Result<Vec<SearchResult>> {
        // One envelope-block read per group.
        let mut groups: BTreeMap<i64, Vec<(CompoundId, f64)>> = BTreeMap::new();
        let mut unlocated: Vec<(CompoundId, f64)> = Vec::new();
        for (cid, s) in scored {
            match self.indexes.envelope_block_of(cid).await? {
                Some(block) => groups.entry(block).or_default().push((cid, s)),
                None => unlocated.push((cid, s)),
            }
        }

        let mut results = Vec::new();
        for (block_id, members) in groups {
            let content = self.envelope_block(block_id).await?;
            for (cid, s) in members {
                let envelope = content
                    .entries
                    .iter()
                    .find(|e| e.compound_id() == cid)
                    .and_then(|e| e.envelope.clone());
                results.push(SearchResult { compound_id: cid, score: s, envelope });
            }
        }
        for (cid, s) in unlocated {
            results.push(SearchResult { compound_id: cid, score: s, envelope: None });
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn envelope_block(&self, block_id: i64) -> Result<Arc<FolderEnvelopeContent>> {
        if let Some(hit) = self.envelope_cache.lock().get(&block_id) {
            return Ok(Arc::clone(hit));
        }
        let content = Arc::new(self.store.read_envelope_block(block_id).await?);
        self.envelope_cache.lock().put(block_id, Arc::clone(&content));
        Ok(content)
    }
}

/// Term frequency dominates; the fractional part nudges newer batches first.
fn score(tf: u32, cid: CompoundId) -> f64 {
    let age_in_window = (cid.block_id % ID_WINDOW) as f64;
    tf as f64 + age_in_window / ID_WINDOW as f64
}

fn matches_query(env: &Envelope, q: &SearchQuery) -> bool {
    if let Some(from) = &q.from {
        if !env.from.to_lowercase().contains(&from.to_lowercase()) {
            return false;
        }
    }
    if let Some(to) = &q.to {
        let needle = to.to_lowercase();
        if !env.to.iter().any(|a| a.to_lowercase().contains(&needle)) {
            return false;
        }
    }
    if let Some(subject) = &q.subject {
        if !env.subject.to_lowercase().contains(&subject.to_lowercase()) {
            return false;
        }
    }
    if let Some((start, end)) = q.date_range {
        if env.date < start || env.date > end {
            return false;
        }
    }
    if let Some(folder) = &q.folder {
        if &env.folder_path != folder {
            return false;
        }
    }
    true
}
