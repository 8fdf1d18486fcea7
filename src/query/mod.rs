//! Query engine: ADC precomputation and multi-sequence search.
//!
//! Stored vectors are never decompressed at query time. Distances are
//! assembled from additive lookup tables:
//!
//! ```text
//! ‖q − (c + p)‖² = ‖q‖²
//!                + (‖c‖² − 2⟨q, c⟩)        per coarse partition
//!                + (‖p‖² − 2⟨q, p⟩)        per product partition
//!                + 2⟨c, p⟩                 cross term
//! ```
//!
//! The norms and cross terms depend only on the codebook and are computed
//! once at load time; the `−2⟨q, ·⟩` terms are computed once per query
//! into the caller's scratch. Scoring a candidate is then `mp` table
//! lookups per code byte.
//!
//! Search state is owned by [`SearchScratch`], allocated by the caller
//! and reused across queries: one scratch per in-flight query, nothing
//! shared, so the engine itself can serve any number of threads
//! concurrently through `&self`.

mod multi;
mod ranked;
mod single;

use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::codebook::Codebook;
use crate::config::{PqConfig, SearchParams};
use crate::error::{IndexError, Result};
use crate::heap::BoundedHeap;
use crate::invfile::InvertedFile;
use crate::simd;

/// A bucket selected by the traversal, with the coarse digits its
/// candidates are scored against and the joint rank key it was popped at.
#[derive(Debug, Clone)]
pub struct CandidateBucket {
    pub bucket: u32,
    pub score: f32,
    pub digits: SmallVec<[u16; 2]>,
}

/// Per-query diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchDiagnostics {
    /// Rank combinations expanded by the traversal.
    pub expanded: usize,
    /// Expansions that landed on an empty bucket.
    pub empty_visits: usize,
    /// Non-empty buckets selected for scoring.
    pub candidate_buckets: usize,
    /// Frontier inserts rejected because the heap was full.
    pub frontier_dropped: u64,
}

/// Caller-owned transient state for one in-flight query.
///
/// `K` is the frontier tag arity: 1 for the single-partition walk, 4 for
/// the two-sequence variants, 6 for the three-rank variant. Obtain one
/// from the matching `QueryEngine::scratch_*` constructor and reuse it
/// across queries; buffers are resized lazily and the visited flags are
/// cleared incrementally (only the entries a query touched).
#[derive(Debug, Clone)]
pub struct SearchScratch<const K: usize> {
    pub(crate) frontier: BoundedHeap<K>,
    /// `‖c‖² − 2⟨q, c⟩` per coarse centroid, partition-major.
    pub(crate) coarse_terms: Vec<f32>,
    /// `‖p‖² − 2⟨q, p⟩` per product centroid, partition-major.
    pub(crate) product_terms: Vec<f32>,
    /// `‖q_j‖²` per coarse partition.
    pub(crate) part_norms: Vec<f32>,
    /// Per-partition `(rank value, centroid)` lists, `coarse_k` stride;
    /// the first M entries of each block are selected and sorted.
    pub(crate) ranked: Vec<(f32, u32)>,
    pub(crate) visited: Vec<bool>,
    pub(crate) touched: Vec<u32>,
    pub(crate) buckets: Vec<CandidateBucket>,
    pub(crate) ids: Vec<u32>,
    pub(crate) dists: Vec<f32>,
    pub(crate) empty_visits: usize,
    pub(crate) expanded: usize,
    /// Heap drop count at the start of the current query; the heap's
    /// counter is cumulative across its lifetime.
    dropped_base: u64,
}

impl<const K: usize> SearchScratch<K> {
    fn new(config: &PqConfig, frontier_capacity: usize, visited_len: usize) -> Self {
        Self {
            frontier: BoundedHeap::with_capacity(frontier_capacity),
            coarse_terms: vec![0.0; config.coarse_parts * config.coarse_k],
            product_terms: vec![0.0; config.product_parts * config.product_k],
            part_norms: vec![0.0; config.coarse_parts],
            ranked: vec![(0.0, 0); config.coarse_parts * config.coarse_k],
            visited: vec![false; visited_len],
            touched: Vec::new(),
            buckets: Vec::new(),
            ids: Vec::new(),
            dists: Vec::new(),
            empty_visits: 0,
            expanded: 0,
            dropped_base: 0,
        }
    }

    /// Buckets selected by the most recent query, in expansion order.
    pub fn candidates(&self) -> &[CandidateBucket] {
        &self.buckets
    }

    /// Counters from the most recent query.
    pub fn diagnostics(&self) -> SearchDiagnostics {
        SearchDiagnostics {
            expanded: self.expanded,
            empty_visits: self.empty_visits,
            candidate_buckets: self.buckets.len(),
            frontier_dropped: self.frontier.dropped() - self.dropped_base,
        }
    }

    /// Reset per-query state; visited flags are cleared through the
    /// touched list rather than wholesale.
    pub(crate) fn begin_query(&mut self, visited_len: usize) {
        self.frontier.clear();
        self.buckets.clear();
        self.ids.clear();
        self.dists.clear();
        self.empty_visits = 0;
        self.expanded = 0;
        self.dropped_base = self.frontier.dropped();
        if self.visited.len() < visited_len {
            self.visited.resize(visited_len, false);
        }
        for &t in &self.touched {
            self.visited[t as usize] = false;
        }
        self.touched.clear();
    }

    #[inline]
    pub(crate) fn mark_visited(&mut self, slot: usize) {
        if !self.visited[slot] {
            self.visited[slot] = true;
            self.touched.push(slot as u32);
        }
    }
}

/// Read-only search engine over a codebook and a loaded inverted file.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    codebook: Codebook,
    index: InvertedFile,
    /// Coarse ranks per partition the index was built with.
    ranks: usize,
    coarse_norms: Vec<f32>,
    product_norms: Vec<f32>,
    /// `2⟨c, p⟩` for every coarse centroid and every product centroid it
    /// owns; block of `products_per_coarse × product_k` per coarse
    /// centroid.
    cross_terms: Vec<f32>,
    raw_vectors: Option<Vec<f32>>,
}

impl QueryEngine {
    /// Build the engine and run the load-time (query-independent)
    /// precomputation.
    ///
    /// The index must have been built against the same codebook shape;
    /// the retained rank count is inferred from its bucket count.
    pub fn new(codebook: Codebook, index: InvertedFile) -> Result<Self> {
        let config = *codebook.config();
        if index.product_parts() != config.product_parts {
            return Err(IndexError::Config(format!(
                "index stores {} code bytes per vector, codebook expects {}",
                index.product_parts(),
                config.product_parts
            )));
        }
        let ranks = infer_ranks(&config, index.bucket_count())?;

        let kc = config.coarse_k;
        let kp = config.product_k;
        let mc = config.coarse_parts;
        let mp = config.product_parts;
        let ppc = config.products_per_coarse();
        let bsp = config.product_width();

        let mut coarse_norms = vec![0.0f32; mc * kc];
        for part in 0..mc {
            for c in 0..kc {
                coarse_norms[part * kc + c] =
                    simd::squared_norm(codebook.coarse_centroid(part, c));
            }
        }
        let mut product_norms = vec![0.0f32; mp * kp];
        for part in 0..mp {
            for p in 0..kp {
                product_norms[part * kp + p] =
                    simd::squared_norm(codebook.product_centroid(part, p));
            }
        }

        let mut cross_terms = vec![0.0f32; kc * kp * mp];
        for part in 0..mc {
            for c in 0..kc {
                let centroid = codebook.coarse_centroid(part, c);
                let block = (part * kc + c) * ppc * kp;
                for t in 0..ppc {
                    let product_part = part * ppc + t;
                    let coarse_slice = &centroid[t * bsp..(t + 1) * bsp];
                    for p in 0..kp {
                        cross_terms[block + t * kp + p] = 2.0
                            * simd::dot(
                                coarse_slice,
                                codebook.product_centroid(product_part, p),
                            );
                    }
                }
            }
        }

        debug!(
            ranks,
            buckets = index.bucket_count(),
            n = index.len(),
            "query engine ready"
        );
        Ok(Self {
            codebook,
            index,
            ranks,
            coarse_norms,
            product_norms,
            cross_terms,
            raw_vectors: None,
        })
    }

    /// Attach raw vectors for the exact-distance fallback path.
    ///
    /// `raw` is the flat `n × dim` dataset the index was built from,
    /// indexed by original id.
    pub fn with_raw_vectors(mut self, raw: Vec<f32>) -> Result<Self> {
        let dim = self.codebook.config().dim;
        if raw.len() % dim != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: raw.len() % dim,
            });
        }
        let available = raw.len() / dim;
        for b in 0..self.index.bucket_count() {
            if let Some(&id) = self.index.bucket(b).0.iter().max() {
                if id as usize >= available {
                    return Err(IndexError::Config(format!(
                        "index references vector id {id}, only {available} raw vectors supplied"
                    )));
                }
            }
        }
        self.raw_vectors = Some(raw);
        Ok(self)
    }

    /// Shape shared by the codebook and index.
    #[inline]
    pub fn config(&self) -> &PqConfig {
        self.codebook.config()
    }

    /// Coarse ranks per partition the loaded index was built with.
    #[inline]
    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// The loaded inverted file.
    #[inline]
    pub fn index(&self) -> &InvertedFile {
        &self.index
    }

    /// Scratch for [`QueryEngine::search_single`]; the frontier holds the
    /// full coarse centroid list.
    pub fn scratch_single(&self) -> SearchScratch<1> {
        SearchScratch::new(self.config(), self.config().coarse_k, 0)
    }

    /// Scratch for [`QueryEngine::search_multi`].
    ///
    /// The frontier is sized to the `m × m` rank grid: dependency gating
    /// admits every rank combination at most once, so the grid size is the
    /// largest frontier any traversal can produce and inserts never drop.
    pub fn scratch_multi(&self, params: &SearchParams) -> SearchScratch<4> {
        let m = self.clamp_m(params.m);
        SearchScratch::new(self.config(), m * m, m * m)
    }

    /// Scratch for [`QueryEngine::search_ranked2`].
    pub fn scratch_ranked2(&self, params: &SearchParams) -> SearchScratch<4> {
        let m = self.clamp_m(params.m).max(2);
        SearchScratch::new(self.config(), m * m, m * m)
    }

    /// Scratch for [`QueryEngine::search_ranked3`].
    pub fn scratch_ranked3(&self, params: &SearchParams) -> SearchScratch<6> {
        let m = self.clamp_m(params.m);
        SearchScratch::new(self.config(), m * m * m, m * m * m)
    }

    #[inline]
    pub(crate) fn clamp_m(&self, m: usize) -> usize {
        m.clamp(1, self.config().coarse_k)
    }

    /// Per-query precomputation: fill the `−2⟨q, ·⟩` term tables and the
    /// per-partition query norms.
    pub(crate) fn fill_query_terms<const K: usize>(
        &self,
        query: &[f32],
        scratch: &mut SearchScratch<K>,
    ) -> Result<()> {
        let config = self.config();
        if query.len() != config.dim {
            return Err(IndexError::DimensionMismatch {
                expected: config.dim,
                actual: query.len(),
            });
        }
        let kc = config.coarse_k;
        let bsc = config.coarse_width();
        for part in 0..config.coarse_parts {
            let sub = &query[part * bsc..(part + 1) * bsc];
            scratch.part_norms[part] = simd::squared_norm(sub);
            for c in 0..kc {
                scratch.coarse_terms[part * kc + c] = self.coarse_norms[part * kc + c]
                    - 2.0 * simd::dot(sub, self.codebook.coarse_centroid(part, c));
            }
        }
        let kp = config.product_k;
        let bsp = config.product_width();
        for part in 0..config.product_parts {
            let sub = &query[part * bsp..(part + 1) * bsp];
            for p in 0..kp {
                scratch.product_terms[part * kp + p] = self.product_norms[part * kp + p]
                    - 2.0 * simd::dot(sub, self.codebook.product_centroid(part, p));
            }
        }
        Ok(())
    }

    /// Rank one partition's centroids: write `base + term` values into
    /// the partition's block of `scratch.ranked`, then partially select
    /// the `m` smallest and sort them ascending. Ties order by centroid
    /// index so the ranking is deterministic.
    pub(crate) fn rank_partition<const K: usize>(
        &self,
        scratch: &mut SearchScratch<K>,
        part: usize,
        base: f32,
        m: usize,
    ) {
        let kc = self.config().coarse_k;
        let block = &mut scratch.ranked[part * kc..(part + 1) * kc];
        for (c, slot) in block.iter_mut().enumerate() {
            *slot = (base + scratch.coarse_terms[part * kc + c], c as u32);
        }
        let order =
            |a: &(f32, u32), b: &(f32, u32)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        if m < block.len() {
            block.select_nth_unstable_by(m - 1, order);
        }
        block[..m].sort_unstable_by(order);
    }

    /// Score every entry of a recorded candidate bucket, appending to the
    /// scratch result buffers.
    pub(crate) fn score_bucket<const K: usize>(
        &self,
        candidate: &CandidateBucket,
        query: &[f32],
        q_norm: f32,
        exact: bool,
        scratch: &mut SearchScratch<K>,
    ) -> Result<()> {
        let config = self.config();
        let (ids, codes) = self.index.bucket(candidate.bucket as usize);
        scratch.ids.extend_from_slice(ids);

        if exact {
            let raw = self.raw_vectors.as_deref().ok_or_else(|| {
                IndexError::Config(
                    "exact scoring requires raw vectors (attach with with_raw_vectors)"
                        .to_string(),
                )
            })?;
            let dim = config.dim;
            for &id in ids {
                let vector = &raw[id as usize * dim..(id as usize + 1) * dim];
                scratch.dists.push(simd::l2_distance_squared(query, vector));
            }
            return Ok(());
        }

        let kc = config.coarse_k;
        let kp = config.product_k;
        let ppc = config.products_per_coarse();
        let mp = config.product_parts;

        let mut base = q_norm;
        for (part, &digit) in candidate.digits.iter().enumerate() {
            base += scratch.coarse_terms[part * kc + digit as usize];
        }

        for code in codes.chunks_exact(mp) {
            let mut dist = base;
            for (part, &digit) in candidate.digits.iter().enumerate() {
                let block = (part * kc + digit as usize) * ppc * kp;
                for t in 0..ppc {
                    let product_part = part * ppc + t;
                    let c = code[product_part] as usize;
                    dist += scratch.product_terms[product_part * kp + c]
                        + self.cross_terms[block + t * kp + c];
                }
            }
            scratch.dists.push(dist);
        }
        Ok(())
    }

    /// Score all recorded buckets in expansion order, stopping between
    /// buckets once `t` candidates are collected.
    pub(crate) fn score_candidates<const K: usize>(
        &self,
        query: &[f32],
        q_norm: f32,
        params: &SearchParams,
        scratch: &mut SearchScratch<K>,
    ) -> Result<()> {
        let buckets = std::mem::take(&mut scratch.buckets);
        for candidate in &buckets {
            self.score_bucket(candidate, query, q_norm, params.exact, scratch)?;
            if scratch.dists.len() >= params.t {
                break;
            }
        }
        scratch.buckets = buckets;
        Ok(())
    }

    /// Extract the top `r` results from the scratch buffers: partial
    /// selection of the `r` smallest distances, then an ascending sort of
    /// that prefix. Fewer than `r` candidates is a normal outcome; all
    /// of them are returned.
    pub(crate) fn extract_top<const K: usize>(
        scratch: &mut SearchScratch<K>,
        r: usize,
    ) -> Vec<(u32, f32)> {
        let mut pairs: Vec<(u32, f32)> = scratch
            .ids
            .iter()
            .copied()
            .zip(scratch.dists.iter().copied())
            .collect();
        if r == 0 {
            return Vec::new();
        }
        let order = |a: &(u32, f32), b: &(u32, f32)| a.1.total_cmp(&b.1);
        if pairs.len() > r {
            pairs.select_nth_unstable_by(r - 1, order);
            pairs.truncate(r);
        }
        pairs.sort_unstable_by(order);
        pairs
    }
}

fn infer_ranks(config: &PqConfig, bucket_count: usize) -> Result<usize> {
    let kc = config.coarse_k;
    let mc = config.coarse_parts;
    let mut digit_base = 1usize;
    for ranks in 1..=6 {
        digit_base = match digit_base.checked_mul(kc) {
            Some(b) if b < (1 << 31) => b,
            _ => break,
        };
        let mut space = 1usize;
        let mut fits = true;
        for _ in 0..mc {
            space = match space.checked_mul(digit_base) {
                Some(s) if s < (1 << 31) => s,
                _ => {
                    fits = false;
                    break;
                }
            };
        }
        if fits && space == bucket_count {
            return Ok(ranks);
        }
    }
    Err(IndexError::Config(format!(
        "index bucket count {bucket_count} does not match {kc}^({mc}·ranks) for any rank count"
    )))
}
