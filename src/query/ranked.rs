//! Multi-rank search over a single coarse partition (nc = 2, 3).
//!
//! Buckets are keyed by the 2 or 3 nearest coarse centroids of each
//! stored vector, so one real partition behaves like nc virtual
//! partitions, all ranked from the same centroid list. The traversal is
//! the same dependency-gated frontier as the two-partition case: each
//! dimension advances independently and a combination is admitted once
//! every predecessor is expanded. Scoring uses the rank-0 centroid only,
//! since that is the residual the product codes were quantized against.

use smallvec::smallvec;

use crate::config::SearchParams;
use crate::error::{IndexError, Result};

use super::{CandidateBucket, QueryEngine, SearchScratch};

impl QueryEngine {
    /// Top-R search over a two-rank index (mc = 1, nc = 2).
    ///
    /// `params.w` bounds the number of *non-empty* buckets collected; the
    /// rank grid is sparse (a vector's first and second assignment always
    /// differ), so empty expansions are expected and not budgeted.
    pub fn search_ranked2(
        &self,
        query: &[f32],
        params: &SearchParams,
        scratch: &mut SearchScratch<4>,
    ) -> Result<Vec<(u32, f32)>> {
        let config = self.config();
        if config.coarse_parts != 1 || self.ranks() != 2 {
            return Err(IndexError::Config(format!(
                "search_ranked2 requires coarse_parts = 1 and a two-rank index \
                 (got coarse_parts = {}, ranks = {})",
                config.coarse_parts,
                self.ranks()
            )));
        }
        if config.coarse_k < 2 {
            return Err(IndexError::Config(
                "search_ranked2 requires at least 2 coarse centroids".to_string(),
            ));
        }

        let m = self.clamp_m(params.m).max(2);
        let kc = config.coarse_k;
        scratch.begin_query(m * m);
        self.fill_query_terms(query, scratch)?;
        let q_norm = scratch.part_norms[0];

        self.rank_partition(scratch, 0, q_norm, m);

        // The diagonal is always empty (first and second assignment
        // differ), so the walk starts from both off-diagonal corners.
        let (v0, v1) = (scratch.ranked[0], scratch.ranked[1]);
        scratch.frontier.push(v0.0 + v1.0, [0, 1, v0.1, v1.1]);
        scratch.frontier.push(v0.0 + v1.0, [1, 0, v1.1, v0.1]);

        let mut sum = 0usize;
        while scratch.buckets.len() < params.w && sum < params.t {
            let Some((score, [h1, h2, c1, c2])) = scratch.frontier.pop() else {
                break;
            };
            scratch.expanded += 1;
            let bucket = c1 as usize * kc + c2 as usize;
            let len = self.index().bucket_len(bucket);
            if len > 0 {
                sum += len;
                scratch.buckets.push(CandidateBucket {
                    bucket: bucket as u32,
                    score,
                    digits: smallvec![c1 as u16],
                });
            } else {
                scratch.empty_visits += 1;
            }
            scratch.mark_visited(h1 as usize * m + h2 as usize);

            if sum >= params.t {
                break;
            }
            let (h1, h2) = (h1 as usize, h2 as usize);
            if h1 + 1 < m && (h2 == 0 || scratch.visited[(h1 + 1) * m + h2 - 1]) {
                let a = scratch.ranked[h1 + 1];
                let b = scratch.ranked[h2];
                scratch
                    .frontier
                    .push(a.0 + b.0, [(h1 + 1) as u32, h2 as u32, a.1, b.1]);
            }
            if h2 + 1 < m && (h1 == 0 || scratch.visited[(h1 - 1) * m + h2 + 1]) {
                let a = scratch.ranked[h1];
                let b = scratch.ranked[h2 + 1];
                scratch
                    .frontier
                    .push(a.0 + b.0, [h1 as u32, (h2 + 1) as u32, a.1, b.1]);
            }
        }

        self.score_candidates(query, q_norm, params, scratch)?;
        let top = Self::extract_top(scratch, params.r);
        for &t in &scratch.touched {
            scratch.visited[t as usize] = false;
        }
        scratch.touched.clear();
        Ok(top)
    }

    /// Top-R search over a three-rank index (mc = 1, nc = 3).
    ///
    /// Expansion additionally stops once the whole `m³` rank space has
    /// been visited.
    pub fn search_ranked3(
        &self,
        query: &[f32],
        params: &SearchParams,
        scratch: &mut SearchScratch<6>,
    ) -> Result<Vec<(u32, f32)>> {
        let config = self.config();
        if config.coarse_parts != 1 || self.ranks() != 3 {
            return Err(IndexError::Config(format!(
                "search_ranked3 requires coarse_parts = 1 and a three-rank index \
                 (got coarse_parts = {}, ranks = {})",
                config.coarse_parts,
                self.ranks()
            )));
        }

        let m = self.clamp_m(params.m);
        let kc = config.coarse_k;
        let space = m * m * m;
        scratch.begin_query(space);
        self.fill_query_terms(query, scratch)?;
        let q_norm = scratch.part_norms[0];

        self.rank_partition(scratch, 0, q_norm, m);

        let v0 = scratch.ranked[0];
        scratch
            .frontier
            .push(3.0 * v0.0, [0, 0, 0, v0.1, v0.1, v0.1]);

        let mut sum = 0usize;
        while scratch.buckets.len() < params.w && sum < params.t && scratch.touched.len() < space
        {
            let Some((score, [h1, h2, h3, c1, c2, c3])) = scratch.frontier.pop() else {
                break;
            };
            scratch.expanded += 1;
            let bucket = (c1 as usize * kc + c2 as usize) * kc + c3 as usize;
            let len = self.index().bucket_len(bucket);
            if len > 0 {
                sum += len;
                scratch.buckets.push(CandidateBucket {
                    bucket: bucket as u32,
                    score,
                    digits: smallvec![c1 as u16],
                });
            } else {
                scratch.empty_visits += 1;
            }
            let (h1, h2, h3) = (h1 as usize, h2 as usize, h3 as usize);
            scratch.mark_visited((h1 * m + h2) * m + h3);

            if sum >= params.t {
                break;
            }
            // Each advance needs both cross-dimension predecessors
            // expanded (or the respective dimension at rank 0).
            if h1 + 1 < m
                && (h2 == 0 || scratch.visited[((h1 + 1) * m + h2 - 1) * m + h3])
                && (h3 == 0 || scratch.visited[((h1 + 1) * m + h2) * m + h3 - 1])
            {
                self.push_ranked3(scratch, [h1 + 1, h2, h3]);
            }
            if h2 + 1 < m
                && (h3 == 0 || scratch.visited[(h1 * m + h2 + 1) * m + h3 - 1])
                && (h1 == 0 || scratch.visited[((h1 - 1) * m + h2 + 1) * m + h3])
            {
                self.push_ranked3(scratch, [h1, h2 + 1, h3]);
            }
            if h3 + 1 < m
                && (h2 == 0 || scratch.visited[(h1 * m + h2 - 1) * m + h3 + 1])
                && (h1 == 0 || scratch.visited[((h1 - 1) * m + h2) * m + h3 + 1])
            {
                self.push_ranked3(scratch, [h1, h2, h3 + 1]);
            }
        }

        self.score_candidates(query, q_norm, params, scratch)?;
        let top = Self::extract_top(scratch, params.r);
        for &t in &scratch.touched {
            scratch.visited[t as usize] = false;
        }
        scratch.touched.clear();
        Ok(top)
    }

    fn push_ranked3(&self, scratch: &mut SearchScratch<6>, ranks: [usize; 3]) {
        let [h1, h2, h3] = ranks;
        let (a, b, c) = (
            scratch.ranked[h1],
            scratch.ranked[h2],
            scratch.ranked[h3],
        );
        scratch.frontier.push(
            a.0 + b.0 + c.0,
            [h1 as u32, h2 as u32, h3 as u32, a.1, b.1, c.1],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{random_codebook, random_vectors};
    use super::*;
    use crate::config::PqConfig;
    use crate::encoder::Encoder;
    use crate::invfile::InvertedFile;
    use crate::simd;

    fn ranked_engine(
        config: PqConfig,
        n: usize,
        ranks: usize,
        seed: u64,
    ) -> (QueryEngine, Vec<f32>) {
        let codebook = random_codebook(config, seed);
        let vectors = random_vectors(n, config.dim, seed + 1);
        let encoded = Encoder::new(&codebook)
            .encode_ranked(&vectors, ranks)
            .unwrap();
        let index = InvertedFile::build(&encoded, config.coarse_k).unwrap();
        let engine = QueryEngine::new(codebook, index)
            .unwrap()
            .with_raw_vectors(vectors.clone())
            .unwrap();
        (engine, vectors)
    }

    #[test]
    fn two_rank_finds_stored_vectors() {
        let config = PqConfig::new(8, 5, 1, 4, 4).unwrap();
        let (engine, vectors) = ranked_engine(config, 150, 2, 161);
        let params = SearchParams::new(3, 25, usize::MAX)
            .with_ranked_len(5)
            .with_exact(true);
        let mut scratch = engine.scratch_ranked2(&params);
        for probe in [0usize, 77, 149] {
            let query = &vectors[probe * 8..(probe + 1) * 8];
            let top = engine.search_ranked2(query, &params, &mut scratch).unwrap();
            assert_eq!(top[0].0, probe as u32, "probe {probe} not at rank 0");
        }
    }

    #[test]
    fn two_rank_full_budget_exact_matches_brute_force() {
        let config = PqConfig::new(8, 4, 1, 4, 4).unwrap();
        let (engine, vectors) = ranked_engine(config, 120, 2, 171);
        let params = SearchParams::new(5, 16, usize::MAX)
            .with_ranked_len(4)
            .with_exact(true);
        let mut scratch = engine.scratch_ranked2(&params);
        let query = random_vectors(1, 8, 172);
        let got: Vec<u32> = engine
            .search_ranked2(&query, &params, &mut scratch)
            .unwrap()
            .iter()
            .map(|&(id, _)| id)
            .collect();

        let mut pairs: Vec<(u32, f32)> = vectors
            .chunks_exact(8)
            .enumerate()
            .map(|(i, v)| (i as u32, simd::l2_distance_squared(&query, v)))
            .collect();
        pairs.sort_by(|a, b| a.1.total_cmp(&b.1));
        let expected: Vec<u32> = pairs.into_iter().take(5).map(|(id, _)| id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn two_rank_pops_stay_monotone() {
        let config = PqConfig::new(8, 6, 1, 4, 4).unwrap();
        let (engine, vectors) = ranked_engine(config, 250, 2, 181);
        let params = SearchParams::new(10, 20, usize::MAX).with_ranked_len(6);
        let mut scratch = engine.scratch_ranked2(&params);
        engine
            .search_ranked2(&vectors[..8], &params, &mut scratch)
            .unwrap();
        let scores: Vec<f32> = scratch.candidates().iter().map(|c| c.score).collect();
        assert!(scores.windows(2).all(|w| w[0] <= w[1]));
        // The sparse grid produces empty expansions; they are counted,
        // not treated as candidates.
        assert!(scratch.diagnostics().empty_visits > 0);
    }

    #[test]
    fn three_rank_finds_stored_vectors() {
        let config = PqConfig::new(8, 5, 1, 4, 4).unwrap();
        let (engine, vectors) = ranked_engine(config, 100, 3, 191);
        let params = SearchParams::new(3, 60, usize::MAX)
            .with_ranked_len(5)
            .with_exact(true);
        let mut scratch = engine.scratch_ranked3(&params);
        for probe in [0usize, 50, 99] {
            let query = &vectors[probe * 8..(probe + 1) * 8];
            let top = engine.search_ranked3(query, &params, &mut scratch).unwrap();
            assert_eq!(top[0].0, probe as u32, "probe {probe} not at rank 0");
        }
    }

    #[test]
    fn three_rank_terminates_on_exhausted_rank_space() {
        let config = PqConfig::new(8, 3, 1, 4, 4).unwrap();
        let (engine, _) = ranked_engine(config, 30, 3, 201);
        // w and T far beyond what 27 buckets can supply: the visited-space
        // bound must end the walk.
        let params = SearchParams::new(5, 10_000, usize::MAX).with_ranked_len(3);
        let mut scratch = engine.scratch_ranked3(&params);
        let query = random_vectors(1, 8, 202);
        let top = engine.search_ranked3(&query, &params, &mut scratch).unwrap();
        assert!(top.len() <= 5);
        assert!(scratch.diagnostics().expanded <= 27);
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let config = PqConfig::new(8, 5, 1, 4, 4).unwrap();
        let (engine, vectors) = ranked_engine(config, 40, 2, 211);
        let params = SearchParams::new(3, 10, 100);
        let mut scratch3 = engine.scratch_ranked3(&params);
        assert!(engine
            .search_ranked3(&vectors[..8], &params, &mut scratch3)
            .is_err());
    }
}
