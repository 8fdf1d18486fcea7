//! Two-partition multi-sequence search (Multi-D-ADC).
//!
//! Each coarse partition contributes an independently ranked centroid
//! list; buckets live at the cartesian product of the two lists. The
//! frontier expands rank combinations in ascending joint distance, and a
//! combination enters the frontier only once both of its predecessors
//! (one rank lower in either dimension) have been expanded, or the
//! other dimension sits at rank 0. That gating keeps the frontier small
//! and guarantees pops come out in non-decreasing joint key order
//! without duplicate expansion.

use smallvec::smallvec;

use crate::config::SearchParams;
use crate::error::{IndexError, Result};

use super::{CandidateBucket, QueryEngine, SearchScratch};

impl QueryEngine {
    /// Top-R search over a two-partition, single-rank index (mc = 2).
    ///
    /// `params.m` bounds the ranked list per partition; the traversal
    /// expands at most `params.w` rank combinations.
    pub fn search_multi(
        &self,
        query: &[f32],
        params: &SearchParams,
        scratch: &mut SearchScratch<4>,
    ) -> Result<Vec<(u32, f32)>> {
        let config = self.config();
        if config.coarse_parts != 2 || self.ranks() != 1 {
            return Err(IndexError::Config(format!(
                "search_multi requires coarse_parts = 2 and a single-rank index \
                 (got coarse_parts = {}, ranks = {})",
                config.coarse_parts,
                self.ranks()
            )));
        }

        let m = self.clamp_m(params.m);
        let kc = config.coarse_k;
        scratch.begin_query(m * m);
        self.fill_query_terms(query, scratch)?;
        let q_norm: f32 = scratch.part_norms.iter().sum();

        // Rank each partition against its share of the query.
        for part in 0..2 {
            let base = scratch.part_norms[part];
            self.rank_partition(scratch, part, base, m);
        }

        // Seed with the best centroid in both partitions.
        let first = &scratch.ranked[..kc];
        let second = &scratch.ranked[kc..2 * kc];
        scratch.frontier.push(
            first[0].0 + second[0].0,
            [0, 0, first[0].1, second[0].1],
        );

        let mut sum = 0usize;
        while scratch.expanded < params.w && sum < params.t {
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
                    digits: smallvec![c1 as u16, c2 as u16],
                });
            } else {
                scratch.empty_visits += 1;
            }
            let slot = h1 as usize * m + h2 as usize;
            scratch.mark_visited(slot);

            if sum >= params.t {
                break;
            }
            let (h1, h2) = (h1 as usize, h2 as usize);
            // Advance the first dimension: predecessor (h1+1, h2-1) must
            // already be expanded unless the second dimension is at rank 0.
            if h1 + 1 < m && (h2 == 0 || scratch.visited[(h1 + 1) * m + h2 - 1]) {
                let a = scratch.ranked[h1 + 1];
                let b = scratch.ranked[kc + h2];
                scratch.frontier.push(
                    a.0 + b.0,
                    [(h1 + 1) as u32, h2 as u32, a.1, b.1],
                );
            }
            // Advance the second dimension, mirrored.
            if h2 + 1 < m && (h1 == 0 || scratch.visited[(h1 - 1) * m + h2 + 1]) {
                let a = scratch.ranked[h1];
                let b = scratch.ranked[kc + h2 + 1];
                scratch.frontier.push(
                    a.0 + b.0,
                    [h1 as u32, (h2 + 1) as u32, a.1, b.1],
                );
            }
        }

        self.score_candidates(query, q_norm, params, scratch)?;
        let top = Self::extract_top(scratch, params.r);

        // Incremental reset so the visited buffer is clean for the next
        // query sharing this scratch.
        for &t in &scratch.touched {
            scratch.visited[t as usize] = false;
        }
        scratch.touched.clear();
        Ok(top)
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

    fn engine_with_vectors(
        config: PqConfig,
        n: usize,
        seed: u64,
    ) -> (QueryEngine, Vec<f32>) {
        let codebook = random_codebook(config, seed);
        let vectors = random_vectors(n, config.dim, seed + 1);
        let encoded = Encoder::new(&codebook).encode(&vectors).unwrap();
        let index = InvertedFile::build(&encoded, config.coarse_k).unwrap();
        let engine = QueryEngine::new(codebook, index)
            .unwrap()
            .with_raw_vectors(vectors.clone())
            .unwrap();
        (engine, vectors)
    }

    #[test]
    fn frontier_pops_in_joint_key_order() {
        let config = PqConfig::new(8, 6, 2, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 300, 101);
        let params = SearchParams::new(10, 36, usize::MAX).with_ranked_len(6);
        let mut scratch = engine.scratch_multi(&params);
        let query = &vectors[..8];
        engine.search_multi(query, &params, &mut scratch).unwrap();
        let scores: Vec<f32> = scratch.candidates().iter().map(|c| c.score).collect();
        assert!(!scores.is_empty());
        assert!(scores.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn full_budget_exact_matches_brute_force() {
        let config = PqConfig::new(8, 4, 2, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 150, 111);
        // Expand the whole 4×4 rank grid and score everything exactly.
        let params = SearchParams::new(5, 16, usize::MAX)
            .with_ranked_len(4)
            .with_exact(true);
        let mut scratch = engine.scratch_multi(&params);
        let query = random_vectors(1, 8, 112);

        let got: Vec<u32> = engine
            .search_multi(&query, &params, &mut scratch)
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
    fn stored_vector_is_its_own_nearest_neighbor() {
        let config = PqConfig::new(8, 4, 2, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 100, 121);
        let params = SearchParams::new(3, 16, usize::MAX).with_ranked_len(4);
        let mut scratch = engine.scratch_multi(&params);
        for probe in [0usize, 42, 99] {
            let query = &vectors[probe * 8..(probe + 1) * 8];
            let top = engine.search_multi(query, &params, &mut scratch).unwrap();
            assert!(top.iter().any(|&(id, _)| id == probe as u32));
        }
    }

    #[test]
    fn visited_flags_are_reset_between_queries() {
        let config = PqConfig::new(8, 5, 2, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 200, 131);
        let params = SearchParams::new(4, 10, usize::MAX).with_ranked_len(5);
        let mut scratch = engine.scratch_multi(&params);
        for probe in 0..5 {
            let query = &vectors[probe * 8..(probe + 1) * 8];
            engine.search_multi(query, &params, &mut scratch).unwrap();
            assert!(scratch.visited.iter().all(|&v| !v));
            assert!(scratch.touched.is_empty());
        }
    }

    #[test]
    fn narrow_beam_shrinks_but_never_breaks() {
        let config = PqConfig::new(8, 6, 2, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 250, 141);
        let params = SearchParams::new(10, 3, usize::MAX).with_ranked_len(6);
        let mut scratch = engine.scratch_multi(&params);
        let query = &vectors[..8];
        let top = engine.search_multi(query, &params, &mut scratch).unwrap();
        assert!(top.len() <= 10);
        assert!(scratch.diagnostics().expanded <= 3);
        for pair in top.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn rejects_single_partition_engines() {
        let config = PqConfig::new(8, 4, 1, 4, 4).unwrap();
        let (engine, vectors) = engine_with_vectors(config, 20, 151);
        let params = SearchParams::new(3, 4, 10);
        let mut scratch = engine.scratch_multi(&params);
        assert!(engine
            .search_multi(&vectors[..8], &params, &mut scratch)
            .is_err());
    }
}
