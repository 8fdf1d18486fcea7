//! Classical IVFADC search: one coarse partition, single-rank buckets.
//!
//! With a single partition there is no cartesian product to traverse:
//! the frontier degenerates to a best-first walk over the coarse
//! centroid list, so every centroid is inserted up front and buckets pop
//! in query-distance order directly.

use smallvec::smallvec;

use crate::config::SearchParams;
use crate::error::{IndexError, Result};

use super::{CandidateBucket, QueryEngine, SearchScratch};

impl QueryEngine {
    /// Top-R search over a single-partition, single-rank index (mc = 1).
    ///
    /// Returns `(id, squared distance)` pairs ascending by distance;
    /// fewer than `r` results is a normal outcome when the visited
    /// buckets held fewer candidates.
    pub fn search_single(
        &self,
        query: &[f32],
        params: &SearchParams,
        scratch: &mut SearchScratch<1>,
    ) -> Result<Vec<(u32, f32)>> {
        let config = self.config();
        if config.coarse_parts != 1 || self.ranks() != 1 {
            return Err(IndexError::Config(format!(
                "search_single requires coarse_parts = 1 and a single-rank index \
                 (got coarse_parts = {}, ranks = {})",
                config.coarse_parts,
                self.ranks()
            )));
        }

        scratch.begin_query(0);
        self.fill_query_terms(query, scratch)?;
        let q_norm = scratch.part_norms[0];

        // Seed the walk with every coarse centroid; the heap then yields
        // buckets in ascending approximate distance.
        for c in 0..config.coarse_k {
            let score = q_norm + scratch.coarse_terms[c];
            scratch.frontier.push(score, [c as u32]);
        }

        let mut sum = 0usize;
        while scratch.expanded < params.w && sum < params.t {
            let Some((score, [bucket])) = scratch.frontier.pop() else {
                break;
            };
            scratch.expanded += 1;
            let len = self.index().bucket_len(bucket as usize);
            if len == 0 {
                scratch.empty_visits += 1;
                continue;
            }
            sum += len;
            scratch.buckets.push(CandidateBucket {
                bucket,
                score,
                digits: smallvec![bucket as u16],
            });
        }

        self.score_candidates(query, q_norm, params, scratch)?;
        Ok(Self::extract_top(scratch, params.r))
    }
}
