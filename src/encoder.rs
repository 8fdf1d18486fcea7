//! Vector encoding: coarse assignment, residuals and product codes.
//!
//! Encoding is embarrassingly data-parallel: the input is split into
//! contiguous chunks, one rayon task per chunk, each writing into a
//! disjoint region of the output arrays. Chunk boundaries never affect
//! the result: every vector is encoded independently and the
//! nearest-centroid scan is deterministic (strict `<` keeps the earliest
//! minimum on ties), so encoding the same input twice yields identical
//! codes.

use rayon::prelude::*;
use tracing::debug;

use crate::codebook::Codebook;
use crate::error::{IndexError, Result};
use crate::invfile::InvertedFile;
use crate::radix;
use crate::simd;

/// Quantization codes for a set of vectors.
///
/// Per vector: the original id, `coarse_parts × ranks` coarse digits
/// (`[partition][rank]`, rank 0 nearest) and `product_parts` code bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSet {
    ids: Vec<u32>,
    coarse: Vec<u16>,
    codes: Vec<u8>,
    coarse_parts: usize,
    product_parts: usize,
    ranks: usize,
}

impl EncodedSet {
    /// Number of encoded vectors.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if no vectors are encoded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Coarse ranks retained per partition.
    #[inline]
    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// Original vector ids, in encoding order.
    #[inline]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// All coarse digits of vector `i` (`coarse_parts × ranks`).
    #[inline]
    pub fn coarse_digits(&self, i: usize) -> &[u16] {
        let span = self.coarse_parts * self.ranks;
        &self.coarse[i * span..(i + 1) * span]
    }

    /// One coarse digit.
    #[inline]
    pub fn coarse_digit(&self, i: usize, part: usize, rank: usize) -> u16 {
        self.coarse[(i * self.coarse_parts + part) * self.ranks + rank]
    }

    /// Product code bytes of vector `i`.
    #[inline]
    pub fn product_code(&self, i: usize) -> &[u8] {
        &self.codes[i * self.product_parts..(i + 1) * self.product_parts]
    }

    /// Recover an encoded set from a loaded inverted file.
    ///
    /// Bucket position is the key, so the coarse digits come back out of
    /// the composite id; ids and product codes are copied bucket by
    /// bucket. This is the reload path for [`Encoder::reencode`]: load an
    /// old index, recover the coarse assignments, re-derive product codes
    /// against a reshaped product codebook.
    pub fn from_index(
        index: &InvertedFile,
        coarse_k: usize,
        coarse_parts: usize,
        ranks: usize,
    ) -> Result<Self> {
        let digit_base = radix::bucket_space(coarse_k, ranks)?;
        let expected = radix::bucket_space(digit_base, coarse_parts)?;
        if index.bucket_count() != expected {
            return Err(IndexError::Config(format!(
                "index has {} buckets, {coarse_k}^({coarse_parts}·{ranks}) = {expected} expected",
                index.bucket_count()
            )));
        }

        let n = index.len();
        let mp = index.product_parts();
        let mut ids = Vec::with_capacity(n);
        let mut coarse = Vec::with_capacity(n * coarse_parts * ranks);
        let mut codes = Vec::with_capacity(n * mp);
        for b in 0..index.bucket_count() {
            let (bucket_ids, bucket_codes) = index.bucket(b);
            if bucket_ids.is_empty() {
                continue;
            }
            let wide = radix::decompose_wide(b, digit_base, coarse_parts);
            let mut digits = Vec::with_capacity(coarse_parts * ranks);
            for &w in &wide {
                digits.extend(radix::decompose(w, coarse_k, ranks));
            }
            for _ in bucket_ids {
                coarse.extend_from_slice(&digits);
            }
            ids.extend_from_slice(bucket_ids);
            codes.extend_from_slice(bucket_codes);
        }

        Ok(Self {
            ids,
            coarse,
            codes,
            coarse_parts,
            product_parts: mp,
            ranks,
        })
    }

    /// Number of coarse partitions in this encoding.
    #[inline]
    pub fn coarse_parts(&self) -> usize {
        self.coarse_parts
    }

    /// Number of product partitions in this encoding.
    #[inline]
    pub fn product_parts(&self) -> usize {
        self.product_parts
    }
}

/// Assigns vectors to quantization codes against a fixed codebook.
#[derive(Debug, Clone, Copy)]
pub struct Encoder<'a> {
    codebook: &'a Codebook,
}

impl<'a> Encoder<'a> {
    pub fn new(codebook: &'a Codebook) -> Self {
        Self { codebook }
    }

    /// Encode a flat `n × dim` vector set, retaining the single nearest
    /// coarse centroid per partition.
    pub fn encode(&self, vectors: &[f32]) -> Result<EncodedSet> {
        self.encode_ranked(vectors, 1)
    }

    /// Encode retaining the `ranks` nearest coarse centroids per
    /// partition, ordered by ascending distance.
    ///
    /// The residual quantized by the product stage is always taken from
    /// the rank-0 (nearest) centroid; the extra ranks refine the bucket
    /// identity so the query engine can explore buckets in joint-distance
    /// order.
    pub fn encode_ranked(&self, vectors: &[f32], ranks: usize) -> Result<EncodedSet> {
        let config = *self.codebook.config();
        if vectors.len() % config.dim != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: config.dim,
                actual: vectors.len() % config.dim,
            });
        }
        if ranks == 0 || ranks > config.coarse_k {
            return Err(IndexError::Config(format!(
                "ranks {} must be in 1..={}",
                ranks, config.coarse_k
            )));
        }

        let n = vectors.len() / config.dim;
        let mc = config.coarse_parts;
        let mp = config.product_parts;
        let mut coarse = vec![0u16; n * mc * ranks];
        let mut codes = vec![0u8; n * mp];

        if n > 0 {
            let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
            coarse
                .par_chunks_mut(chunk * mc * ranks)
                .zip(codes.par_chunks_mut(chunk * mp))
                .zip(vectors.par_chunks(chunk * config.dim))
                .for_each(|((coarse_out, codes_out), chunk_vectors)| {
                    self.encode_chunk(chunk_vectors, ranks, coarse_out, codes_out);
                });
        }

        debug!(n, ranks, "encoded vector set");
        Ok(EncodedSet {
            ids: (0..n as u32).collect(),
            coarse,
            codes,
            coarse_parts: mc,
            product_parts: mp,
            ranks,
        })
    }

    /// Re-derive product codes for an already coarse-quantized set.
    ///
    /// Coarse digits are taken from `prior` instead of being recomputed;
    /// used after the product shape changed without re-clustering.
    /// `prior.ids` index into `vectors`.
    pub fn reencode(&self, vectors: &[f32], prior: &EncodedSet) -> Result<EncodedSet> {
        let config = *self.codebook.config();
        if prior.coarse_parts != config.coarse_parts {
            return Err(IndexError::Config(format!(
                "prior encoding has {} coarse partitions, codebook has {}",
                prior.coarse_parts, config.coarse_parts
            )));
        }
        if vectors.len() % config.dim != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: config.dim,
                actual: vectors.len() % config.dim,
            });
        }
        let available = vectors.len() / config.dim;
        if let Some(&id) = prior.ids.iter().max() {
            if id as usize >= available {
                return Err(IndexError::Config(format!(
                    "prior encoding references vector id {id}, only {available} vectors supplied"
                )));
            }
        }

        let n = prior.len();
        let mc = config.coarse_parts;
        let mp = config.product_parts;
        let ranks = prior.ranks;
        let mut codes = vec![0u8; n * mp];

        if n > 0 {
            let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
            codes
                .par_chunks_mut(chunk * mp)
                .zip(prior.ids.par_chunks(chunk))
                .zip(prior.coarse.par_chunks(chunk * mc * ranks))
                .for_each(|((codes_out, ids), coarse_digits)| {
                    self.reencode_chunk(vectors, ids, coarse_digits, ranks, codes_out);
                });
        }

        debug!(n, "re-derived product codes");
        Ok(EncodedSet {
            ids: prior.ids.clone(),
            coarse: prior.coarse.clone(),
            codes,
            coarse_parts: mc,
            product_parts: mp,
            ranks,
        })
    }

    fn encode_chunk(
        &self,
        chunk_vectors: &[f32],
        ranks: usize,
        coarse_out: &mut [u16],
        codes_out: &mut [u8],
    ) {
        let config = self.codebook.config();
        let dim = config.dim;
        let mc = config.coarse_parts;
        let bsc = config.coarse_width();
        let mut residual = vec![0.0f32; dim];
        let mut distances: Vec<(f32, u16)> = Vec::with_capacity(config.coarse_k);

        for (v, vector) in chunk_vectors.chunks_exact(dim).enumerate() {
            let digits = &mut coarse_out[v * mc * ranks..(v + 1) * mc * ranks];
            for part in 0..mc {
                let sub = &vector[part * bsc..(part + 1) * bsc];
                let nearest = if ranks == 1 {
                    let digit = self.nearest_coarse(part, sub);
                    digits[part] = digit;
                    digit
                } else {
                    self.ranked_coarse(part, sub, ranks, &mut distances);
                    for (rank, &(_, digit)) in distances[..ranks].iter().enumerate() {
                        digits[part * ranks + rank] = digit;
                    }
                    distances[0].1
                };
                let centroid = self.codebook.coarse_centroid(part, nearest as usize);
                for (r, (x, c)) in residual[part * bsc..(part + 1) * bsc]
                    .iter_mut()
                    .zip(sub.iter().zip(centroid.iter()))
                {
                    *r = x - c;
                }
            }
            self.product_codes(&residual, &mut codes_out[v * config.product_parts..]);
        }
    }

    fn reencode_chunk(
        &self,
        vectors: &[f32],
        ids: &[u32],
        coarse_digits: &[u16],
        ranks: usize,
        codes_out: &mut [u8],
    ) {
        let config = self.codebook.config();
        let dim = config.dim;
        let mc = config.coarse_parts;
        let bsc = config.coarse_width();
        let mut residual = vec![0.0f32; dim];

        for (v, &id) in ids.iter().enumerate() {
            let vector = &vectors[id as usize * dim..(id as usize + 1) * dim];
            for part in 0..mc {
                let digit = coarse_digits[(v * mc + part) * ranks];
                let centroid = self.codebook.coarse_centroid(part, digit as usize);
                let sub = &vector[part * bsc..(part + 1) * bsc];
                for (r, (x, c)) in residual[part * bsc..(part + 1) * bsc]
                    .iter_mut()
                    .zip(sub.iter().zip(centroid.iter()))
                {
                    *r = x - c;
                }
            }
            self.product_codes(&residual, &mut codes_out[v * config.product_parts..]);
        }
    }

    /// Linear scan over one coarse partition; strict `<` keeps the
    /// earliest minimum.
    fn nearest_coarse(&self, part: usize, sub: &[f32]) -> u16 {
        let config = self.codebook.config();
        let mut best = 0u16;
        let mut best_dist = f32::INFINITY;
        for idx in 0..config.coarse_k {
            let dist = simd::l2_distance_squared(sub, self.codebook.coarse_centroid(part, idx));
            if dist < best_dist {
                best_dist = dist;
                best = idx as u16;
            }
        }
        best
    }

    /// Partial selection of the `ranks` nearest centroids of one
    /// partition, ordered by `(distance, index)` so rank 0 matches the
    /// plain nearest scan even under ties.
    fn ranked_coarse(
        &self,
        part: usize,
        sub: &[f32],
        ranks: usize,
        distances: &mut Vec<(f32, u16)>,
    ) {
        let config = self.codebook.config();
        distances.clear();
        for idx in 0..config.coarse_k {
            let dist = simd::l2_distance_squared(sub, self.codebook.coarse_centroid(part, idx));
            distances.push((dist, idx as u16));
        }
        let order = |a: &(f32, u16), b: &(f32, u16)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        if ranks < distances.len() {
            distances.select_nth_unstable_by(ranks - 1, order);
        }
        distances[..ranks].sort_unstable_by(order);
    }

    /// Quantize a residual: one code byte per product partition.
    fn product_codes(&self, residual: &[f32], codes_out: &mut [u8]) {
        let config = self.codebook.config();
        let bsp = config.product_width();
        for part in 0..config.product_parts {
            let sub = &residual[part * bsp..(part + 1) * bsp];
            let mut best = 0u8;
            let mut best_dist = f32::INFINITY;
            for idx in 0..config.product_k {
                let dist =
                    simd::l2_distance_squared(sub, self.codebook.product_centroid(part, idx));
                if dist < best_dist {
                    best_dist = dist;
                    best = idx as u8;
                }
            }
            codes_out[part] = best;
        }
    }
}
