//! The inverted file: buckets of `(id, product code)` keyed by coarse
//! identity.
//!
//! The bucket array is materialized compactly: a cumulative length array
//! `L` (bucket `i` holds `L[i] - L[i-1]` entries, `L[-1] = 0`), a flat id
//! array and a flat code array, both concatenated bucket by bucket. The
//! bucket's position in the array *is* its key; empty buckets keep their
//! slot.
//!
//! # Index file format
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ i32 non_empty_bucket_count                     │
//! │ i32 N (total vectors)                          │
//! ├────────────────────────────────────────────────┤
//! │ per bucket, ascending composite id:            │
//! │   i32 len                                      │
//! │   len × i32 original ids                       │
//! │   len × product_parts code bytes               │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Little-endian throughout. The bucket count and code width are not in
//! the file; readers supply them from the codebook shape.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use smallvec::SmallVec;
use tracing::debug;

use crate::encoder::EncodedSet;
use crate::error::{IndexError, Result};
use crate::radix;

/// Immutable bucketed index over an encoded vector set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvertedFile {
    cumulative: Vec<u32>,
    ids: Vec<u32>,
    codes: Vec<u8>,
    product_parts: usize,
    non_empty: usize,
}

impl InvertedFile {
    /// Group an encoded set into buckets keyed by the mixed-radix
    /// composite of its coarse digits.
    ///
    /// With `ranks > 1` each partition contributes a refined digit in
    /// radix `coarse_k^ranks`. The bucket space is checked against the
    /// addressable range *before* anything is allocated.
    pub fn build(encoded: &EncodedSet, coarse_k: usize) -> Result<Self> {
        let mc = encoded.coarse_parts();
        let mp = encoded.product_parts();
        let ranks = encoded.ranks();
        let digit_base = radix::bucket_space(coarse_k, ranks)?;
        let bucket_count = radix::bucket_space(digit_base, mc)?;
        let n = encoded.len();

        // Composite bucket id per vector.
        let mut composites = Vec::with_capacity(n);
        for i in 0..n {
            let digits = encoded.coarse_digits(i);
            let wide: SmallVec<[usize; 4]> = (0..mc)
                .map(|part| radix::compose(&digits[part * ranks..(part + 1) * ranks], coarse_k))
                .collect();
            composites.push(radix::compose_wide(&wide, digit_base));
        }

        let mut counts = vec![0u32; bucket_count];
        for &c in &composites {
            counts[c] += 1;
        }
        let non_empty = counts.iter().filter(|&&c| c > 0).count();

        let mut offsets = vec![0u32; bucket_count];
        let mut cumulative = vec![0u32; bucket_count];
        let mut total = 0u32;
        for (b, &count) in counts.iter().enumerate() {
            offsets[b] = total;
            total += count;
            cumulative[b] = total;
        }

        let mut ids = vec![0u32; n];
        let mut codes = vec![0u8; n * mp];
        let mut next = offsets;
        for (i, &c) in composites.iter().enumerate() {
            let pos = next[c] as usize;
            next[c] += 1;
            ids[pos] = encoded.ids()[i];
            codes[pos * mp..(pos + 1) * mp].copy_from_slice(encoded.product_code(i));
        }

        debug!(bucket_count, non_empty, n, "built inverted file");
        Ok(Self {
            cumulative,
            ids,
            codes,
            product_parts: mp,
            non_empty,
        })
    }

    /// Total number of buckets (empty ones included).
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.cumulative.len()
    }

    /// Number of buckets holding at least one vector.
    #[inline]
    pub fn non_empty_buckets(&self) -> usize {
        self.non_empty
    }

    /// Total number of indexed vectors.
    #[inline]
    pub fn len(&self) -> usize {
        self.cumulative.last().map_or(0, |&c| c as usize)
    }

    /// True if no vectors are indexed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Code bytes per vector.
    #[inline]
    pub fn product_parts(&self) -> usize {
        self.product_parts
    }

    /// Length of bucket `b`, uniformly from the cumulative array.
    #[inline]
    pub fn bucket_len(&self, b: usize) -> usize {
        let start = if b > 0 { self.cumulative[b - 1] } else { 0 };
        (self.cumulative[b] - start) as usize
    }

    /// Ids and code bytes of bucket `b`, in insertion order.
    #[inline]
    pub fn bucket(&self, b: usize) -> (&[u32], &[u8]) {
        let start = if b > 0 { self.cumulative[b - 1] as usize } else { 0 };
        let end = self.cumulative[b] as usize;
        (
            &self.ids[start..end],
            &self.codes[start * self.product_parts..end * self.product_parts],
        )
    }

    /// Entropy of the bucket-size distribution,
    /// `Σ_{l > 0} log2(N/l) / (N/l)`.
    ///
    /// A load-imbalance diagnostic: lower means more skew, the maximum is
    /// `log2(non_empty)` for perfectly even buckets.
    pub fn entropy(&self) -> f64 {
        let n = self.len() as f64;
        let mut e = 0.0;
        for b in 0..self.bucket_count() {
            let l = self.bucket_len(b);
            if l > 0 {
                let x = n / l as f64;
                e += x.log2() / x;
            }
        }
        e
    }

    /// Persist to a single index file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| IndexError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let io = |e| IndexError::io(path, e);

        writer
            .write_all(&(self.non_empty as i32).to_le_bytes())
            .map_err(io)?;
        writer
            .write_all(&(self.len() as i32).to_le_bytes())
            .map_err(io)?;
        for b in 0..self.bucket_count() {
            let (ids, codes) = self.bucket(b);
            writer
                .write_all(&(ids.len() as i32).to_le_bytes())
                .map_err(io)?;
            for &id in ids {
                writer.write_all(&id.to_le_bytes()).map_err(io)?;
            }
            writer.write_all(codes).map_err(io)?;
        }
        writer.flush().map_err(io)?;
        debug!(path = %path.display(), buckets = self.bucket_count(), n = self.len(),
               "wrote index file");
        Ok(())
    }

    /// Load an index file. `bucket_count` and `product_parts` come from
    /// the codebook shape the file was built against.
    pub fn read_from(path: &Path, bucket_count: usize, product_parts: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let mismatch = |reason: String| IndexError::DataMismatch {
            path: path.display().to_string(),
            reason,
        };

        let non_empty = read_i32(&mut reader, path)?;
        let n = read_i32(&mut reader, path)?;
        if non_empty < 0 || n < 0 {
            return Err(mismatch(format!(
                "negative header fields (non_empty={non_empty}, n={n})"
            )));
        }
        let n = n as usize;

        let mut cumulative = Vec::with_capacity(bucket_count);
        let mut ids = Vec::with_capacity(n);
        let mut codes = Vec::with_capacity(n * product_parts);
        let mut total = 0u64;
        let mut seen_non_empty = 0usize;
        for b in 0..bucket_count {
            let len = read_i32(&mut reader, path)?;
            if len < 0 {
                return Err(mismatch(format!("bucket {b} has negative length {len}")));
            }
            let len = len as usize;
            total += len as u64;
            if total > n as u64 {
                return Err(mismatch(format!(
                    "bucket lengths exceed the declared vector count {n}"
                )));
            }
            if len > 0 {
                seen_non_empty += 1;
            }
            cumulative.push(total as u32);

            for _ in 0..len {
                ids.push(read_i32(&mut reader, path)? as u32);
            }
            let code_base = codes.len();
            codes.resize(code_base + len * product_parts, 0);
            reader.read_exact(&mut codes[code_base..]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    mismatch(format!(
                        "bucket {b}: code section shorter than len × product_parts = {}",
                        len * product_parts
                    ))
                } else {
                    IndexError::io(path, e)
                }
            })?;
        }

        if total != n as u64 {
            return Err(mismatch(format!(
                "bucket lengths sum to {total}, header declares {n}"
            )));
        }
        if seen_non_empty != non_empty as usize {
            return Err(mismatch(format!(
                "{seen_non_empty} non-empty buckets found, header declares {non_empty}"
            )));
        }

        debug!(path = %path.display(), bucket_count, n, "loaded index file");
        Ok(Self {
            cumulative,
            ids,
            codes,
            product_parts,
            non_empty: seen_non_empty,
        })
    }
}

fn read_i32(reader: &mut impl Read, path: &Path) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::DataMismatch {
                path: path.display().to_string(),
                reason: "unexpected end of file".to_string(),
            }
        } else {
            IndexError::io(path, e)
        }
    })?;
    Ok(i32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::Codebook;
    use crate::config::PqConfig;
    use crate::encoder::Encoder;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build_random(
        n: usize,
        config: PqConfig,
        ranks: usize,
        seed: u64,
    ) -> (InvertedFile, EncodedSet) {
        let mut rng = StdRng::seed_from_u64(seed);
        let coarse: Vec<f32> = (0..config.coarse_k * config.dim)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let product: Vec<f32> = (0..config.product_k * config.dim)
            .map(|_| rng.gen_range(-0.25..0.25))
            .collect();
        let codebook = Codebook::from_parts(config, coarse, product).unwrap();
        let vectors: Vec<f32> = (0..n * config.dim)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let encoded = Encoder::new(&codebook)
            .encode_ranked(&vectors, ranks)
            .unwrap();
        let index = InvertedFile::build(&encoded, config.coarse_k).unwrap();
        (index, encoded)
    }

    #[test]
    fn buckets_partition_the_id_space() {
        let config = PqConfig::new(8, 5, 2, 4, 4).unwrap();
        let (index, _) = build_random(200, config, 1, 11);
        assert_eq!(index.bucket_count(), 25);
        assert_eq!(index.len(), 200);

        let mut seen = Vec::new();
        let mut total = 0;
        for b in 0..index.bucket_count() {
            total += index.bucket_len(b);
            seen.extend_from_slice(index.bucket(b).0);
        }
        assert_eq!(total, 200);
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<u32>>());
    }

    #[test]
    fn cumulative_lengths_are_monotone() {
        let config = PqConfig::new(8, 5, 2, 4, 4).unwrap();
        let (index, _) = build_random(123, config, 1, 12);
        for b in 1..index.bucket_count() {
            assert!(index.cumulative[b] >= index.cumulative[b - 1]);
        }
        assert_eq!(*index.cumulative.last().unwrap() as usize, 123);
    }

    #[test]
    fn bucket_key_matches_coarse_digits() {
        let config = PqConfig::new(8, 5, 2, 4, 4).unwrap();
        let (index, encoded) = build_random(150, config, 1, 13);
        for i in 0..encoded.len() {
            let b = radix::compose(encoded.coarse_digits(i), 5);
            let (ids, _) = index.bucket(b);
            assert!(ids.contains(&(i as u32)));
        }
    }

    #[test]
    fn bucket_codes_travel_with_ids() {
        let config = PqConfig::new(8, 4, 1, 4, 4).unwrap();
        let (index, encoded) = build_random(80, config, 1, 14);
        for b in 0..index.bucket_count() {
            let (ids, codes) = index.bucket(b);
            for (slot, &id) in ids.iter().enumerate() {
                assert_eq!(&codes[slot * 4..(slot + 1) * 4], encoded.product_code(id as usize));
            }
        }
    }

    #[test]
    fn ranked_build_uses_refined_bucket_space() {
        let config = PqConfig::new(4, 3, 1, 2, 2).unwrap();
        let (index, encoded) = build_random(60, config, 2, 15);
        // One partition, two ranks: 3^2 buckets.
        assert_eq!(index.bucket_count(), 9);
        for i in 0..encoded.len() {
            let digits = encoded.coarse_digits(i);
            let b = digits[0] as usize * 3 + digits[1] as usize;
            assert!(index.bucket(b).0.contains(&(i as u32)));
        }
    }

    #[test]
    fn refined_bucket_space_overflow_is_fatal() {
        // 46^6 buckets would overflow the 31-bit range; detected before
        // any allocation.
        let config = PqConfig::new(2, 46, 1, 2, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(16);
        let coarse: Vec<f32> = (0..46 * 2).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let product: Vec<f32> = (0..2 * 2).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let codebook = Codebook::from_parts(config, coarse, product).unwrap();
        let encoded = Encoder::new(&codebook)
            .encode_ranked(&[0.5, -0.5], 6)
            .unwrap();
        assert!(matches!(
            InvertedFile::build(&encoded, 46),
            Err(IndexError::BucketOverflow { .. })
        ));
    }

    #[test]
    fn entropy_of_even_split() {
        let index = InvertedFile {
            cumulative: vec![2, 4, 4],
            ids: vec![0, 1, 2, 3],
            codes: vec![0; 4],
            product_parts: 1,
            non_empty: 2,
        };
        // Two buckets of 2 out of N=4: 2 × log2(2)/2 = 1.0.
        assert!((index.entropy() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn file_round_trip_is_bit_exact() {
        let config = PqConfig::new(8, 5, 2, 4, 4).unwrap();
        let (index, _) = build_random(173, config, 1, 17);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.edat");
        index.write_to(&path).unwrap();
        let loaded = InvertedFile::read_from(&path, index.bucket_count(), 4).unwrap();
        assert_eq!(loaded, index);

        // Writing the loaded copy reproduces the same bytes.
        let path2 = dir.path().join("index2.edat");
        loaded.write_to(&path2).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&path2).unwrap());
    }

    #[test]
    fn truncated_index_file_is_a_data_mismatch() {
        let config = PqConfig::new(8, 4, 1, 4, 4).unwrap();
        let (index, _) = build_random(40, config, 1, 18);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.edat");
        index.write_to(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            InvertedFile::read_from(&path, index.bucket_count(), 4),
            Err(IndexError::DataMismatch { .. })
        ));
    }

    #[test]
    fn inconsistent_header_is_a_data_mismatch() {
        let config = PqConfig::new(8, 4, 1, 4, 4).unwrap();
        let (index, _) = build_random(40, config, 1, 19);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.edat");
        index.write_to(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        // Claim one more vector than the buckets hold.
        bytes[4..8].copy_from_slice(&41i32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            InvertedFile::read_from(&path, index.bucket_count(), 4),
            Err(IndexError::DataMismatch { .. })
        ));
    }
}
