//! Index shape and search-time parameters.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::radix;

/// Shape of a coarse + product quantizer pair.
///
/// The coarse quantizer splits a vector into `coarse_parts` sub-vectors and
/// assigns each to one of `coarse_k` centroids; the product quantizer does
/// the same on the residual with `product_parts` × `product_k`. Product
/// codes are stored one byte per sub-vector, so `product_k` is capped at
/// 256; the inverted file is addressed by `coarse_k^coarse_parts`, which
/// must stay inside a 31-bit signed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqConfig {
    /// Vector dimensionality.
    pub dim: usize,
    /// Centroids per coarse partition (kc).
    pub coarse_k: usize,
    /// Number of coarse partitions (mc).
    pub coarse_parts: usize,
    /// Centroids per product partition (kp).
    pub product_k: usize,
    /// Number of product partitions (mp).
    pub product_parts: usize,
}

impl PqConfig {
    /// Validate a shape, reporting the offending parameter before any
    /// allocation happens.
    pub fn new(
        dim: usize,
        coarse_k: usize,
        coarse_parts: usize,
        product_k: usize,
        product_parts: usize,
    ) -> Result<Self> {
        let config = Self {
            dim,
            coarse_k,
            coarse_parts,
            product_k,
            product_parts,
        };
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(IndexError::Config("dim must be greater than 0".to_string()));
        }
        if self.coarse_parts == 0 || self.product_parts == 0 {
            return Err(IndexError::Config(
                "partition counts must be greater than 0".to_string(),
            ));
        }
        if self.coarse_k == 0 || self.product_k == 0 {
            return Err(IndexError::Config(
                "centroid counts must be greater than 0".to_string(),
            ));
        }
        if self.dim % self.coarse_parts != 0 {
            return Err(IndexError::Config(format!(
                "dim {} is not divisible by coarse_parts {}",
                self.dim, self.coarse_parts
            )));
        }
        if self.dim % self.product_parts != 0 {
            return Err(IndexError::Config(format!(
                "dim {} is not divisible by product_parts {}",
                self.dim, self.product_parts
            )));
        }
        if self.product_parts % self.coarse_parts != 0 {
            return Err(IndexError::Config(format!(
                "product_parts {} is not divisible by coarse_parts {} \
                 (each coarse partition must own a whole number of product partitions)",
                self.product_parts, self.coarse_parts
            )));
        }
        if self.product_k > 256 {
            return Err(IndexError::Config(format!(
                "product_k {} exceeds 256 (codes are stored as single bytes)",
                self.product_k
            )));
        }
        if self.product_parts > 16 {
            return Err(IndexError::Config(format!(
                "product_parts {} exceeds 16",
                self.product_parts
            )));
        }
        if self.coarse_k > 1 << 16 {
            return Err(IndexError::Config(format!(
                "coarse_k {} exceeds 65536 (coarse digits are stored as u16)",
                self.coarse_k
            )));
        }
        // Fails when coarse_k^coarse_parts leaves the 31-bit range.
        radix::bucket_space(self.coarse_k, self.coarse_parts)?;
        Ok(())
    }

    /// Components per coarse sub-vector.
    #[inline]
    pub fn coarse_width(&self) -> usize {
        self.dim / self.coarse_parts
    }

    /// Components per product sub-vector.
    #[inline]
    pub fn product_width(&self) -> usize {
        self.dim / self.product_parts
    }

    /// Product partitions owned by each coarse partition.
    #[inline]
    pub fn products_per_coarse(&self) -> usize {
        self.product_parts / self.coarse_parts
    }
}

/// Per-query search budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of results to return (top-R).
    pub r: usize,
    /// Beam width: maximum number of buckets visited per query.
    pub w: usize,
    /// Candidate threshold: stop once this many candidates are collected.
    pub t: usize,
    /// Length of the per-partition ranked centroid list (M). Clamped to
    /// the number of coarse centroids.
    pub m: usize,
    /// Score candidates by true L2 distance against raw vectors instead of
    /// the ADC tables. Requires raw vectors attached to the engine.
    pub exact: bool,
}

impl SearchParams {
    /// Budget for a top-`r` query with beam width `w` and candidate
    /// threshold `t`; the ranked-list length defaults to `w`.
    pub fn new(r: usize, w: usize, t: usize) -> Self {
        Self {
            r,
            w,
            t,
            m: w,
            exact: false,
        }
    }

    /// Override the ranked-list length.
    pub fn with_ranked_len(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    /// Toggle exact-distance scoring.
    pub fn with_exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_shape() {
        let config = PqConfig::new(128, 256, 2, 256, 8).unwrap();
        assert_eq!(config.coarse_width(), 64);
        assert_eq!(config.product_width(), 16);
        assert_eq!(config.products_per_coarse(), 4);
    }

    #[test]
    fn rejects_indivisible_dim() {
        assert!(PqConfig::new(100, 16, 3, 16, 4).is_err());
        assert!(PqConfig::new(100, 16, 2, 16, 3).is_err());
    }

    #[test]
    fn rejects_zero_partitions() {
        assert!(PqConfig::new(64, 16, 0, 16, 4).is_err());
        assert!(PqConfig::new(64, 16, 1, 16, 0).is_err());
    }

    #[test]
    fn rejects_oversized_codes() {
        assert!(PqConfig::new(64, 16, 1, 257, 4).is_err());
        assert!(PqConfig::new(64, 16, 1, 16, 17).is_err());
    }

    #[test]
    fn rejects_bucket_space_overflow() {
        // 256^4 = 2^32 does not fit in 31 bits.
        assert!(matches!(
            PqConfig::new(64, 256, 4, 16, 4),
            Err(IndexError::BucketOverflow { .. })
        ));
    }

    #[test]
    fn rejects_product_parts_not_multiple_of_coarse_parts() {
        assert!(PqConfig::new(24, 8, 2, 8, 3).is_err());
    }
}
