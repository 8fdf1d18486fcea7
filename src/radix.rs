//! Mixed-radix bucket addressing.
//!
//! A vector's coarse digits (one per partition, each in `[0, base)`) map to
//! a composite bucket id by treating them as a mixed-radix number. Both the
//! index builder and the query engine go through this one encode/decode
//! pair so the radix arithmetic cannot diverge between them.

use smallvec::SmallVec;

use crate::error::{IndexError, Result};

/// Digit tuple for a single vector; coarse partition counts are small.
pub type Digits = SmallVec<[u16; 4]>;

/// Total number of buckets addressed by `parts` digits of radix `base`.
///
/// Checked before any allocation: the composite id must stay inside a
/// 31-bit signed range (index files store bucket metadata as `i32`).
pub fn bucket_space(base: usize, parts: usize) -> Result<usize> {
    let mut space: usize = 1;
    for _ in 0..parts {
        space = space
            .checked_mul(base)
            .filter(|&s| s < (1 << 31))
            .ok_or(IndexError::BucketOverflow { base, parts })?;
    }
    Ok(space)
}

/// Compose digits into a composite bucket id (first digit most
/// significant).
#[inline]
pub fn compose(digits: &[u16], base: usize) -> usize {
    let mut id = 0usize;
    for &d in digits {
        debug_assert!((d as usize) < base);
        id = id * base + d as usize;
    }
    id
}

/// Compose wide digits (already-composited per-partition values) into a
/// composite bucket id.
#[inline]
pub fn compose_wide(digits: &[usize], base: usize) -> usize {
    let mut id = 0usize;
    for &d in digits {
        debug_assert!(d < base);
        id = id * base + d;
    }
    id
}

/// Decompose a composite bucket id back into `parts` digits.
#[inline]
pub fn decompose(mut id: usize, base: usize, parts: usize) -> Digits {
    let mut digits = Digits::from_elem(0, parts);
    for slot in digits.iter_mut().rev() {
        *slot = (id % base) as u16;
        id /= base;
    }
    digits
}

/// Decompose a composite bucket id into wide digits (each itself a
/// composited per-partition value in `[0, base)`).
#[inline]
pub fn decompose_wide(mut id: usize, base: usize, parts: usize) -> SmallVec<[usize; 4]> {
    let mut digits = SmallVec::from_elem(0, parts);
    for slot in digits.iter_mut().rev() {
        *slot = id % base;
        id /= base;
    }
    digits
}
