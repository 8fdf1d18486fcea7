//! quiver: inverted multi-index search over product-quantized vectors.
//!
//! Compresses N high-dimensional vectors into byte codes, groups them
//! into an inverted file keyed by coarse cluster identity, and answers
//! top-R nearest-neighbor queries from the compressed codes alone:
//!
//! - `codebook`: coarse + product centroid tables (consumed, not trained)
//! - `encoder`: coarse assignment, residuals, product codes
//! - `invfile`: the bucketed index and its binary file format
//! - `query`: ADC tables and the multi-sequence traversal
//! - `heap`: the bounded multi-tag frontier heap
//! - `radix`: mixed-radix bucket addressing
//!
//! # Why an inverted file?
//!
//! Brute force is O(N·dim) per query. Keying vectors by their nearest
//! coarse centroid lets a query inspect only the few buckets whose
//! centroids are close to it; product quantization then scores the
//! candidates inside those buckets at a few table lookups each, without
//! touching raw vectors.
//!
//! # Why multi-sequence traversal?
//!
//! With several coarse partitions (or several retained ranks), buckets
//! live at the cartesian product of per-partition ranked lists, and the
//! naive orders (raw centroid index, or rank in a single list) do not
//! match joint distance. The traversal expands rank combinations
//! best-first under a dependency gate: a combination enters the frontier
//! only after every predecessor (one rank lower in any dimension) has
//! been expanded. Buckets then surface in non-decreasing joint-distance
//! order with an O(frontier) heap and no duplicate expansion.
//!
//! # Search budget
//!
//! Two knobs bound every query: the beam width `w` (buckets visited) and
//! the candidate threshold `T` (codes scored). Recall degrades gracefully
//! as either shrinks; returning fewer than R results under a tight budget
//! is a normal outcome, not an error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use quiver::{Codebook, Encoder, InvertedFile, QueryEngine, SearchParams};
//!
//! let codebook = Codebook::load(coarse_path, product_path)?;
//! let encoded = Encoder::new(&codebook).encode(&vectors)?;
//! let index = InvertedFile::build(&encoded, codebook.config().coarse_k)?;
//! index.write_to(index_path)?;
//!
//! let engine = QueryEngine::new(codebook, index)?;
//! let params = SearchParams::new(10, 32, 10_000);
//! let mut scratch = engine.scratch_single();
//! let top = engine.search_single(&query, &params, &mut scratch)?;
//! ```

pub mod codebook;
pub mod config;
pub mod encoder;
pub mod error;
pub mod heap;
pub mod invfile;
pub mod query;
pub mod radix;
pub mod simd;

pub use codebook::{Codebook, CodebookBlob};
pub use config::{PqConfig, SearchParams};
pub use encoder::{EncodedSet, Encoder};
pub use error::{IndexError, Result};
pub use invfile::InvertedFile;
pub use query::{QueryEngine, SearchDiagnostics, SearchScratch};
