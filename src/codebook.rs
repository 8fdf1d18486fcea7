//! Coarse and product centroid tables.
//!
//! Codebooks are produced offline by an external clustering run and
//! consumed here as immutable data. Both tables are stored flat and
//! partition-major: partition `j` holds its `k` centroids consecutively,
//! each `dim / parts` components wide, which is the same layout the
//! binary blob format uses on disk.
//!
//! # Blob format
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header: 3 × f32  [k, parts, dim]             │
//! │   (composite variant: 4th f32 = group count) │
//! ├──────────────────────────────────────────────┤
//! │ Payload: k × dim × f32 centroid components   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Header fields share the payload's numeric width. All values are
//! little-endian. Trailing bytes after the payload are ignored.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::config::PqConfig;
use crate::error::{IndexError, Result};

/// A raw codebook blob: one centroid table plus its shape header.
#[derive(Debug, Clone, PartialEq)]
pub struct CodebookBlob {
    /// Centroids per partition.
    pub k: usize,
    /// Number of partitions.
    pub parts: usize,
    /// Full vector dimensionality (the table holds `k × dim` components).
    pub dim: usize,
    /// Bucket-count parameter of the composite variant, if present.
    pub groups: Option<usize>,
    /// Flat centroid table, partition-major.
    pub values: Vec<f32>,
}

impl CodebookBlob {
    /// Read a blob with the standard 3-field header.
    pub fn read(path: &Path) -> Result<Self> {
        Self::read_inner(path, false)
    }

    /// Read a blob with the 4-field composite header.
    pub fn read_composite(path: &Path) -> Result<Self> {
        Self::read_inner(path, true)
    }

    fn read_inner(path: &Path, composite: bool) -> Result<Self> {
        let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
        let mut reader = BufReader::new(file);

        let k = read_f32_field(&mut reader, path, "k")?;
        let parts = read_f32_field(&mut reader, path, "parts")?;
        let dim = read_f32_field(&mut reader, path, "dim")?;
        let groups = if composite {
            Some(read_f32_field(&mut reader, path, "groups")?)
        } else {
            None
        };

        if parts == 0 {
            return Err(IndexError::MalformedCodebook {
                path: path.display().to_string(),
                reason: "partition count is zero".to_string(),
            });
        }
        if dim == 0 || dim % parts != 0 {
            return Err(IndexError::MalformedCodebook {
                path: path.display().to_string(),
                reason: format!("dim {dim} is not divisible by partition count {parts}"),
            });
        }

        let count = k * dim;
        let mut values = vec![0.0f32; count];
        let mut buf = [0u8; 4];
        for value in values.iter_mut() {
            reader.read_exact(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    IndexError::MalformedCodebook {
                        path: path.display().to_string(),
                        reason: format!("payload shorter than the declared {count} components"),
                    }
                } else {
                    IndexError::io(path, e)
                }
            })?;
            *value = f32::from_le_bytes(buf);
        }

        debug!(
            path = %path.display(),
            k, parts, dim,
            "loaded codebook blob"
        );
        Ok(Self {
            k,
            parts,
            dim,
            groups,
            values,
        })
    }

    /// Write the blob; the 4-field header is emitted when `groups` is set.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| IndexError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let io = |e| IndexError::io(path, e);

        writer.write_all(&(self.k as f32).to_le_bytes()).map_err(io)?;
        writer
            .write_all(&(self.parts as f32).to_le_bytes())
            .map_err(io)?;
        writer
            .write_all(&(self.dim as f32).to_le_bytes())
            .map_err(io)?;
        if let Some(groups) = self.groups {
            writer
                .write_all(&(groups as f32).to_le_bytes())
                .map_err(io)?;
        }
        for value in &self.values {
            writer.write_all(&value.to_le_bytes()).map_err(io)?;
        }
        writer.flush().map_err(io)
    }
}

/// Immutable coarse + product centroid tables with their shape.
///
/// Shared read-only between the encoder and the query engine for the
/// lifetime of the process.
#[derive(Debug, Clone)]
pub struct Codebook {
    config: PqConfig,
    coarse: Vec<f32>,
    product: Vec<f32>,
}

impl Codebook {
    /// Assemble a codebook from in-memory tables.
    ///
    /// `coarse` holds `coarse_parts × coarse_k` centroids of
    /// `dim / coarse_parts` components, partition-major; `product`
    /// likewise for the product shape.
    pub fn from_parts(config: PqConfig, coarse: Vec<f32>, product: Vec<f32>) -> Result<Self> {
        config.validate()?;
        let coarse_expected = config.coarse_k * config.dim;
        if coarse.len() != coarse_expected {
            return Err(IndexError::DimensionMismatch {
                expected: coarse_expected,
                actual: coarse.len(),
            });
        }
        let product_expected = config.product_k * config.dim;
        if product.len() != product_expected {
            return Err(IndexError::DimensionMismatch {
                expected: product_expected,
                actual: product.len(),
            });
        }
        Ok(Self {
            config,
            coarse,
            product,
        })
    }

    /// Load a coarse and a product blob, deriving the shape from their
    /// headers.
    pub fn load(coarse_path: &Path, product_path: &Path) -> Result<Self> {
        let coarse = CodebookBlob::read(coarse_path)?;
        let product = CodebookBlob::read(product_path)?;
        if product.dim != coarse.dim {
            return Err(IndexError::MalformedCodebook {
                path: product_path.display().to_string(),
                reason: format!(
                    "dim {} disagrees with the coarse codebook's dim {}",
                    product.dim, coarse.dim
                ),
            });
        }
        let config = PqConfig::new(coarse.dim, coarse.k, coarse.parts, product.k, product.parts)?;
        debug!(
            coarse_k = config.coarse_k,
            coarse_parts = config.coarse_parts,
            product_k = config.product_k,
            product_parts = config.product_parts,
            dim = config.dim,
            "loaded codebooks"
        );
        Self::from_parts(config, coarse.values, product.values)
    }

    /// Persist both tables as standard 3-field blobs.
    pub fn write(&self, coarse_path: &Path, product_path: &Path) -> Result<()> {
        CodebookBlob {
            k: self.config.coarse_k,
            parts: self.config.coarse_parts,
            dim: self.config.dim,
            groups: None,
            values: self.coarse.clone(),
        }
        .write(coarse_path)?;
        CodebookBlob {
            k: self.config.product_k,
            parts: self.config.product_parts,
            dim: self.config.dim,
            groups: None,
            values: self.product.clone(),
        }
        .write(product_path)
    }

    /// Shape of this codebook pair.
    #[inline]
    pub fn config(&self) -> &PqConfig {
        &self.config
    }

    /// All coarse centroids of one partition, flat.
    #[inline]
    pub fn coarse_partition(&self, part: usize) -> &[f32] {
        let span = self.config.coarse_k * self.config.coarse_width();
        &self.coarse[part * span..(part + 1) * span]
    }

    /// One coarse centroid.
    #[inline]
    pub fn coarse_centroid(&self, part: usize, idx: usize) -> &[f32] {
        let width = self.config.coarse_width();
        let base = (part * self.config.coarse_k + idx) * width;
        &self.coarse[base..base + width]
    }

    /// All product centroids of one partition, flat.
    #[inline]
    pub fn product_partition(&self, part: usize) -> &[f32] {
        let span = self.config.product_k * self.config.product_width();
        &self.product[part * span..(part + 1) * span]
    }

    /// One product centroid.
    #[inline]
    pub fn product_centroid(&self, part: usize, idx: usize) -> &[f32] {
        let width = self.config.product_width();
        let base = (part * self.config.product_k + idx) * width;
        &self.product[base..base + width]
    }
}

fn read_f32_field(reader: &mut impl Read, path: &Path, field: &str) -> Result<usize> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::MalformedCodebook {
                path: path.display().to_string(),
                reason: format!("truncated header (missing {field})"),
            }
        } else {
            IndexError::io(path, e)
        }
    })?;
    let value = f32::from_le_bytes(buf);
    if !(value.is_finite() && value >= 0.0 && value.fract() == 0.0) {
        return Err(IndexError::MalformedCodebook {
            path: path.display().to_string(),
            reason: format!("header field {field} is not a non-negative integer ({value})"),
        });
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_codebook() -> Codebook {
        // dim=4, kc=2, mc=2, kp=2, mp=2
        let config = PqConfig::new(4, 2, 2, 2, 2).unwrap();
        let coarse = vec![
            0.0, 0.0, 1.0, 1.0, // partition 0: centroids (0,0) and (1,1)
            2.0, 2.0, 3.0, 3.0, // partition 1
        ];
        let product = vec![
            0.1, 0.1, 0.2, 0.2, // partition 0
            0.3, 0.3, 0.4, 0.4, // partition 1
        ];
        Codebook::from_parts(config, coarse, product).unwrap()
    }

    #[test]
    fn centroid_accessors_slice_partition_major() {
        let cb = sample_codebook();
        assert_eq!(cb.coarse_centroid(0, 1), &[1.0, 1.0]);
        assert_eq!(cb.coarse_centroid(1, 0), &[2.0, 2.0]);
        assert_eq!(cb.product_centroid(1, 1), &[0.4, 0.4]);
        assert_eq!(cb.coarse_partition(1), &[2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn from_parts_rejects_wrong_table_sizes() {
        let config = PqConfig::new(4, 2, 2, 2, 2).unwrap();
        let err = Codebook::from_parts(config, vec![0.0; 7], vec![0.0; 8]);
        assert!(matches!(err, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coarse.ctr");
        let blob = CodebookBlob {
            k: 2,
            parts: 2,
            dim: 4,
            groups: None,
            values: vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0],
        };
        blob.write(&path).unwrap();
        let loaded = CodebookBlob::read(&path).unwrap();
        assert_eq!(loaded, blob);
    }

    #[test]
    fn composite_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("composite.ctr");
        let blob = CodebookBlob {
            k: 2,
            parts: 1,
            dim: 2,
            groups: Some(8),
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        blob.write(&path).unwrap();
        let loaded = CodebookBlob::read_composite(&path).unwrap();
        assert_eq!(loaded, blob);
    }

    #[test]
    fn load_round_trips_tables() {
        let cb = sample_codebook();
        let dir = tempfile::tempdir().unwrap();
        let coarse_path = dir.path().join("coarse.ctr");
        let product_path = dir.path().join("product.ctr");
        cb.write(&coarse_path, &product_path).unwrap();
        let loaded = Codebook::load(&coarse_path, &product_path).unwrap();
        assert_eq!(loaded.config(), cb.config());
        assert_eq!(loaded.coarse, cb.coarse);
        assert_eq!(loaded.product, cb.product);
    }

    #[test]
    fn zero_partition_header_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ctr");
        let blob = CodebookBlob {
            k: 2,
            parts: 1,
            dim: 2,
            groups: None,
            values: vec![0.0; 4],
        };
        blob.write(&path).unwrap();
        // Corrupt the parts field in place.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&0.0f32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            CodebookBlob::read(&path),
            Err(IndexError::MalformedCodebook { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.ctr");
        let blob = CodebookBlob {
            k: 2,
            parts: 1,
            dim: 4,
            groups: None,
            values: vec![0.0; 8],
        };
        blob.write(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();
        assert!(matches!(
            CodebookBlob::read(&path),
            Err(IndexError::MalformedCodebook { .. })
        ));
    }
}
