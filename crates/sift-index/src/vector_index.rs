//! Exact inner-product search over L2-normalized vectors.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

const VECTOR_FILE_VERSION: u32 = 1;

/// Tolerance used when checking that a stored vector has unit norm.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Position in the index, aligned with the snapshot fragment list.
    pub position: usize,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Flat row-major matrix of unit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    model: String,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct VectorFile {
    version: u32,
    dimension: usize,
    model: String,
    data: Vec<f32>,
}

/// Euclidean length of `v`.
#[must_use]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Returns `false` (leaving `v` untouched)
/// for zero or non-finite vectors, which cannot be normalized.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

impl VectorIndex {
    #[must_use]
    pub fn empty(dimension: usize, model: impl Into<String>) -> Self {
        Self {
            dimension,
            model: model.into(),
            data: Vec::new(),
        }
    }

    /// Normalize and pack `vectors`. All vectors must share one dimension.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotMismatch` on a dimension mismatch or a vector that
    /// cannot be normalized.
    pub fn build(vectors: Vec<Vec<f32>>, model: impl Into<String>) -> Result<Self> {
        let dimension = vectors.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(vectors.len() * dimension);
        for (position, mut vector) in vectors.into_iter().enumerate() {
            if vector.len() != dimension {
                return Err(IndexError::SnapshotMismatch(format!(
                    "vector {position} has dimension {}, expected {dimension}",
                    vector.len()
                )));
            }
            if !normalize(&mut vector) {
                return Err(IndexError::SnapshotMismatch(format!(
                    "vector {position} cannot be normalized"
                )));
            }
            data.extend_from_slice(&vector);
        }
        Ok(Self {
            dimension,
            model: model.into(),
            data,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embedding model the vectors came from.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// All vectors in position order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// The `top_k` most similar vectors to `query`, best first. Ties keep
    /// position order.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotMismatch` if the query dimension differs from the index.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(IndexError::SnapshotMismatch(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }
        let mut query = query.to_vec();
        if !normalize(&mut query) {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .vectors()
            .enumerate()
            .map(|(position, row)| SearchHit {
                position,
                score: row.iter().zip(&query).map(|(a, b)| a * b).sum(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Write the index with `bincode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or encoded.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = VectorFile {
            version: VECTOR_FILE_VERSION,
            dimension: self.dimension,
            model: self.model.clone(),
            data: self.data.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &file)?;
        Ok(())
    }

    /// Read an index written by [`VectorIndex::save`].
    ///
    /// # Errors
    ///
    /// Returns an error on IO or decode failure, a version mismatch, or a
    /// payload that is not a whole number of vectors.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: VectorFile = bincode::deserialize_from(reader)?;
        if file.version != VECTOR_FILE_VERSION {
            return Err(IndexError::SnapshotMismatch(format!(
                "vector file version {} (expected {VECTOR_FILE_VERSION})",
                file.version
            )));
        }
        if (file.dimension == 0 && !file.data.is_empty())
            || (file.dimension != 0 && file.data.len() % file.dimension != 0)
        {
            return Err(IndexError::SnapshotMismatch(
                "vector payload is not a whole number of vectors".into(),
            ));
        }
        Ok(Self {
            dimension: file.dimension,
            model: file.model,
            data: file.data,
        })
    }
}
