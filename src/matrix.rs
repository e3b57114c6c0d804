//! Contiguous per-run vector storage.
//!
//! Rows live back to back in one `Vec<f32>` and are addressed by position.
//! Row order is the iteration and tie-break order for clustering and
//! sampling, so it must be deterministic for a given input.

use crate::ItemKey;
use crate::cache::EmbeddingCache;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct VectorMatrix {
    keys: Vec<ItemKey>,
    data: Vec<f32>,
    dim: usize,
}

/// Result of assembling a matrix from the cache.
#[derive(Debug, Default)]
pub struct MatrixBuild {
    pub matrix: VectorMatrix,
    /// Keys with no cached vector.
    pub missing: Vec<ItemKey>,
    /// Keys whose vector has the wrong dimension or zero length.
    pub rejected: Vec<ItemKey>,
}

impl VectorMatrix {
    pub fn with_dimension(dim: usize) -> Self {
        Self {
            keys: Vec::new(),
            data: Vec::new(),
            dim,
        }
    }

    /// Gather `keys` from `cache` in the given order. Keys without a usable
    /// vector are reported, never fatal.
    pub fn from_cache(keys: &[ItemKey], cache: &EmbeddingCache) -> MatrixBuild {
        let mut build = MatrixBuild {
            matrix: Self::with_dimension(cache.dimension().unwrap_or_default()),
            ..MatrixBuild::default()
        };

        for key in keys {
            let Some(vector) = cache.get(key) else {
                debug!("No embedding for {}; excluded from this run", key);
                build.missing.push(key.clone());
                continue;
            };
            if !build.matrix.push(key.clone(), vector) {
                warn!(
                    "Embedding for {} has dimension {} (expected {}) or zero norm; excluded",
                    key,
                    vector.len(),
                    build.matrix.dim
                );
                build.rejected.push(key.clone());
            }
        }

        if !build.missing.is_empty() {
            warn!(
                "{} item(s) have no cached embedding and were skipped",
                build.missing.len()
            );
        }
        build
    }

    /// Append a row, L2-normalizing it. Returns false (and stores nothing)
    /// for a dimension mismatch or a zero vector.
    pub fn push(&mut self, key: ItemKey, vector: &[f32]) -> bool {
        if vector.len() != self.dim || self.dim == 0 {
            return false;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_normal() {
            return false;
        }
        self.data.extend(vector.iter().map(|v| v / norm));
        self.keys.push(key);
        true
    }

    /// A new matrix holding `indices` in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut out = Self::with_dimension(self.dim);
        out.keys.reserve(indices.len());
        out.data.reserve(indices.len() * self.dim);
        for &i in indices {
            out.keys.push(self.keys[i].clone());
            out.data.extend_from_slice(self.row(i));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn key(&self, i: usize) -> &ItemKey {
        &self.keys[i]
    }

    pub fn keys(&self) -> &[ItemKey] {
        &self.keys
    }

    /// Cosine similarity of two rows (inner product of unit vectors).
    pub fn similarity(&self, i: usize, j: usize) -> f32 {
        dot(self.row(i), self.row(j))
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
pub(crate) fn matrix_from_rows(rows: &[Vec<f32>]) -> VectorMatrix {
    let dim = rows.first().map_or(0, Vec::len);
    let mut matrix = VectorMatrix::with_dimension(dim);
    for (i, row) in rows.iter().enumerate() {
        assert!(matrix.push(format!("item_{:04}", i), row));
    }
    matrix
}
