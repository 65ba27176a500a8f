//! # Vector index
//!
//! Exact nearest-neighbour search over fixed-dimension `f32` vectors.
//!
//! [`FlatIndex`] keeps every vector in one contiguous row-major buffer and
//! answers queries by brute force: the squared Euclidean distance to every
//! stored vector is computed (in parallel with `rayon`), then results are
//! ordered by `(distance, position)` so equal distances resolve to the vector
//! that was inserted first.
//!
//! Position `i` in the index is the only identity a vector has. Callers keep a
//! parallel document list and rely on `documents[i]` belonging to vector `i`.
//! There is no removal primitive; rebuild to shrink or edit the set.
//!
//! ## Quick Example
//! ```
//! use awful_rag::vector_index::FlatIndex;
//!
//! # fn main() -> Result<(), awful_rag::error::RagError> {
//! let mut index = FlatIndex::new();
//! index.build(vec![vec![0.0, 0.0], vec![3.0, 4.0]])?;
//! let hits = index.search(&[2.9, 4.1], 1)?;
//! assert_eq!(hits[0].position, 1);
//! # Ok(()) }
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// One search hit: the vector's insertion position and its squared L2 distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Brute-force exact L2 index.
///
/// `dimension` is `None` until the first successful [`build`](Self::build);
/// every later build or add must then supply vectors of that width.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: Option<usize>,
    data: Vec<f32>,
}

impl FlatIndex {
    /// An empty, unbuilt index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole content of the index with `vectors`.
    ///
    /// The dimension becomes the width of the first vector.
    ///
    /// # Errors
    /// - [`RagError::EmptyInput`] when `vectors` is empty. The index is untouched.
    /// - [`RagError::DimensionMismatch`] when the vectors disagree on width.
    /// - [`RagError::InvalidInput`] for zero-width vectors or non-finite values.
    pub fn build(&mut self, vectors: Vec<Vec<f32>>) -> Result<()> {
        let first = vectors
            .first()
            .ok_or_else(|| RagError::EmptyInput("cannot build an index from zero vectors".into()))?;
        let dimension = first.len();
        if dimension == 0 {
            return Err(RagError::InvalidInput("vectors must have at least one component".into()));
        }

        let data = flatten(vectors, dimension)?;
        self.dimension = Some(dimension);
        self.data = data;
        Ok(())
    }

    /// Append `vectors` after the existing ones, keeping positions stable.
    ///
    /// # Errors
    /// - [`RagError::NotBuilt`] if the index was never built.
    /// - [`RagError::DimensionMismatch`] if any vector has the wrong width.
    pub fn add(&mut self, vectors: Vec<Vec<f32>>) -> Result<()> {
        let dimension = self.require_dimension()?;
        if vectors.is_empty() {
            return Ok(());
        }
        let mut data = flatten(vectors, dimension)?;
        self.data.append(&mut data);
        Ok(())
    }

    /// Up to `k` nearest vectors to `query`, closest first.
    ///
    /// If the index holds fewer than `k` vectors, all of them are returned.
    ///
    /// # Errors
    /// - [`RagError::NotBuilt`] before the first build.
    /// - [`RagError::DimensionMismatch`] if `query` has the wrong width.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let dimension = self.require_dimension()?;
        if query.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .par_chunks_exact(dimension)
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_l2(vector, query),
            })
            .collect();

        hits.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        match self.dimension {
            Some(dimension) if dimension > 0 => self.data.len() / dimension,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_built(&self) -> bool {
        self.dimension.is_some()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// The vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let dimension = self.dimension?;
        self.data.chunks_exact(dimension).nth(position)
    }

    /// Stored vectors in position order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on zero, an unbuilt index simply yields nothing
        let dimension = self.dimension.unwrap_or(1);
        let data: &[f32] = if self.dimension.is_some() {
            &self.data[..]
        } else {
            &[]
        };
        data.chunks_exact(dimension)
    }

    /// Verify the invariants `build` and `add` maintain, for indices that came
    /// from outside (e.g. deserialized from disk).
    ///
    /// An unbuilt index holds no data; a built one has a non-zero dimension,
    /// a whole number of rows and only finite values.
    pub fn check(&self) -> std::result::Result<(), String> {
        match self.dimension {
            None if self.data.is_empty() => Ok(()),
            None => Err(format!("unbuilt index carries {} values", self.data.len())),
            Some(0) => Err("index dimension is zero".to_string()),
            Some(dimension) if self.data.len() % dimension != 0 => Err(format!(
                "{} values do not split into rows of {}",
                self.data.len(),
                dimension
            )),
            Some(_) if self.data.iter().any(|v| !v.is_finite()) => {
                Err("index holds non-finite values".to_string())
            }
            Some(_) => Ok(()),
        }
    }

    fn require_dimension(&self) -> Result<usize> {
        self.dimension
            .ok_or_else(|| RagError::NotBuilt("build the index before using it".into()))
    }
}

fn flatten(vectors: Vec<Vec<f32>>, dimension: usize) -> Result<Vec<f32>> {
    let mut data = Vec::with_capacity(vectors.len() * dimension);
    for vector in vectors {
        if vector.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(RagError::InvalidInput(
                "vectors must contain only finite values".into(),
            ));
        }
        data.extend_from_slice(&vector);
    }
    Ok(data)
}

/// Squared Euclidean distance `Σ (a[i] - b[i])²` between equal-length slices.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
