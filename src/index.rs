//! Exact inner-product nearest-neighbor search over a [`VectorMatrix`].

use crate::matrix::{VectorMatrix, dot};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub similarity: f32,
}

/// Ranks neighbors: higher similarity first, then lower index.
#[derive(Debug, Clone, Copy)]
struct Ranked(Neighbor);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .similarity
            .total_cmp(&other.0.similarity)
            .then_with(|| other.0.index.cmp(&self.0.index))
    }
}

/// Flat index borrowing the matrix for one pass.
pub struct SimilarityIndex<'a> {
    matrix: &'a VectorMatrix,
}

impl<'a> SimilarityIndex<'a> {
    pub fn new(matrix: &'a VectorMatrix) -> Self {
        Self { matrix }
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    /// The `k` rows most similar to row `query`, best first, ties broken by
    /// ascending index. The query itself always comes first with similarity
    /// 1.0 and counts towards `k`.
    pub fn search(&self, query: usize, k: usize) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let target = self.matrix.row(query);
        let others = k - 1;

        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(others + 1);
        if others > 0 {
            for j in 0..self.matrix.len() {
                if j == query {
                    continue;
                }
                let candidate = Ranked(Neighbor {
                    index: j,
                    similarity: dot(target, self.matrix.row(j)),
                });
                if heap.len() < others {
                    heap.push(Reverse(candidate));
                } else if let Some(Reverse(worst)) = heap.peek() {
                    if candidate > *worst {
                        heap.pop();
                        heap.push(Reverse(candidate));
                    }
                }
            }
        }

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(r)| r).collect();
        ranked.sort_unstable_by(|a, b| b.cmp(a));

        let mut neighbors = Vec::with_capacity(ranked.len() + 1);
        neighbors.push(Neighbor {
            index: query,
            similarity: 1.0,
        });
        neighbors.extend(ranked.into_iter().map(|r| r.0));
        neighbors
    }
}
