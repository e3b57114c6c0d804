//! Greedy near-duplicate clustering.
//!
//! Rows are visited in ascending order. Each unvisited row becomes a seed and
//! claims up to `max_size` of its unvisited top-K neighbors at or above the
//! threshold. This is bucket packing, not transitive closure: two rows that
//! are both close to a third may or may not share a cluster depending on
//! visiting order, and a true cluster larger than `fan_out` is undercounted.

use crate::index::SimilarityIndex;
use crate::matrix::VectorMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterBuilder {
    pub threshold: f32,
    pub fan_out: usize,
    pub max_size: usize,
}

/// Row positions judged near-duplicate. `members[0]` is the seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub members: Vec<usize>,
}

impl Cluster {
    pub fn seed(&self) -> usize {
        self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

impl ClusterBuilder {
    pub fn new(threshold: f32, fan_out: usize, max_size: usize) -> Self {
        Self {
            threshold,
            fan_out,
            max_size,
        }
    }

    pub fn build(&self, matrix: &VectorMatrix) -> Vec<Cluster> {
        let index = SimilarityIndex::new(matrix);
        let mut visited = vec![false; matrix.len()];
        let mut clusters = Vec::new();
        let cap = self.max_size.max(1);

        for i in 0..matrix.len() {
            if visited[i] {
                continue;
            }
            let members: Vec<usize> = index
                .search(i, self.fan_out.max(1))
                .into_iter()
                .filter(|n| n.index == i || (n.similarity >= self.threshold && !visited[n.index]))
                .take(cap)
                .map(|n| n.index)
                .collect();

            for &m in &members {
                visited[m] = true;
            }
            clusters.push(Cluster { members });
        }

        debug!(
            "Clustered {} rows into {} clusters (threshold {}, K {}, M {})",
            matrix.len(),
            clusters.len(),
            self.threshold,
            self.fan_out,
            self.max_size
        );
        clusters
    }
}

/// Seeds of `clusters`, in cluster order.
pub fn seeds(clusters: &[Cluster]) -> Vec<usize> {
    clusters.iter().map(Cluster::seed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::matrix_from_rows;
    use proptest::prelude::*;

    /// `n` vectors whose pairwise cosine similarity is exactly `1 / (1 + eps^2)`.
    fn equidistant(n: usize, eps: f32) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0; n + 1];
                v[0] = 1.0;
                v[i + 1] = eps;
                v
            })
            .collect()
    }

    #[test]
    fn test_mutual_duplicates_respect_cap() {
        // 1 / (1 + 0.1005^2) ≈ 0.99
        let matrix = matrix_from_rows(&equidistant(6, 0.1005));
        assert!((matrix.similarity(0, 5) - 0.99).abs() < 1e-3);

        let clusters = ClusterBuilder::new(0.95, 50, 4).build(&matrix);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1, 2, 3]);
        assert_eq!(clusters[1].members, vec![4, 5]);
    }

    #[test]
    fn test_isolated_rows_are_singletons() {
        let matrix = matrix_from_rows(&[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ]);
        let clusters = ClusterBuilder::new(0.5, 50, 4).build(&matrix);
        assert_eq!(clusters.len(), 3);
        assert!(clusters.iter().all(Cluster::is_singleton));
        assert_eq!(seeds(&clusters), vec![0, 1, 2]);
    }

    #[test]
    fn test_greedy_order_dependence() {
        // 1 is close to both 0 and 2; 0 and 2 are not close to each other.
        let matrix = matrix_from_rows(&[
            vec![1.0, 0.0],
            vec![0.8, 0.6],
            vec![0.28, 0.96],
        ]);
        let clusters = ClusterBuilder::new(0.75, 50, 10).build(&matrix);
        assert_eq!(clusters[0].members, vec![0, 1]);
        assert_eq!(clusters[1].members, vec![2]);
    }

    #[test]
    fn test_fan_out_limits_claims() {
        let matrix = matrix_from_rows(&equidistant(8, 0.01));
        let clusters = ClusterBuilder::new(0.9, 3, 100).build(&matrix);
        assert!(clusters.iter().all(|c| c.len() <= 3));
        assert_eq!(clusters[0].members, vec![0, 1, 2]);
    }

    #[test]
    fn test_visited_rows_are_not_reclaimed() {
        // Rows 2 and 3 pair up; 0 and 1 stay alone.
        let matrix = matrix_from_rows(&[
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
            vec![0.9, 0.43589, 0.0],
            vec![0.8, 0.6, 0.0],
        ]);
        let clusters = ClusterBuilder::new(0.95, 50, 4).build(&matrix);
        let mut seen = vec![0; matrix.len()];
        for c in &clusters {
            for &m in &c.members {
                seen[m] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
        assert_eq!(clusters[2].members, vec![2, 3]);
    }

    fn arb_rows() -> impl Strategy<Value = Vec<Vec<f32>>> {
        prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 4), 1..40).prop_map(|rows| {
            rows.into_iter()
                .map(|mut r| {
                    // Keep every row away from zero norm.
                    r[0] += 3.0;
                    r
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_clusters_partition_rows(
            rows in arb_rows(),
            threshold in 0.5f32..1.0,
            cap in 1usize..6
        ) {
            let matrix = matrix_from_rows(&rows);
            let builder = ClusterBuilder::new(threshold, 10, cap);
            let clusters = builder.build(&matrix);

            let mut seen = vec![0usize; matrix.len()];
            for (ci, c) in clusters.iter().enumerate() {
                prop_assert!(!c.is_empty() && c.len() <= cap);
                if ci > 0 {
                    prop_assert!(clusters[ci - 1].seed() < c.seed());
                }
                for &m in &c.members {
                    seen[m] += 1;
                    if m != c.seed() {
                        prop_assert!(matrix.similarity(c.seed(), m) >= threshold);
                    }
                }
            }
            prop_assert!(seen.iter().all(|&count| count == 1));

            prop_assert_eq!(builder.build(&matrix), clusters);
        }
    }
}
