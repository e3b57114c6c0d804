//! Farthest-point sampling for picking a diverse subset of a group.

use crate::matrix::{VectorMatrix, dot};

/// Representatives wanted from a group of `n` items: one in eight, held
/// between `min_reps` and `max_reps`.
pub fn sample_target(n: usize, min_reps: usize, max_reps: usize) -> usize {
    (n / 8).max(min_reps).min(max_reps)
}

/// Greedy max-min selection of `target` rows out of `subset`.
///
/// Seeds with `subset[0]`, then repeatedly takes the candidate whose cosine
/// distance to its nearest already-selected row is largest. Ties go to the
/// earliest position in `subset`. When `subset` has at most `target` rows it
/// is returned unchanged.
pub fn farthest_point_sample(matrix: &VectorMatrix, subset: &[usize], target: usize) -> Vec<usize> {
    if subset.len() <= target {
        return subset.to_vec();
    }
    if target == 0 {
        return Vec::new();
    }

    let mut selected = Vec::with_capacity(target);
    let mut taken = vec![false; subset.len()];
    let mut min_dist = vec![f32::INFINITY; subset.len()];

    taken[0] = true;
    selected.push(subset[0]);
    let mut last = subset[0];

    while selected.len() < target {
        let last_row = matrix.row(last);
        let mut best: Option<(usize, f32)> = None;

        for (pos, &row) in subset.iter().enumerate() {
            if taken[pos] {
                continue;
            }
            let dist = 1.0 - dot(last_row, matrix.row(row));
            if dist < min_dist[pos] {
                min_dist[pos] = dist;
            }
            match best {
                Some((_, best_dist)) if min_dist[pos] <= best_dist => {}
                _ => best = Some((pos, min_dist[pos])),
            }
        }

        // subset.len() > target guarantees a candidate remains.
        let Some((pos, _)) = best else { break };
        taken[pos] = true;
        selected.push(subset[pos]);
        last = subset[pos];
    }

    selected
}
