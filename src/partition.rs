//! Per-group refinement: size floors, a second tighter clustering pass,
//! diversity sampling and random backfill.

use crate::ItemKey;
use crate::cluster::{ClusterBuilder, seeds};
use crate::config::CurateConfig;
use crate::matrix::VectorMatrix;
use crate::sampler::{farthest_point_sample, sample_target};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Group for items that sit directly under the collection root.
pub const ROOT_GROUP: &str = "_root";

/// First path segment of `key`, or [`ROOT_GROUP`] for top-level files.
pub fn group_key(key: &str) -> &str {
    match key.split_once('/') {
        Some((first, _)) if !first.is_empty() => first,
        _ => ROOT_GROUP,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionType {
    OneOff,
    SmallCollection,
    RepresentativeSample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub key: ItemKey,
    pub group_id: usize,
    pub group_name: String,
    #[serde(rename = "type")]
    pub selection: SelectionType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub backfilled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: usize,
    pub name: String,
    /// Row positions in the matrix the group was partitioned from.
    pub members: Vec<usize>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Split `rows` of `matrix` by [`group_key`]. Groups come out in key order
/// and are numbered in that order; members keep their relative order.
pub fn partition(matrix: &VectorMatrix, rows: &[usize]) -> Vec<Group> {
    let mut by_key: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for &row in rows {
        by_key.entry(group_key(matrix.key(row))).or_default().push(row);
    }
    by_key
        .into_iter()
        .enumerate()
        .map(|(id, (name, members))| Group {
            id,
            name: name.to_string(),
            members,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub group_id: usize,
    pub size: usize,
    /// Sub-cluster seeds found by the refinement pass (0 for kept-whole groups).
    pub refined: usize,
    pub backfilled: usize,
    pub selections: Vec<SelectionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupPartitioner {
    pub refine: ClusterBuilder,
    pub one_off_max: usize,
    pub small_max: usize,
    pub min_reps: usize,
    pub max_reps: usize,
}

impl GroupPartitioner {
    pub fn from_config(config: &CurateConfig) -> Self {
        Self {
            refine: ClusterBuilder::new(
                config.group_threshold,
                config.fan_out,
                config.max_cluster_size,
            ),
            one_off_max: config.one_off_max,
            small_max: config.small_max,
            min_reps: config.min_reps,
            max_reps: config.max_reps,
        }
    }

    pub fn select<R: Rng + ?Sized>(
        &self,
        matrix: &VectorMatrix,
        group: &Group,
        rng: &mut R,
    ) -> GroupOutcome {
        let n = group.len();

        if n <= self.small_max {
            let selection = if n <= self.one_off_max {
                SelectionType::OneOff
            } else {
                SelectionType::SmallCollection
            };
            let selections = group
                .members
                .iter()
                .map(|&row| record(matrix, group, row, selection, false))
                .collect();
            return GroupOutcome {
                group_id: group.id,
                size: n,
                refined: 0,
                backfilled: 0,
                selections,
            };
        }

        let local = matrix.select(&group.members);
        let representatives = seeds(&self.refine.build(&local));
        let target = sample_target(n, self.min_reps, self.max_reps);
        let mut picked = farthest_point_sample(&local, &representatives, target);

        let wanted = self.min_reps.min(n);
        let mut backfilled = 0;
        if picked.len() < wanted {
            let chosen: HashSet<usize> = picked.iter().copied().collect();
            let pool: Vec<usize> = (0..n).filter(|i| !chosen.contains(i)).collect();
            let extra = rand::seq::index::sample(rng, pool.len(), wanted - picked.len());
            backfilled = extra.len();
            picked.extend(extra.into_iter().map(|i| pool[i]));
        }

        debug!(
            "Group {} ({} items): {} sub-clusters, target {}, {} selected ({} backfilled)",
            group.name,
            n,
            representatives.len(),
            target,
            picked.len(),
            backfilled
        );

        let first_backfill = picked.len() - backfilled;
        let selections = picked
            .iter()
            .enumerate()
            .map(|(pos, &i)| {
                record(
                    matrix,
                    group,
                    group.members[i],
                    SelectionType::RepresentativeSample,
                    pos >= first_backfill,
                )
            })
            .collect();

        GroupOutcome {
            group_id: group.id,
            size: n,
            refined: representatives.len(),
            backfilled,
            selections,
        }
    }
}

fn record(
    matrix: &VectorMatrix,
    group: &Group,
    row: usize,
    selection: SelectionType,
    backfilled: bool,
) -> SelectionRecord {
    SelectionRecord {
        key: matrix.key(row).clone(),
        group_id: group.id,
        group_name: group.name.clone(),
        selection,
        backfilled,
    }
}
