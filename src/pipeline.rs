//! Curation entry point: global dedup, per-group refinement, sampling and
//! assembly, run as a sequence of full barriers.

use crate::ItemKey;
use crate::assembly::{Assembler, DedupGuard, Placement, SkippedPlacement};
use crate::cache::EmbeddingCache;
use crate::cluster::ClusterBuilder;
use crate::config::{ConfigError, CurateConfig};
use crate::manifest::Manifest;
use crate::matrix::VectorMatrix;
use crate::partition::{GroupPartitioner, SelectionRecord, SelectionType, partition};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationStats {
    pub items: usize,
    pub embedded: usize,
    pub missing_embeddings: usize,
    pub rejected_embeddings: usize,
    pub global_clusters: usize,
    pub global_survivors: usize,
    pub duplicates_removed: usize,
    pub groups: usize,
    pub one_off: usize,
    pub small_collection: usize,
    pub representative_sample: usize,
    pub backfilled: usize,
    pub placed: usize,
    pub skipped_placements: usize,
}

/// An item dropped by the global pass, with the seed it duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub key: ItemKey,
    pub kept: ItemKey,
}

#[derive(Debug, Clone)]
pub struct Curation {
    /// Effective configuration, with the seed actually used filled in.
    pub params: CurateConfig,
    pub stats: CurationStats,
    pub selections: Vec<SelectionRecord>,
    pub placements: Vec<Placement>,
    pub skipped: Vec<SkippedPlacement>,
    pub duplicates: Vec<DuplicateRecord>,
}

impl Curation {
    pub fn into_manifest(self) -> Manifest {
        Manifest {
            generated_at: Utc::now().to_rfc3339(),
            params: self.params,
            stats: self.stats,
            selections: self.selections,
            placements: self.placements,
            skipped: self.skipped,
            duplicates: self.duplicates,
        }
    }
}

/// Run [`curate`] with a `StdRng` seeded from `config.seed`, drawing and
/// recording a fresh seed when none is configured.
pub fn curate_seeded(
    keys: &[ItemKey],
    cache: &EmbeddingCache,
    config: &CurateConfig,
) -> Result<Curation, ConfigError> {
    let seed = config.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let config = CurateConfig {
        seed: Some(seed),
        ..config.clone()
    };
    curate(keys, cache, &config, &mut rng)
}

/// Curate `keys` (in this order) using vectors from `cache`.
pub fn curate<R: Rng + ?Sized>(
    keys: &[ItemKey],
    cache: &EmbeddingCache,
    config: &CurateConfig,
    rng: &mut R,
) -> Result<Curation, ConfigError> {
    config.validate()?;

    let build = VectorMatrix::from_cache(keys, cache);
    let matrix = build.matrix;
    let mut stats = CurationStats {
        items: keys.len(),
        embedded: matrix.len(),
        missing_embeddings: build.missing.len(),
        rejected_embeddings: build.rejected.len(),
        ..CurationStats::default()
    };

    let global = ClusterBuilder::new(
        config.global_threshold,
        config.fan_out,
        config.max_cluster_size,
    )
    .build(&matrix);

    let mut survivors = Vec::with_capacity(global.len());
    let mut duplicates = Vec::new();
    for cluster in &global {
        survivors.push(cluster.seed());
        let kept = matrix.key(cluster.seed());
        duplicates.extend(cluster.members[1..].iter().map(|&m| DuplicateRecord {
            key: matrix.key(m).clone(),
            kept: kept.clone(),
        }));
    }
    stats.global_clusters = global.len();
    stats.global_survivors = survivors.len();
    stats.duplicates_removed = duplicates.len();
    info!(
        "Global pass: {} of {} items survive ({} near-duplicates)",
        survivors.len(),
        matrix.len(),
        duplicates.len()
    );

    let groups = partition(&matrix, &survivors);
    stats.groups = groups.len();
    let partitioner = GroupPartitioner::from_config(config);

    let mut selections = Vec::new();
    for group in &groups {
        let outcome = partitioner.select(&matrix, group, rng);
        stats.backfilled += outcome.backfilled;
        selections.extend(outcome.selections);
    }
    for record in &selections {
        match record.selection {
            SelectionType::OneOff => stats.one_off += 1,
            SelectionType::SmallCollection => stats.small_collection += 1,
            SelectionType::RepresentativeSample => stats.representative_sample += 1,
        }
    }
    info!(
        "Selected {} items from {} groups ({} one-off, {} small collection, {} sampled)",
        selections.len(),
        groups.len(),
        stats.one_off,
        stats.small_collection,
        stats.representative_sample
    );

    let mut guard = DedupGuard::new();
    let report = Assembler::new(config.max_name_attempts)
        .with_flat(config.flat_collection)
        .assemble(&selections, &mut guard);
    stats.placed = report.placements.len();
    stats.skipped_placements = report.skipped.len();

    Ok(Curation {
        params: config.clone(),
        stats,
        selections,
        placements: report.placements,
        skipped: report.skipped,
        duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Bucket;
    use std::collections::HashSet;

    /// A collection of three folders:
    /// - `rare/`: 3 unrelated images
    /// - `set/`: 8 unrelated images
    /// - `bulk/`: 120 images made of 40 near-identical triples
    fn collection() -> (Vec<ItemKey>, EmbeddingCache) {
        let dim = 200;
        let mut axis = 0;
        let mut next_axis = || {
            axis += 1;
            axis - 1
        };
        let mut keys = Vec::new();
        let mut cache = EmbeddingCache::new();
        let mut add = |key: String, axis: usize, jitter: f32| {
            let mut v = vec![0.0; dim];
            v[axis] = 1.0;
            v[dim - 1] = jitter;
            cache.put(key.clone(), v);
            keys.push(key);
        };

        for i in 0..3 {
            add(format!("rare/{}.jpg", i), next_axis(), 0.0);
        }
        for i in 0..8 {
            add(format!("set/{}.jpg", i), next_axis(), 0.0);
        }
        for t in 0..40 {
            let a = next_axis();
            for copy in 0..3 {
                add(format!("bulk/t{:02}_{}.jpg", t, copy), a, copy as f32 * 0.001);
            }
        }
        (keys, cache)
    }

    fn config() -> CurateConfig {
        CurateConfig {
            seed: Some(9),
            ..CurateConfig::default()
        }
    }

    #[test]
    fn test_full_run() {
        let (keys, cache) = collection();
        let curation = curate_seeded(&keys, &cache, &config()).unwrap();
        let stats = &curation.stats;

        assert_eq!(stats.items, 131);
        assert_eq!(stats.embedded, 131);
        assert_eq!(stats.global_survivors, 3 + 8 + 40);
        assert_eq!(stats.duplicates_removed, 80);
        assert_eq!(stats.groups, 3);
        assert_eq!(stats.one_off, 3);
        assert_eq!(stats.small_collection, 8);
        // bulk: 40 survivors, target clamp(40 / 8, 15, 50) = 15.
        assert_eq!(stats.representative_sample, 15);
        assert_eq!(stats.backfilled, 0);
        assert_eq!(stats.placed, 26);

        let placed: HashSet<&str> = curation.placements.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(placed.len(), curation.placements.len());
        assert!(curation
            .duplicates
            .iter()
            .all(|d| d.kept.ends_with("_0.jpg") && !placed.contains(d.key.as_str())));
    }

    #[test]
    fn test_flat_collection_doubles_placements() {
        let (keys, cache) = collection();
        let cfg = CurateConfig {
            flat_collection: true,
            ..config()
        };
        let curation = curate_seeded(&keys, &cache, &cfg).unwrap();
        let flat: Vec<&Placement> = curation
            .placements
            .iter()
            .filter(|p| p.bucket == Bucket::Flat)
            .collect();
        assert_eq!(flat.len(), 26);
        assert_eq!(curation.stats.placed, 52);
        assert!(flat.iter().all(|p| p.destination.starts_with("flat/")));
    }

    #[test]
    fn test_missing_embeddings_are_skipped() {
        let (mut keys, cache) = collection();
        keys.push("rare/unembedded.jpg".to_string());
        let curation = curate_seeded(&keys, &cache, &config()).unwrap();
        assert_eq!(curation.stats.missing_embeddings, 1);
        assert_eq!(curation.stats.one_off, 3);
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let (keys, cache) = collection();
        // Everything in a group merges at -1.0, so `bulk` refines to 10
        // clusters of 4 and needs 5 backfilled items to reach 15.
        let cfg = CurateConfig {
            group_threshold: -1.0,
            ..config()
        };
        let a = curate_seeded(&keys, &cache, &cfg).unwrap();
        let b = curate_seeded(&keys, &cache, &cfg).unwrap();
        assert_eq!(a.selections, b.selections);
        assert_eq!(a.placements, b.placements);
        assert_eq!(a.stats.backfilled, 5);
        assert_eq!(a.stats.representative_sample, 15);
        assert_eq!(a.params.seed, Some(9));
    }

    #[test]
    fn test_unseeded_run_records_seed() {
        let (keys, cache) = collection();
        let curation = curate_seeded(&keys, &cache, &CurateConfig::default()).unwrap();
        assert!(curation.params.seed.is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (keys, cache) = collection();
        let cfg = CurateConfig {
            fan_out: 0,
            ..config()
        };
        assert!(curate_seeded(&keys, &cache, &cfg).is_err());
    }

    #[test]
    fn test_empty_input() {
        let curation = curate_seeded(&[], &EmbeddingCache::new(), &config()).unwrap();
        assert_eq!(curation.stats, CurationStats::default());
        assert!(curation.selections.is_empty());
    }
}
