//! Near-duplicate removal and diversity sampling for large image collections.
//!
//! Vectors come from an [`EmbeddingCache`]; [`pipeline::curate`] clusters them
//! collection-wide, refines each top-level folder, samples oversized folders
//! with farthest-point sampling and assembles a duplicate-free placement list.

pub mod apply;
pub mod assembly;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod embed;
pub mod index;
pub mod manifest;
pub mod matrix;
pub mod partition;
pub mod pipeline;
pub mod sampler;
pub mod scan;

/// Path of a source item relative to the collection root, `/`-separated.
pub type ItemKey = String;

pub use assembly::{Assembler, Bucket, DedupGuard, Placement};
pub use cache::EmbeddingCache;
pub use cluster::{Cluster, ClusterBuilder};
pub use config::CurateConfig;
pub use embed::{EmbeddingProvider, PerceptualEmbedder};
pub use index::SimilarityIndex;
pub use manifest::Manifest;
pub use matrix::VectorMatrix;
pub use partition::{GroupPartitioner, SelectionRecord, SelectionType};
pub use pipeline::{Curation, curate, curate_seeded};
