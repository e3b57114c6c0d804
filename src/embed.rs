//! Embedding providers and batched cache filling.
//!
//! This is the only stage that runs in parallel. Items are embedded in
//! batches with rayon; after every batch the cache is checkpointed to disk
//! and the cancellation flag is checked, so an interrupted run keeps all the
//! work it finished.
//!
//! When a thumbnail tree mirrors the collection, thumbnails are embedded in
//! place of the originals and the vectors are stored under the original keys.

use crate::ItemKey;
use crate::cache::{CacheError, EmbeddingCache};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Embedding has dimension {actual}, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Progress display error: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

/// Source of unit-norm vectors for items on disk.
pub trait EmbeddingProvider: Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError>;
}

/// Largest accepted hash grid edge.
pub const MAX_HASH_SIDE: u32 = 64;

/// Extensions tried for a thumbnail whose name differs from the original's.
const THUMBNAIL_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "webp", "png"];

/// Embeds an image as its gradient perceptual hash, one ±1 component per
/// bit, scaled to unit length. The cosine similarity of two such vectors is
/// `1 - 2 * hamming / bits`.
pub struct PerceptualEmbedder {
    hasher: Hasher,
    bits: usize,
}

impl PerceptualEmbedder {
    /// `side` is the hash grid edge, clamped to `2..=MAX_HASH_SIDE`; the
    /// vector has `side * side` components rounded up to a whole byte.
    pub fn new(side: u32) -> Self {
        let side = side.clamp(2, MAX_HASH_SIDE);
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Gradient)
            .hash_size(side, side)
            .to_hasher();
        let bits = ((side * side) as usize).div_ceil(8) * 8;
        Self { hasher, bits }
    }

    pub fn embed_image(&self, image: &image::DynamicImage) -> Vec<f32> {
        let hash = self.hasher.hash_image(image);
        let scale = 1.0 / (self.bits as f32).sqrt();
        let mut vector = Vec::with_capacity(self.bits);
        for byte in hash.as_bytes() {
            for bit in 0..8 {
                let on = byte & (1 << bit) != 0;
                vector.push(if on { scale } else { -scale });
            }
        }
        vector.resize(self.bits, -scale);
        vector
    }
}

impl Default for PerceptualEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

impl EmbeddingProvider for PerceptualEmbedder {
    fn dimension(&self) -> usize {
        self.bits
    }

    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let image = image::open(path)?;
        Ok(self.embed_image(&image))
    }
}

#[derive(Debug, Clone)]
pub struct FillOptions {
    pub batch_size: usize,
    /// Where to save the cache after each batch.
    pub checkpoint: Option<PathBuf>,
    /// Root of a thumbnail tree mirroring the collection.
    pub thumbnails: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            batch_size: 256,
            checkpoint: None,
            thumbnails: None,
            show_progress: false,
        }
    }
}

/// File to embed for `key`: its thumbnail under `thumbnails` when one
/// exists (same relative path, or same stem with a common image extension),
/// otherwise the original under `root`.
pub fn embedding_source(root: &Path, thumbnails: Option<&Path>, key: &str) -> PathBuf {
    if let Some(thumbs) = thumbnails {
        let exact = thumbs.join(key);
        if exact.is_file() {
            return exact;
        }
        for ext in THUMBNAIL_EXTENSIONS {
            let candidate = exact.with_extension(ext);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    root.join(key)
}

#[derive(Debug, Default)]
pub struct FillReport {
    pub requested: usize,
    pub already_cached: usize,
    pub computed: usize,
    pub failed: Vec<(ItemKey, String)>,
    pub cancelled: bool,
}

/// Embed every key in `keys` that `cache` does not hold yet. Files are
/// resolved with [`embedding_source`]. Per-item failures are collected in
/// the report. The call fails only when a checkpoint write fails or the
/// provider's dimension differs from the cache's.
pub fn fill_cache<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    root: &Path,
    keys: &[ItemKey],
    cache: &mut EmbeddingCache,
    options: &FillOptions,
    cancel: &AtomicBool,
) -> Result<FillReport, EmbedError> {
    let expected = provider.dimension();
    if let Some(dim) = cache.dimension().filter(|&d| d != expected) {
        return Err(EmbedError::Dimension {
            expected: dim,
            actual: expected,
        });
    }

    let missing: Vec<&ItemKey> = keys.iter().filter(|k| !cache.contains(k)).collect();
    let mut report = FillReport {
        requested: keys.len(),
        already_cached: keys.len() - missing.len(),
        ..FillReport::default()
    };
    if missing.is_empty() {
        info!("All {} embeddings found in cache", keys.len());
        return Ok(report);
    }
    info!("Computing {} new embeddings", missing.len());

    let progress = if options.show_progress {
        let bar = ProgressBar::new(missing.len() as u64);
        bar.set_style(ProgressStyle::with_template(
            "{spinner:.green} Embedding [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )?);
        bar
    } else {
        ProgressBar::hidden()
    };

    let thumbnails = options.thumbnails.as_deref();
    for batch in missing.chunks(options.batch_size.max(1)) {
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            break;
        }

        let results: Vec<(&ItemKey, Result<Vec<f32>, EmbedError>)> = batch
            .par_iter()
            .map(|&key| {
                let source = embedding_source(root, thumbnails, key);
                let result = provider.embed(&source).and_then(|v| {
                    if v.len() == expected {
                        Ok(v)
                    } else {
                        Err(EmbedError::Dimension {
                            expected,
                            actual: v.len(),
                        })
                    }
                });
                (key, result)
            })
            .collect();

        for (key, result) in results {
            match result {
                Ok(vector) => {
                    if cache.put(key.clone(), vector) {
                        report.computed += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to embed {}: {}", key, e);
                    report.failed.push((key.clone(), e.to_string()));
                }
            }
        }
        progress.inc(batch.len() as u64);

        if let Some(path) = &options.checkpoint {
            cache.save(path)?;
        }
    }

    if report.cancelled {
        progress.abandon_with_message("cancelled");
        info!(
            "Embedding cancelled after {} new vectors; cache kept",
            report.computed
        );
    } else {
        progress.finish();
    }
    Ok(report)
}
