//! Persistent ItemKey → embedding store.
//!
//! The cache only ever grows: a key that already has a vector keeps it, both
//! when a provider offers a new one and when a file is merged in. Saving goes
//! through a temporary file in the target directory followed by a rename, so
//! an interrupted run leaves either the old file or the new one on disk.
//!
//! All vectors in one cache share a dimension, fixed by the first vector
//! that goes in.

use crate::ItemKey;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed embedding file: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Embedding for {key} has dimension {actual}, expected {expected}")]
    Dimension {
        key: ItemKey,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Default, Clone)]
pub struct EmbeddingCache {
    entries: BTreeMap<ItemKey, Vec<f32>>,
    dim: Option<usize>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the cache at `path`. A missing, unreadable or corrupt file
    /// yields an empty cache.
    pub fn open(path: &Path) -> Self {
        let mut cache = Self::new();
        cache.load(path);
        cache
    }

    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Shared vector length, `None` until the first insert.
    pub fn dimension(&self) -> Option<usize> {
        self.dim
    }

    /// Insert `vector` unless `key` already has one. Returns whether the
    /// entry was added.
    pub fn put(&mut self, key: ItemKey, vector: Vec<f32>) -> bool {
        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            warn!("Refusing to cache non-finite or empty vector for {}", key);
            return false;
        }
        if let Some(dim) = self.dim.filter(|&d| d != vector.len()) {
            warn!(
                "Refusing {}-d vector for {}; cache holds {}-d vectors",
                vector.len(),
                key,
                dim
            );
            return false;
        }
        if self.entries.contains_key(&key) {
            return false;
        }
        self.dim = Some(vector.len());
        self.entries.insert(key, vector);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.entries.keys()
    }

    /// Merge the persisted entries at `path` into memory. In-memory entries
    /// win over persisted ones. Failures are logged and treated as an empty
    /// file. Returns the number of entries added.
    pub fn load(&mut self, path: &Path) -> usize {
        if !path.exists() {
            debug!("No embedding cache at {}; starting empty", path.display());
            return 0;
        }
        match read_entries(path) {
            Ok(mut entries) => {
                let dim = self.dim.or_else(|| majority_dimension(&entries));
                let before = entries.len();
                entries.retain(|_, v| Some(v.len()) == dim);
                if entries.len() < before {
                    warn!(
                        "Skipped {} cached vector(s) in {} whose dimension is not {}",
                        before - entries.len(),
                        path.display(),
                        dim.unwrap_or_default()
                    );
                }
                let added = self.absorb(entries);
                info!(
                    "Loaded embedding cache {} ({} new, {} total)",
                    path.display(),
                    added,
                    self.len()
                );
                added
            }
            Err(e) => {
                warn!(
                    "Embedding cache {} is unreadable, treating it as empty: {}",
                    path.display(),
                    e
                );
                0
            }
        }
    }

    /// Merge vectors produced elsewhere (e.g. by an external model). Unlike
    /// [`load`](Self::load) a bad file is an error, since the caller asked
    /// for it explicitly. A file whose vectors disagree in dimension with
    /// each other or with the cache is refused as a whole.
    pub fn import(&mut self, path: &Path) -> Result<usize, CacheError> {
        let entries = read_entries(path)?;
        let mut dim = self.dim;
        for (key, vector) in &entries {
            let expected = *dim.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(CacheError::Dimension {
                    key: key.clone(),
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(self.absorb(entries))
    }

    /// Atomically replace `path` with the full current map.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &self.entries)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;

        debug!("Saved {} embeddings to {}", self.len(), path.display());
        Ok(())
    }

    fn absorb(&mut self, entries: BTreeMap<ItemKey, Vec<f32>>) -> usize {
        let mut added = 0;
        for (key, vector) in entries {
            if self.put(key, vector) {
                added += 1;
            }
        }
        added
    }
}

/// Most common vector length in `entries`; ties go to the smaller length.
fn majority_dimension(entries: &BTreeMap<ItemKey, Vec<f32>>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for vector in entries.values() {
        *counts.entry(vector.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .rev()
        .max_by_key(|&(_, count)| count)
        .map(|(dim, _)| dim)
}

fn read_entries(path: &Path) -> Result<BTreeMap<ItemKey, Vec<f32>>, CacheError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_never_overwrites() {
        let mut cache = EmbeddingCache::new();
        assert!(cache.put("a/1.jpg".to_string(), vec![1.0, 0.0]));
        assert!(!cache.put("a/1.jpg".to_string(), vec![0.0, 1.0]));
        assert_eq!(cache.get("a/1.jpg"), Some(&[1.0, 0.0][..]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_rejects_empty_vector() {
        let mut cache = EmbeddingCache::new();
        assert!(!cache.put("x.png".to_string(), Vec::new()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cache.json");

        let mut cache = EmbeddingCache::new();
        cache.put("b.jpg".to_string(), vec![0.6, 0.8]);
        cache.put("a.jpg".to_string(), vec![1.0, 0.0]);
        cache.save(&path).unwrap();

        let reopened = EmbeddingCache::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("b.jpg"), Some(&[0.6, 0.8][..]));

        // Only the cache file itself is left behind, no temp files.
        let files: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_load_keeps_unsaved_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        fs::write(&path, r#"{"a.jpg": [0.0, 1.0], "b.jpg": [1.0, 0.0]}"#).unwrap();

        let mut cache = EmbeddingCache::new();
        cache.put("a.jpg".to_string(), vec![1.0, 0.0]);
        cache.put("c.jpg".to_string(), vec![0.0, 1.0]);

        let added = cache.load(&path);
        assert_eq!(added, 1);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a.jpg"), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn test_corrupt_cache_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        fs::write(&path, "{ this is not json").unwrap();

        let cache = EmbeddingCache::open(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::open(&temp_dir.path().join("absent.json"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_import_surfaces_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("external.json");
        fs::write(&path, "[1, 2, 3]").unwrap();

        let mut cache = EmbeddingCache::new();
        assert!(matches!(cache.import(&path), Err(CacheError::Format(_))));

        fs::write(&path, r#"{"k.jpg": [0.5, 0.5]}"#).unwrap();
        assert_eq!(cache.import(&path).unwrap(), 1);
        assert_eq!(cache.import(&path).unwrap(), 0);
    }

    #[test]
    fn test_put_rejects_other_dimension() {
        let mut cache = EmbeddingCache::new();
        assert_eq!(cache.dimension(), None);
        assert!(cache.put("a.jpg".to_string(), vec![1.0, 0.0]));
        assert!(!cache.put("b.jpg".to_string(), vec![1.0, 0.0, 0.0]));
        assert_eq!(cache.dimension(), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_load_keeps_majority_dimension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        let mut mixed: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        mixed.insert("a/stray.jpg".to_string(), vec![1.0, 0.0, 0.0]);
        for i in 0..100 {
            mixed.insert(format!("b/{:03}.jpg", i), vec![1.0, i as f32]);
        }
        fs::write(&path, serde_json::to_string(&mixed).unwrap()).unwrap();

        let cache = EmbeddingCache::open(&path);
        assert_eq!(cache.dimension(), Some(2));
        assert_eq!(cache.len(), 100);
        assert!(!cache.contains("a/stray.jpg"));
    }

    #[test]
    fn test_import_refuses_mixed_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("external.json");

        let mut cache = EmbeddingCache::new();
        cache.put("a.jpg".to_string(), vec![1.0, 0.0]);

        fs::write(&path, r#"{"b.jpg": [0.5, 0.5, 0.5]}"#).unwrap();
        assert!(matches!(
            cache.import(&path),
            Err(CacheError::Dimension {
                expected: 2,
                actual: 3,
                ..
            })
        ));

        fs::write(&path, r#"{"c.jpg": [0.5, 0.5], "d.jpg": [1.0]}"#).unwrap();
        assert!(cache.import(&path).is_err());
        assert_eq!(cache.len(), 1);
    }
}
