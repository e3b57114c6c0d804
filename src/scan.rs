use crate::ItemKey;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Component, Path};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Progress display error: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    /// Top-level directory names to leave out (output folders, thumbnails).
    pub exclude_dirs: Vec<String>,
    pub show_progress: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: ["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_dirs: vec!["thumbnails".to_string(), "_curated".to_string()],
            show_progress: false,
        }
    }
}

/// Recursively collect image files under `root` as sorted, `/`-separated
/// keys relative to `root`.
pub fn scan_collection(root: &Path, options: &ScanOptions) -> Result<Vec<ItemKey>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::InvalidPath {
            path: root.display().to_string(),
        });
    }

    let spinner = if options.show_progress {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
        spinner.set_message("Scanning for images…");
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    } else {
        ProgressBar::hidden()
    };

    let excluded = |entry: &DirEntry| {
        entry.depth() == 1
            && entry.file_type().is_dir()
            && options
                .exclude_dirs
                .iter()
                .any(|name| entry.file_name().to_string_lossy() == name.as_str())
    };

    let mut keys = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !excluded(e)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_allowed_extension(entry.path(), options) {
            continue;
        }
        match entry.path().strip_prefix(root) {
            Ok(relative) => keys.push(to_key(relative)),
            Err(_) => debug!("{} is outside {}", entry.path().display(), root.display()),
        }
        spinner.tick();
    }
    keys.sort();

    spinner.finish_with_message(format!("Found {} images", keys.len()));
    Ok(keys)
}

fn has_allowed_extension(path: &Path, options: &ScanOptions) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| options.extensions.contains(&ext.to_lowercase()))
        .unwrap_or(false)
}

/// `/`-joined form of a relative path, independent of the host separator.
pub fn to_key(relative: &Path) -> ItemKey {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(root, "b/2.JPG");
        touch(root, "a/deep/1.png");
        touch(root, "a/notes.txt");
        touch(root, "top.webp");
        touch(root, "thumbnails/a/1.jpg");
        touch(root, "a/thumbnails/kept.jpg");

        let keys = scan_collection(root, &ScanOptions::default()).unwrap();
        assert_eq!(
            keys,
            vec!["a/deep/1.png", "a/thumbnails/kept.jpg", "b/2.JPG", "top.webp"]
        );
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let keys = scan_collection(temp_dir.path(), &ScanOptions::default()).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_scan_rejects_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result = scan_collection(&temp_dir.path().join("nope"), &ScanOptions::default());
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_to_key_uses_forward_slashes() {
        let relative: std::path::PathBuf = ["artist", "set", "img.png"].iter().collect();
        assert_eq!(to_key(&relative), "artist/set/img.png");
    }
}
