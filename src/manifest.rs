use crate::assembly::{Placement, SkippedPlacement};
use crate::config::CurateConfig;
use crate::partition::SelectionRecord;
use crate::pipeline::{CurationStats, DuplicateRecord};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything one curation run decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generated_at: String,
    pub params: CurateConfig,
    pub stats: CurationStats,
    pub selections: Vec<SelectionRecord>,
    pub placements: Vec<Placement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedPlacement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<DuplicateRecord>,
}

impl Manifest {
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Pretty-printed JSON, written through a temp file and renamed into place.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| ManifestError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Bucket;
    use crate::partition::SelectionType;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        Manifest {
            generated_at: "2025-01-01T00:00:00+00:00".to_string(),
            params: CurateConfig {
                seed: Some(5),
                ..CurateConfig::default()
            },
            stats: CurationStats {
                items: 1,
                one_off: 1,
                placed: 1,
                ..CurationStats::default()
            },
            selections: vec![SelectionRecord {
                key: "a/1.jpg".to_string(),
                group_id: 0,
                group_name: "a".to_string(),
                selection: SelectionType::OneOff,
                backfilled: false,
            }],
            placements: vec![Placement {
                key: "a/1.jpg".to_string(),
                bucket: Bucket::Rare("a".to_string()),
                destination: "rare/a/1.jpg".to_string(),
            }],
            skipped: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    #[test]
    fn test_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("manifest.json");

        let manifest = sample_manifest();
        manifest.write(&path).unwrap();
        assert_eq!(Manifest::read(&path).unwrap(), manifest);
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(sample_manifest()).unwrap();
        assert_eq!(value["selections"][0]["type"], "one_off");
        assert_eq!(value["placements"][0]["bucket"]["kind"], "rare");
        assert_eq!(value["params"]["seed"], 5);
        assert!(value.get("duplicates").is_none());
        assert!(value["selections"][0].get("backfilled").is_none());
    }
}
