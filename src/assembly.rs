//! Turns selections into destination placements.
//!
//! Pure decisions only: nothing here touches the filesystem. Every source key
//! is placed at most once per run, and destination names are made unique
//! with a bounded numeric suffix search.

use crate::ItemKey;
use crate::partition::{SelectionRecord, SelectionType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Keys already emitted during the run.
#[derive(Debug, Default)]
pub struct DedupGuard {
    emitted: HashSet<ItemKey>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert. Returns false if `key` was already emitted.
    pub fn claim(&mut self, key: &str) -> bool {
        if self.emitted.contains(key) {
            return false;
        }
        self.emitted.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.emitted.contains(key)
    }

    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "group", rename_all = "snake_case")]
pub enum Bucket {
    Rare(String),
    Collection(String),
    Sample(String),
    /// One folder for every selection across all groups.
    Flat,
}

impl Bucket {
    pub fn for_selection(record: &SelectionRecord) -> Self {
        let group = record.group_name.clone();
        match record.selection {
            SelectionType::OneOff => Bucket::Rare(group),
            SelectionType::SmallCollection => Bucket::Collection(group),
            SelectionType::RepresentativeSample => Bucket::Sample(group),
        }
    }

    /// Directory relative to the output root, `/`-separated.
    pub fn dir(&self) -> String {
        match self {
            Bucket::Rare(group) => format!("rare/{}", group),
            Bucket::Collection(group) => format!("collections/{}", group),
            Bucket::Sample(group) => format!("samples/{}", group),
            Bucket::Flat => "flat".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub key: ItemKey,
    pub bucket: Bucket,
    /// Destination relative to the output root, `/`-separated.
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPlacement {
    pub key: ItemKey,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AssemblyReport {
    pub placements: Vec<Placement>,
    pub skipped: Vec<SkippedPlacement>,
    /// Records dropped because their key had already been placed.
    pub repeats: usize,
}

pub struct Assembler {
    max_name_attempts: usize,
    flat: bool,
    /// Lowercased destinations already handed out, so names stay unique on
    /// case-insensitive filesystems too.
    taken: HashSet<String>,
}

impl Assembler {
    pub fn new(max_name_attempts: usize) -> Self {
        Self {
            max_name_attempts,
            flat: false,
            taken: HashSet::new(),
        }
    }

    /// Give every placed item a second placement in [`Bucket::Flat`].
    pub fn with_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    /// Mark `destination` as unavailable, e.g. because a file already exists there.
    pub fn reserve(&mut self, destination: &str) {
        self.taken.insert(destination.to_lowercase());
    }

    pub fn assemble(
        &mut self,
        records: &[SelectionRecord],
        guard: &mut DedupGuard,
    ) -> AssemblyReport {
        let mut report = AssemblyReport::default();

        for record in records {
            if !guard.claim(&record.key) {
                debug!("{} already placed; ignoring repeat selection", record.key);
                report.repeats += 1;
                continue;
            }

            let bucket = Bucket::for_selection(record);
            if !self.place(&record.key, bucket, &mut report) || !self.flat {
                continue;
            }
            self.place(&record.key, Bucket::Flat, &mut report);
        }

        report
    }

    fn place(&mut self, key: &str, bucket: Bucket, report: &mut AssemblyReport) -> bool {
        match self.allocate(&bucket.dir(), file_name(key)) {
            Some(destination) => {
                report.placements.push(Placement {
                    key: key.to_string(),
                    bucket,
                    destination,
                });
                true
            }
            None => {
                warn!(
                    "No free name in {} for {} after {} attempts; skipping",
                    bucket.dir(),
                    key,
                    self.max_name_attempts
                );
                report.skipped.push(SkippedPlacement {
                    key: key.to_string(),
                    reason: format!(
                        "name collision in {} not resolved after {} attempts",
                        bucket.dir(),
                        self.max_name_attempts
                    ),
                });
                false
            }
        }
    }

    fn allocate(&mut self, dir: &str, name: &str) -> Option<String> {
        let first = format!("{}/{}", dir, name);
        if self.taken.insert(first.to_lowercase()) {
            return Some(first);
        }

        let path = Path::new(name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

        for n in 1..=self.max_name_attempts {
            let candidate = match &ext {
                Some(ext) => format!("{}/{}_{}.{}", dir, stem, n, ext),
                None => format!("{}/{}_{}", dir, stem, n),
            };
            if self.taken.insert(candidate.to_lowercase()) {
                return Some(candidate);
            }
        }
        None
    }
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
