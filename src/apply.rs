//! Carries out placements on disk and keeps an undo log for moves.

use crate::ItemKey;
use crate::assembly::{Bucket, Placement};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HISTORY_FILE: &str = ".history.jsonl";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No move history in {path}")]
    NoHistory { path: String },

    #[error("Invalid history index {index}; valid range is 0..{len}")]
    InvalidIndex { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Start time of the apply run the move belongs to.
    pub run: String,
    pub source: String,
    pub destination: String,
    pub action: String,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped_existing: usize,
    pub failed: Vec<(ItemKey, String)>,
}

/// Copy or move every placement from `root` into `dest`. Existing
/// destination files are never overwritten. A failing item is logged and
/// counted; the rest of the batch continues. [`Bucket::Flat`] placements
/// are always copies, made before any source is moved away.
pub fn apply_placements(
    root: &Path,
    dest: &Path,
    placements: &[Placement],
    mode: ApplyMode,
    dry_run: bool,
) -> Result<ApplyReport, ApplyError> {
    let mut report = ApplyReport::default();
    let run = Utc::now().to_rfc3339();

    let mut history = if mode == ApplyMode::Move && !dry_run {
        fs::create_dir_all(dest)?;
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dest.join(HISTORY_FILE))?,
        )
    } else {
        None
    };

    let (flat, bucketed): (Vec<&Placement>, Vec<&Placement>) =
        placements.iter().partition(|p| p.bucket == Bucket::Flat);
    for placement in flat.into_iter().chain(bucketed) {
        let mode = if placement.bucket == Bucket::Flat {
            ApplyMode::Copy
        } else {
            mode
        };
        let source = root.join(&placement.key);
        let target = dest.join(&placement.destination);

        if target.exists() {
            warn!("{} already exists; leaving it alone", target.display());
            report.skipped_existing += 1;
            continue;
        }
        if dry_run {
            debug!("[dry-run] {:?} {} → {}", mode, source.display(), target.display());
            report.applied += 1;
            continue;
        }

        let result = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| match mode {
                ApplyMode::Copy => fs::copy(&source, &target).map(|_| ()),
                ApplyMode::Move => move_file(&source, &target),
            });

        match result {
            Ok(()) => {
                report.applied += 1;
                if let (ApplyMode::Move, Some(out)) = (mode, history.as_mut()) {
                    let record = HistoryRecord {
                        run: run.clone(),
                        source: source.to_string_lossy().into_owned(),
                        destination: target.to_string_lossy().into_owned(),
                        action: "moved".to_string(),
                    };
                    writeln!(out, "{}", serde_json::to_string(&record)?)?;
                }
            }
            Err(e) => {
                warn!("Failed to place {}: {}", placement.key, e);
                report.failed.push((placement.key.clone(), e.to_string()));
            }
        }
    }

    info!(
        "Placed {} item(s), {} already present, {} failed",
        report.applied,
        report.skipped_existing,
        report.failed.len()
    );
    Ok(report)
}

/// Rename, falling back to copy-then-delete across filesystems.
fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(_) if source.is_file() => {
            fs::copy(source, target)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

/// Move runs recorded under `dest`, oldest first. Malformed lines are skipped.
pub fn read_history(dest: &Path) -> Result<Vec<(String, Vec<HistoryRecord>)>, ApplyError> {
    let path = dest.join(HISTORY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(&path)?);

    let mut runs: BTreeMap<String, Vec<HistoryRecord>> = BTreeMap::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(rec) if rec.action == "moved" => runs.entry(rec.run.clone()).or_default().push(rec),
            Ok(_) => {}
            Err(err) => warn!("Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(runs.into_iter().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    Latest,
    Index(usize),
    All,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub runs: usize,
    pub restored: usize,
    pub skipped: usize,
}

/// Move files from the selected runs back to where they came from, then
/// drop them from the history. Entries that could not be restored stay in
/// the history so a later restore can retry them.
pub fn restore_history(
    dest: &Path,
    selection: RestoreSelection,
) -> Result<RestoreReport, ApplyError> {
    let runs = read_history(dest)?;
    if runs.is_empty() {
        return Err(ApplyError::NoHistory {
            path: dest.join(HISTORY_FILE).display().to_string(),
        });
    }

    let chosen: Vec<usize> = match selection {
        RestoreSelection::All => (0..runs.len()).collect(),
        RestoreSelection::Latest => vec![runs.len() - 1],
        RestoreSelection::Index(index) if index < runs.len() => vec![index],
        RestoreSelection::Index(index) => {
            return Err(ApplyError::InvalidIndex {
                index,
                len: runs.len(),
            });
        }
    };

    let mut report = RestoreReport {
        runs: chosen.len(),
        ..RestoreReport::default()
    };
    let mut kept: Vec<&HistoryRecord> = Vec::new();
    for (i, (_, records)) in runs.iter().enumerate() {
        if !chosen.contains(&i) {
            kept.extend(records);
            continue;
        }
        for rec in records {
            let from = PathBuf::from(&rec.destination);
            let to = PathBuf::from(&rec.source);
            if !from.exists() {
                warn!("{} no longer exists; skipping", from.display());
                report.skipped += 1;
                continue;
            }
            if to.exists() {
                warn!("{} is occupied; not restoring over it", to.display());
                report.skipped += 1;
                kept.push(rec);
                continue;
            }
            let result = to
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| move_file(&from, &to));
            match result {
                Ok(()) => {
                    debug!("Restored {} → {}", from.display(), to.display());
                    report.restored += 1;
                }
                Err(e) => {
                    warn!("Failed to restore {}: {}", from.display(), e);
                    report.skipped += 1;
                    kept.push(rec);
                }
            }
        }
    }

    let mut remaining = String::new();
    for rec in kept {
        remaining.push_str(&serde_json::to_string(rec)?);
        remaining.push('\n');
    }
    fs::write(dest.join(HISTORY_FILE), remaining)?;

    Ok(report)
}
