use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cullset::apply::{self, ApplyMode, RestoreSelection};
use cullset::embed::{self, FillOptions, PerceptualEmbedder};
use cullset::scan::{self, ScanOptions};
use cullset::{CurateConfig, EmbeddingCache, Manifest, curate_seeded};
use dialoguer::Confirm;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cullset",
    version,
    about = "Remove near-duplicates and sample large image collections"
)]
struct Cli {
    /// More log output (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute missing perceptual embeddings into the cache
    Embed {
        /// Collection root
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,
        /// Cache file (default: `<root>/embeddings_cache.json`)
        #[arg(long, value_name = "FILE")]
        cache: Option<PathBuf>,
        /// Images per batch; the cache is saved after each one
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
        /// Perceptual hash grid edge
        #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u32).range(2..=64))]
        hash_size: u32,
        /// Thumbnail tree mirroring the collection (default: `<root>/thumbnails` if present)
        #[arg(long, value_name = "DIR")]
        thumbs: Option<PathBuf>,
    },

    /// Merge vectors from an external `{key: [floats]}` file into the cache
    Import {
        /// File to merge
        #[arg(long, value_name = "FILE")]
        from: PathBuf,
        /// Cache file to grow
        #[arg(long, value_name = "FILE", default_value = "embeddings_cache.json")]
        cache: PathBuf,
    },

    /// Deduplicate, refine and sample; write a manifest
    Curate {
        /// Collection root
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,
        /// Cache file (default: `<root>/embeddings_cache.json`)
        #[arg(long, value_name = "FILE")]
        cache: Option<PathBuf>,
        /// Manifest to write (default: `<root>/_curated/manifest.json`)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// TOML settings file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Backfill seed
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        global_threshold: Option<f32>,
        #[arg(long)]
        group_threshold: Option<f32>,
        /// Neighbors examined per item
        #[arg(long)]
        fan_out: Option<usize>,
        /// Largest near-duplicate cluster
        #[arg(long)]
        max_cluster: Option<usize>,
        /// Also place every selection in one flat folder
        #[arg(long)]
        flat: bool,
    },

    /// Copy or move the manifest's placements into an output folder
    Apply {
        #[arg(short, long, value_name = "FILE")]
        manifest: PathBuf,
        /// Collection root the manifest keys are relative to
        #[arg(short, long, value_name = "DIR")]
        root: PathBuf,
        /// Output folder (default: `<root>/_curated`)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,
        /// Move instead of copy
        #[arg(long = "move")]
        move_files: bool,
        /// Only show what would happen
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt for moves
        #[arg(short, long)]
        yes: bool,
    },

    /// Work with the move history of an output folder
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List recorded move runs
    List {
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,
    },

    /// Move files back to the collection
    Restore {
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,
        /// Restore a specific run index
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore every run
        #[arg(long, conflicts_with = "record")]
        all: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Embed {
            root,
            cache,
            batch_size,
            hash_size,
            thumbs,
        } => {
            let cache_path = cache.unwrap_or_else(|| default_cache_path(&root));
            let thumbnails = thumbs.or_else(|| {
                let candidate = root.join("thumbnails");
                candidate.is_dir().then_some(candidate)
            });
            println!("▶ Embedding images in: {}", root.display());

            let keys = scan::scan_collection(
                &root,
                &ScanOptions {
                    show_progress: true,
                    ..ScanOptions::default()
                },
            )?;
            let mut cache = EmbeddingCache::open(&cache_path);
            if let Some(dir) = &thumbnails {
                println!("   🖼️  Using thumbnails from: {}", dir.display());
            }
            let options = FillOptions {
                batch_size,
                checkpoint: Some(cache_path.clone()),
                thumbnails,
                show_progress: true,
            };
            let cancel = cancel_on_ctrlc();

            let report = benchmark("embedding", || {
                embed::fill_cache(
                    &PerceptualEmbedder::new(hash_size),
                    &root,
                    &keys,
                    &mut cache,
                    &options,
                    &cancel,
                )
            })?;
            cache
                .save(&cache_path)
                .with_context(|| format!("Failed to save cache {:?}", cache_path))?;

            if report.cancelled {
                println!(
                    "⏹ Cancelled; {} new embedding(s) saved to {}",
                    report.computed,
                    cache_path.display()
                );
                return Ok(());
            }
            println!(
                "✅ {} cached, {} computed, {} failed → {}",
                report.already_cached,
                report.computed,
                report.failed.len(),
                cache_path.display()
            );
            for (key, err) in &report.failed {
                eprintln!("⚠️  {}: {}", key, err);
            }
        }

        Commands::Import { from, cache } => {
            let mut store = EmbeddingCache::open(&cache);
            let added = store
                .import(&from)
                .with_context(|| format!("Failed to import {:?}", from))?;
            store
                .save(&cache)
                .with_context(|| format!("Failed to save cache {:?}", cache))?;
            println!(
                "✅ Imported {} new vector(s); cache now holds {}",
                added,
                store.len()
            );
        }

        Commands::Curate {
            root,
            cache,
            output,
            config,
            seed,
            global_threshold,
            group_threshold,
            fan_out,
            max_cluster,
            flat,
        } => {
            let mut settings = CurateConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            settings.seed = seed.or(settings.seed);
            settings.global_threshold = global_threshold.unwrap_or(settings.global_threshold);
            settings.group_threshold = group_threshold.unwrap_or(settings.group_threshold);
            settings.fan_out = fan_out.unwrap_or(settings.fan_out);
            settings.max_cluster_size = max_cluster.unwrap_or(settings.max_cluster_size);
            settings.flat_collection |= flat;

            let cache_path = cache.unwrap_or_else(|| default_cache_path(&root));
            let output = output.unwrap_or_else(|| default_dest(&root).join("manifest.json"));
            println!("▶ Curating: {}", root.display());

            let keys = scan::scan_collection(
                &root,
                &ScanOptions {
                    show_progress: true,
                    ..ScanOptions::default()
                },
            )?;
            let store = EmbeddingCache::open(&cache_path);
            let curation = benchmark("curation", || curate_seeded(&keys, &store, &settings))?;

            let stats = curation.stats.clone();
            curation
                .into_manifest()
                .write(&output)
                .with_context(|| format!("Failed to write manifest {:?}", output))?;

            println!("   🖼️  {} images, {} embedded", stats.items, stats.embedded);
            if stats.missing_embeddings > 0 {
                println!(
                    "   ⚠️  {} without embeddings (run `cullset embed` first)",
                    stats.missing_embeddings
                );
            }
            println!(
                "   🧹 {} near-duplicates removed, {} survivors in {} groups",
                stats.duplicates_removed, stats.global_survivors, stats.groups
            );
            println!(
                "   🏆 {} one-off, {} small collection, {} sampled ({} backfilled)",
                stats.one_off, stats.small_collection, stats.representative_sample, stats.backfilled
            );
            println!("\n✅ Manifest written to {}", output.display());
        }

        Commands::Apply {
            manifest,
            root,
            dest,
            move_files,
            dry_run,
            yes,
        } => {
            let manifest = Manifest::read(&manifest)
                .with_context(|| format!("Could not read manifest {:?}", manifest))?;
            let dest = dest.unwrap_or_else(|| default_dest(&root));
            let mode = if move_files {
                ApplyMode::Move
            } else {
                ApplyMode::Copy
            };

            if mode == ApplyMode::Move && !dry_run && !yes {
                let proceed = Confirm::new()
                    .with_prompt(format!(
                        "Move {} file(s) out of {}?",
                        manifest.placements.len(),
                        root.display()
                    ))
                    .default(false)
                    .interact()?;
                if !proceed {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            let report =
                apply::apply_placements(&root, &dest, &manifest.placements, mode, dry_run)?;
            for (key, err) in &report.failed {
                eprintln!("⚠️  {}: {}", key, err);
            }
            if dry_run {
                println!(
                    "\n⚠️  Dry-run only; {} placement(s) would be applied.",
                    report.applied
                );
            } else {
                println!(
                    "\n✅ {} placed into {} ({} already present, {} failed)",
                    report.applied,
                    dest.display(),
                    report.skipped_existing,
                    report.failed.len()
                );
            }
        }

        Commands::History { command } => match command {
            HistoryCmd::List { dest } => {
                let runs = apply::read_history(&dest)?;
                if runs.is_empty() {
                    println!("No move history in {}", dest.display());
                    return Ok(());
                }
                println!("🗂️  Move History:");
                for (i, (run, records)) in runs.iter().enumerate() {
                    println!("[{}] {}: {} file(s)", i, run, records.len());
                }
            }

            HistoryCmd::Restore { dest, record, all } => {
                let selection = match (all, record) {
                    (true, _) => RestoreSelection::All,
                    (false, Some(index)) => RestoreSelection::Index(index),
                    (false, None) => RestoreSelection::Latest,
                };
                let report = apply::restore_history(&dest, selection)?;
                println!(
                    "🔄 Restored {} file(s) from {} run(s), {} skipped",
                    report.restored, report.runs, report.skipped
                );
            }
        },
    }

    Ok(())
}

/// A flag raised by Ctrl-C. Embedding stops after the current batch.
fn cancel_on_ctrlc() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n⏹ Stopping after the current batch…");
        flag.store(true, Ordering::Relaxed);
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }
    cancel
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cullset={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_cache_path(root: &Path) -> PathBuf {
    root.join("embeddings_cache.json")
}

fn default_dest(root: &Path) -> PathBuf {
    root.join("_curated")
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
