use std::path::{Path, PathBuf};
use std::process;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;

use shotbox::config::LibraryPaths;
use shotbox::errors::Result;
use shotbox::events::LibraryEvent;
use shotbox::index::{ScanOutcome, ScanReport};
use shotbox::lifecycle::{BatchResult, ItemResult};
use shotbox::sidecar::models::{CaptureMetadata, CaptureMethod, SidecarUpdate};
use shotbox::storage::models::IndexedImage;
use shotbox::thumbnail::ThumbnailOptions;
use shotbox::Library;

#[derive(Parser)]
#[command(name = "shotbox", version, about = "A searchable screenshot library")]
struct Cli {
    /// Output results as JSON
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Library root (defaults to ~/Pictures/Screenshots)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the library's screenshots
    Scan {
        /// Directory to scan (defaults to the library root)
        dir: Option<PathBuf>,
    },

    /// Search by file name, tags, notes and OCR text
    Search {
        /// Search query
        query: String,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Add or remove a tag
    Tag {
        /// Image path
        image: PathBuf,

        /// Tag name
        tag: String,

        /// Remove the tag instead of adding
        #[arg(long)]
        remove: bool,
    },

    /// Set the notes of an image
    Note {
        /// Image path
        image: PathBuf,

        /// Note text (empty clears it)
        text: String,
    },

    /// Show an image's metadata
    Show {
        /// Image path
        image: PathBuf,
    },

    /// Move images into the archive
    Archive {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Move archived images back into the library
    Restore {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Move images to the trash, or remove them for good
    Delete {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Unlink instead of trashing
        #[arg(long)]
        permanent: bool,
    },

    /// List images trashed during this session
    RecentDeleted,

    /// Generate (or reuse) a thumbnail
    Thumb {
        /// Image path
        image: PathBuf,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        quality: Option<u8>,
    },

    /// Remove orphaned sidecars and thumbnails
    Cleanup,

    /// Show library statistics
    Stats,
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<usize>,
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        eprintln!("shotbox: {}: {}", level, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        if json {
            eprintln!("{}", serde_json::json!({"error": e.to_string()}));
        } else {
            eprintln!("error: {}", e);
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = match cli.root {
        Some(root) => LibraryPaths::from_base(absolute(&root)?),
        None => LibraryPaths::new()?,
    };
    let json = cli.json;
    let lib = Library::open_at(paths).await?;

    let result = match cli.command {
        None => cmd_search(&lib, "", 20, json).await,
        Some(Commands::Scan { dir }) => cmd_scan(&lib, dir, json).await,
        Some(Commands::Search { query, limit }) => cmd_search(&lib, &query, limit, json).await,
        Some(Commands::Tag { image, tag, remove }) => {
            cmd_tag(&lib, &absolute(&image)?, &tag, remove, json).await
        }
        Some(Commands::Note { image, text }) => {
            cmd_note(&lib, &absolute(&image)?, &text, json).await
        }
        Some(Commands::Show { image }) => cmd_show(&lib, &absolute(&image)?, json).await,
        Some(Commands::Archive { paths }) => {
            let result = lib.lifecycle.archive_many(&absolute_all(&paths)?).await;
            print_batch("Archived", &result, json)
        }
        Some(Commands::Restore { paths }) => {
            let result = lib.lifecycle.restore_many(&absolute_all(&paths)?).await;
            print_batch("Restored", &result, json)
        }
        Some(Commands::Delete { paths, permanent }) => {
            let result = lib
                .lifecycle
                .delete_many(&absolute_all(&paths)?, permanent)
                .await;
            let verb = if permanent { "Deleted" } else { "Trashed" };
            print_batch(verb, &result, json)
        }
        Some(Commands::RecentDeleted) => cmd_recent_deleted(&lib, json).await,
        Some(Commands::Thumb {
            image,
            width,
            height,
            quality,
        }) => {
            let defaults = lib.thumbnail_options();
            let options = ThumbnailOptions {
                width: width.unwrap_or(defaults.width),
                height: height.unwrap_or(defaults.height),
                quality: quality.unwrap_or(defaults.quality),
            };
            cmd_thumb(&lib, &absolute(&image)?, options, json).await
        }
        Some(Commands::Cleanup) => cmd_cleanup(&lib, json).await,
        Some(Commands::Stats) => cmd_stats(&lib, json).await,
    };

    // flush catalog changes even when the command failed
    lib.shutdown().await?;
    result
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn absolute_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| absolute(p)).collect()
}

fn print_status(message: String, removed: Option<usize>, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(&StatusResponse {
                success: true,
                message,
                removed,
            })?
        );
    } else {
        println!("{}", message);
    }
    Ok(())
}

async fn cmd_scan(lib: &Library, dir: Option<PathBuf>, json: bool) -> Result<()> {
    let dir = match dir {
        Some(d) => absolute(&d)?,
        None => lib.paths.save_dir.clone(),
    };

    let index = lib.index.clone();
    if let Err(e) = ctrlc::set_handler(move || index.stop_scan()) {
        log::warn!("could not install Ctrl-C handler, scan cannot be interrupted: {}", e);
    }

    let progress = if json {
        None
    } else {
        let mut rx = lib.events.subscribe();
        Some(tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    LibraryEvent::ScanProgress { processed, total } => {
                        eprint!("\rscanning {}/{}", processed, total);
                    }
                    LibraryEvent::ScanCompleted { .. } | LibraryEvent::ScanAborted { .. } => {
                        eprintln!();
                        break;
                    }
                    _ => {}
                }
            }
        }))
    };

    let report = lib.index.start_scan(&dir).await;
    if let Some(handle) = progress {
        handle.abort();
    }
    let report = report?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    print_scan_report(&report);
    Ok(())
}

fn print_scan_report(report: &ScanReport) {
    match report.outcome {
        ScanOutcome::AlreadyRunning => println!("A scan is already running."),
        ScanOutcome::Aborted => println!(
            "Scan aborted after {}/{} file(s); partial results saved.",
            report.processed, report.total
        ),
        ScanOutcome::Completed => println!(
            "Scanned {} file(s): {} indexed, {} unchanged, {} removed.",
            report.total, report.indexed, report.unchanged, report.pruned
        ),
    }
    for (path, err) in &report.failed {
        println!("  failed: {} ({})", path.display(), err);
    }
}

async fn cmd_search(lib: &Library, query: &str, limit: usize, json: bool) -> Result<()> {
    lib.ensure_scanned().await?;
    let images = lib.index.search(query, limit).await;

    if json {
        println!("{}", serde_json::to_string(&images)?);
        return Ok(());
    }

    if images.is_empty() {
        if query.trim().is_empty() {
            println!("No screenshots found.");
        } else {
            println!("No results for \"{}\".", query);
        }
        return Ok(());
    }

    for image in &images {
        print_image_row(image);
    }
    Ok(())
}

/// Sidecars are created on first edit, never by scanning.
async fn ensure_sidecar(lib: &Library, image: &Path) -> Result<()> {
    if !lib.sidecars.exists(image).await {
        let metadata = CaptureMetadata {
            capture_method: CaptureMethod::Import,
            ..Default::default()
        };
        lib.sidecars
            .create(image, metadata, Default::default(), "", Vec::new())
            .await?;
    }
    Ok(())
}

async fn cmd_tag(lib: &Library, image: &Path, tag: &str, remove: bool, json: bool) -> Result<()> {
    let tags = [tag.to_string()];
    let message = if remove {
        if !lib.sidecars.remove_tags(image, &tags).await? {
            format!("{} has no tags.", image.display())
        } else {
            format!("Removed tag \"{}\" from {}.", tag, image.display())
        }
    } else {
        ensure_sidecar(lib, image).await?;
        lib.sidecars.add_tags(image, &tags).await?;
        format!("Added tag \"{}\" to {}.", tag, image.display())
    };
    lib.index.add_image(image).await?;
    print_status(message, None, json)
}

async fn cmd_note(lib: &Library, image: &Path, text: &str, json: bool) -> Result<()> {
    ensure_sidecar(lib, image).await?;
    lib.sidecars
        .update(
            image,
            SidecarUpdate {
                notes: Some(text.to_string()),
                ..Default::default()
            },
        )
        .await?;
    lib.index.add_image(image).await?;
    print_status(format!("Updated notes of {}.", image.display()), None, json)
}

async fn cmd_show(lib: &Library, image: &Path, json: bool) -> Result<()> {
    let entry = match lib.index.get_by_path(image).await {
        Some(e) => e,
        None => lib.index.add_image(image).await?,
    };
    let sidecar = lib.sidecars.load(image).await?;

    if json {
        let warnings: Vec<String> = sidecar
            .as_ref()
            .map(|s| s.warnings.iter().map(|w| format!("{:?}", w)).collect())
            .unwrap_or_default();
        println!(
            "{}",
            serde_json::json!({
                "image": entry,
                "sidecar": sidecar.as_ref().map(|s| &s.data),
                "warnings": warnings,
            })
        );
        return Ok(());
    }

    println!("ID:       {}", entry.id);
    println!("Path:     {}", entry.file_path.display());
    println!("Taken:    {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("Size:     {}", format_bytes(entry.file_size));
    if let Some(d) = entry.dimensions {
        println!("Pixels:   {}x{}", d.width, d.height);
    }
    if !entry.tags.is_empty() {
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        println!("Tags:     {}", tags.join(", "));
    }
    if let Some(notes) = &entry.notes {
        println!("Notes:    {}", notes);
    }
    match &sidecar {
        Some(s) => {
            println!("Sidecar:  {}", lib.sidecars.sidecar_path(image).display());
            println!(
                "Edits:    {} annotation(s), {} history record(s)",
                s.data.annotations.len(),
                s.data.edit_history.len()
            );
            for warning in &s.warnings {
                println!("Warning:  {:?}", warning);
            }
        }
        None => println!("Sidecar:  none"),
    }
    if let Some(ocr) = &entry.ocr_text {
        println!("─────────────────────────");
        println!("{}", ocr);
    }
    Ok(())
}

async fn cmd_recent_deleted(lib: &Library, json: bool) -> Result<()> {
    let items = lib.lifecycle.recently_deleted().await;
    if json {
        println!("{}", serde_json::to_string(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("Nothing deleted in this session.");
        return Ok(());
    }
    for item in &items {
        println!(
            "{:>6}  {}  -> {}",
            format_age(item.deleted_at),
            item.original_path.display(),
            item.trashed_path.display()
        );
    }
    Ok(())
}

async fn cmd_thumb(lib: &Library, image: &Path, options: ThumbnailOptions, json: bool) -> Result<()> {
    match lib.thumbnails.get_thumbnail(image, options).await? {
        Some(path) => print_status(path.display().to_string(), None, json),
        None => Err(shotbox::ShotError::Image(format!(
            "could not create a thumbnail for {}",
            image.display()
        ))),
    }
}

async fn cmd_cleanup(lib: &Library, json: bool) -> Result<()> {
    let mut removed = 0;
    for dir in [&lib.paths.save_dir, &lib.paths.archive_dir] {
        removed += lib.lifecycle.cleanup_orphaned_sidecars(dir).await?;
    }

    let pruned = lib.index.prune_missing().await;
    let known: Vec<PathBuf> = lib
        .index
        .all_images()
        .await
        .into_iter()
        .map(|i| i.file_path)
        .collect();
    lib.thumbnails
        .rebuild_metadata(&known, lib.thumbnail_options())
        .await?;
    let thumbs = lib.thumbnails.cleanup_orphaned_thumbnails().await?
        + lib.thumbnails.cleanup_unknown_thumbnails(&known).await?;

    print_status(
        format!(
            "Removed {} orphaned sidecar(s), {} thumbnail(s), {} stale catalog entr(ies).",
            removed, thumbs, pruned
        ),
        Some(removed + thumbs + pruned),
        json,
    )
}

async fn cmd_stats(lib: &Library, json: bool) -> Result<()> {
    let stats = lib.index.stats().await;
    let cache = lib.thumbnails.cache_size().await?;

    if json {
        let mut obj = serde_json::to_value(&stats)?;
        if let Some(m) = obj.as_object_mut() {
            m.insert("thumbnailFiles".into(), serde_json::json!(cache.files));
            m.insert("thumbnailBytes".into(), serde_json::json!(cache.bytes));
        }
        println!("{}", serde_json::to_string(&obj)?);
        return Ok(());
    }

    println!("Library Statistics");
    println!("──────────────────");
    println!("Images:       {}", stats.total_images);
    println!("  Tagged:     {}", stats.tagged_images);
    println!("  With OCR:   {}", stats.ocr_images);
    println!("Total size:   {}", format_bytes(stats.total_size));
    println!("Terms:        {}", stats.indexed_terms);
    println!("Thumbnails:   {} ({})", cache.files, format_bytes(cache.bytes));
    match stats.last_full_scan {
        Some(t) => println!("Last scan:    {}", t.format("%Y-%m-%d %H:%M")),
        None => println!("Last scan:    never"),
    }
    Ok(())
}

fn print_batch(verb: &str, result: &BatchResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    for item in &result.success {
        print_item(verb, item);
    }
    for item in &result.failed {
        println!(
            "failed: {} ({})",
            item.file_path.display(),
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "{} {}/{} file(s).",
        verb,
        result.success.len(),
        result.total_count
    );
    Ok(())
}

fn print_item(verb: &str, item: &ItemResult) {
    match &item.destination {
        Some(to) => println!("{} {} -> {}", verb, item.file_path.display(), to.display()),
        None => println!("{} {}", verb, item.file_path.display()),
    }
}

fn print_image_row(image: &IndexedImage) {
    let age = format_age(image.timestamp);
    let tags = if image.tags.is_empty() {
        String::new()
    } else {
        let tags: Vec<&str> = image.tags.iter().map(String::as_str).collect();
        format!(" [{}]", tags.join(", "))
    };
    println!("{:>6}  {}{}", age, image.file_path.display(), tags);
}

fn format_age(dt: chrono::DateTime<Utc>) -> String {
    let dur = Utc::now() - dt;
    if dur.num_seconds() < 60 {
        "now".to_string()
    } else if dur.num_minutes() < 60 {
        format!("{}m", dur.num_minutes())
    } else if dur.num_hours() < 24 {
        format!("{}h", dur.num_hours())
    } else {
        format!("{}d", dur.num_days())
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
