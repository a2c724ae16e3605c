//! # Rewind CLI - Reverse-delta backups from the command line
//!
//! Thin command layer over the `rewind` library.
//!
//! ## Usage
//! ```bash
//! # Back up a directory (creates the repository on first use)
//! rewind backup ~/project /backups/project
//!
//! # Roll back an interrupted backup
//! rewind regress /backups/project
//!
//! # Restore the state from two sessions ago
//! rewind restore /backups/project /tmp/project-then --at 2B
//!
//! # What changed since the last backup?
//! rewind compare ~/project /backups/project --level hash
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use rewind::{
    BackupOptions, CompareLevel, CompareOptions, CompressionStrategy, Index, RestoreOptions,
    Rewind, RewindBuilder, RewindError, TimeSpec, Timestamp,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Rewind CLI - Incremental reverse-delta backups
#[derive(Parser)]
#[command(name = "rewind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a source directory into a mirror
    Backup {
        /// Directory to back up
        source: PathBuf,

        /// Mirror directory (created on first use)
        mirror: PathBuf,

        /// Session time (epoch seconds or RFC 3339); defaults to now
        #[arg(long)]
        time: Option<String>,

        /// Regress an interrupted session first, even if its process looks alive
        #[arg(short, long)]
        force: bool,

        /// Continue an interrupted session instead of regressing it
        #[arg(long, conflicts_with = "force")]
        resume: bool,

        /// Exclude paths matching this glob (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Store increments and metadata uncompressed (new repositories only)
        #[arg(long)]
        no_compression: bool,

        /// Quote these characters in mirror file names (new repositories only)
        #[arg(long)]
        quote_chars: Option<String>,

        /// Show a spinner while the session runs
        #[arg(short, long)]
        progress: bool,
    },

    /// Restore a committed session into a directory
    Restore {
        /// Mirror directory
        mirror: PathBuf,

        /// Target directory (must be absent or empty)
        target: PathBuf,

        /// Session to restore: now, epoch seconds, RFC 3339, a duration ago, or <n>B
        #[arg(long, default_value = "now")]
        at: String,

        /// Restore only this path, relative to the backup root
        #[arg(long)]
        path: Option<PathBuf>,

        /// Write into a non-empty target
        #[arg(short, long)]
        force: bool,
    },

    /// Roll back an interrupted backup
    #[command(alias = "check-destination-dir")]
    Regress {
        /// Mirror directory
        mirror: PathBuf,

        /// Proceed even if the interrupted session's process looks alive
        #[arg(short, long)]
        force: bool,
    },

    /// Compare a live directory with a committed session
    Compare {
        /// Directory to compare
        source: PathBuf,

        /// Mirror directory
        mirror: PathBuf,

        /// Session to compare against
        #[arg(long, default_value = "now")]
        at: String,

        /// How strictly regular files are compared
        #[arg(long, value_enum, default_value_t = Level::Meta)]
        level: Level,

        /// Exclude paths matching this glob (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Also list unchanged paths
        #[arg(long)]
        all: bool,
    },

    /// Show the history of one path
    ListIncrements {
        /// Mirror directory
        mirror: PathBuf,

        /// Path relative to the backup root
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// List committed sessions
    ListSessions {
        /// Mirror directory
        mirror: PathBuf,
    },

    /// Check stored digests against reconstructed content
    Verify {
        /// Mirror directory
        mirror: PathBuf,

        /// Session to verify
        #[arg(long, default_value = "now")]
        at: String,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Level {
    Meta,
    Hash,
    Full,
}

impl From<Level> for CompareLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Meta => CompareLevel::Meta,
            Level::Hash => CompareLevel::Hash,
            Level::Full => CompareLevel::Full,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "rewind=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        if let Some(hint) = hint_for(&e) {
            eprintln!("  {}", hint.yellow());
        }
        std::process::exit(1);
    }
}

/// Library hint for the error, when it says more than the error itself
fn hint_for(err: &anyhow::Error) -> Option<String> {
    let inner = err.chain().find_map(|cause| cause.downcast_ref::<RewindError>())?;
    let message = inner.user_message();
    (message != inner.to_string()).then_some(message)
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Backup {
            source,
            mirror,
            time,
            force,
            resume,
            exclude,
            no_compression,
            quote_chars,
            progress,
        } => cmd_backup(
            &source,
            &mirror,
            time,
            BackupFlags {
                force,
                resume,
                exclude,
                no_compression,
                quote_chars,
                progress,
            },
        ),
        Commands::Restore {
            mirror,
            target,
            at,
            path,
            force,
        } => cmd_restore(&mirror, &target, &at, path, force),
        Commands::Regress { mirror, force } => cmd_regress(&mirror, force),
        Commands::Compare {
            source,
            mirror,
            at,
            level,
            exclude,
            all,
        } => cmd_compare(&source, &mirror, &at, level, exclude, all),
        Commands::ListIncrements { mirror, path } => cmd_list_increments(&mirror, path),
        Commands::ListSessions { mirror } => cmd_list_sessions(&mirror),
        Commands::Verify { mirror, at } => cmd_verify(&mirror, &at),
    }
}

struct BackupFlags {
    force: bool,
    resume: bool,
    exclude: Vec<String>,
    no_compression: bool,
    quote_chars: Option<String>,
    progress: bool,
}

/// Run one backup session
///
/// Repository settings (compression, quoting) only apply when the mirror is
/// created; an existing repository keeps the configuration it was made with.
fn cmd_backup(source: &Path, mirror: &Path, time: Option<String>, flags: BackupFlags) -> Result<()> {
    if !source.is_dir() {
        bail!("Source {} is not a directory", source.display());
    }
    let time = time.as_deref().map(parse_session_time).transpose()?;

    let mut builder = RewindBuilder::new();
    if flags.no_compression {
        builder = builder.compression_strategy(CompressionStrategy::None);
    }
    if let Some(chars) = flags.quote_chars {
        builder = builder.quote_chars(chars);
    }
    let rewind = builder
        .build(mirror)
        .with_context(|| format!("Failed to open repository at {}", mirror.display()))?;

    println!(
        "{} {} {} {}",
        "Backing up".blue().bold(),
        source.display().to_string().cyan(),
        "to".blue().bold(),
        mirror.display().to_string().cyan()
    );

    let start = Instant::now();
    let spinner = flags.progress.then(|| spinner("Scanning and copying..."));
    let options = BackupOptions {
        time,
        force: flags.force,
        resume: flags.resume,
        exclude: flags.exclude,
    };
    let result = rewind.backup(source, &options);
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let stats = result.context("Backup failed")?;

    let session = stats.session_time.map(|t| t.to_string()).unwrap_or_default();
    if stats.resumed {
        println!("{} Resumed and committed session {}", "✓".green().bold(), session.yellow().bold());
    } else {
        println!("{} Committed session {}", "✓".green().bold(), session.yellow().bold());
    }
    println!("  Entries: {}", stats.source_entries.to_string().cyan());
    println!("  Size: {}", format_bytes(stats.source_bytes).cyan());
    if stats.previous_time.is_some() {
        println!(
            "  Changed: {}  New: {}  Deleted: {}",
            stats.changed_entries.to_string().yellow(),
            stats.new_entries.to_string().green(),
            stats.deleted_entries.to_string().red()
        );
        println!(
            "  Increments: {} ({})",
            stats.increment_files.to_string().cyan(),
            format_bytes(stats.increment_bytes).cyan()
        );
    }
    if stats.errors > 0 {
        println!("  {} {} paths could not be read", "⚠".yellow(), stats.errors.to_string().yellow());
    }
    println!("  Time: {}", elapsed(start).cyan());
    Ok(())
}

/// Restore a session into a fresh directory
fn cmd_restore(mirror: &Path, target: &Path, at: &str, path: Option<PathBuf>, force: bool) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    let time = rewind.resolve_time(at)?;
    let subtree = path
        .as_deref()
        .map(Index::from_relative_path)
        .transpose()
        .context("Invalid --path")?;

    println!(
        "{} {} {} {}",
        "Restoring session".blue().bold(),
        time.to_string().yellow(),
        "into".blue().bold(),
        target.display().to_string().cyan()
    );

    let start = Instant::now();
    let pb = spinner("Rebuilding files...");
    let options = RestoreOptions { subtree, force };
    let result = rewind.restore(time, target, &options);
    pb.finish_and_clear();
    let result = result.context("Restore failed")?;

    println!("{} Restore complete", "✓".green().bold());
    println!("  Files restored: {}", result.files_restored.to_string().cyan());
    println!("  Directories: {}", result.directories_restored.to_string().cyan());
    if result.other_restored > 0 {
        println!("  Other entries: {}", result.other_restored.to_string().cyan());
    }
    if result.hardlinks_restored > 0 {
        println!("  Hard links: {}", result.hardlinks_restored.to_string().cyan());
    }
    println!("  Bytes written: {}", format_bytes(result.bytes_written).cyan());
    println!("  Time: {}", elapsed(start).cyan());
    if result.errors > 0 {
        println!("  {} {} paths failed", "⚠".yellow(), result.errors.to_string().yellow());
        bail!("{} paths could not be restored", result.errors);
    }
    Ok(())
}

/// Roll back an interrupted session, if there is one
fn cmd_regress(mirror: &Path, force: bool) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    match rewind.regress(force).context("Regression failed")? {
        None => println!("{} Mirror is consistent, nothing to regress", "✓".green().bold()),
        Some(result) => {
            println!(
                "{} Rolled back session {} to {}",
                "✓".green().bold(),
                result.unsuccessful_time.to_string().red(),
                result.regress_time.to_string().yellow().bold()
            );
            println!("  Paths reverted: {}", result.paths_reverted.to_string().cyan());
            println!("  Increments removed: {}", result.increments_deleted.to_string().cyan());
            println!("  Session files removed: {}", result.session_files_removed.to_string().cyan());
            println!(
                "  Time: {}",
                format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
            );
        }
    }
    Ok(())
}

/// List how a live tree differs from a session
fn cmd_compare(
    source: &Path,
    mirror: &Path,
    at: &str,
    level: Level,
    exclude: Vec<String>,
    all: bool,
) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    let time = rewind.resolve_time(at)?;
    let options = CompareOptions {
        level: level.into(),
        exclude,
    };

    let mut differences = 0usize;
    for report in rewind.compare(source, time, &options)? {
        let report = report.context("Comparison failed")?;
        if !report.is_difference() && !all {
            continue;
        }
        let marker = match report.status {
            rewind::CompareStatus::New => "+".green(),
            rewind::CompareStatus::Deleted => "-".red(),
            rewind::CompareStatus::Changed => "~".yellow(),
            rewind::CompareStatus::Unchanged => " ".normal(),
        };
        match &report.reason {
            Some(reason) => println!("{} {} {}", marker, report.index, format!("({})", reason).dimmed()),
            None => println!("{} {}", marker, report.index),
        }
        if report.is_difference() {
            differences += 1;
        }
    }

    if differences == 0 {
        println!("{} {} matches session {}", "✓".green().bold(), source.display(), time);
    } else {
        println!("\n{} differences from session {}", differences.to_string().yellow().bold(), time);
    }
    Ok(())
}

/// Show the mirror entry and increments of one path
fn cmd_list_increments(mirror: &Path, path: Option<PathBuf>) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    let index = match path {
        Some(p) => Index::from_relative_path(&p).context("Invalid --path")?,
        None => Index::root(),
    };
    let listing = rewind.list_increments(&index)?;

    let name = if index.is_root() { ".".to_string() } else { index.to_string() };
    println!("{} {}", "History of".blue().bold(), name.cyan());
    if listing.mirror.exists() {
        println!("  Current: {} ({})", listing.mirror.kind.as_str(), format_bytes(listing.mirror.size));
    } else {
        println!("  Current: {}", "absent".dimmed());
    }

    if listing.increments.is_empty() {
        println!("  {}", "No increments".dimmed());
        return Ok(());
    }
    for inc in listing.increments.iter().rev() {
        println!(
            "  {} {:<8} {:>10}{}",
            inc.time.to_string().yellow(),
            inc.kind,
            format_bytes(inc.size),
            if inc.compressed { " gz".dimmed() } else { "".normal() }
        );
    }
    println!(
        "\n{} increments, {} diffs",
        listing.increments.len().to_string().cyan(),
        listing.diff_count().to_string().cyan()
    );
    Ok(())
}

/// List every committed session, newest first
fn cmd_list_sessions(mirror: &Path) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    let sessions = rewind.sessions()?;
    if sessions.is_empty() {
        println!("{}", "No sessions yet".dimmed());
        return Ok(());
    }

    println!("{}", "Sessions:".bold());
    for (back, info) in sessions.iter().rev().enumerate() {
        let label = format!("{}B", back);
        let time = if info.is_current {
            format!("{} (current)", info.time).green().bold()
        } else {
            info.time.to_string().yellow()
        };
        match &info.stats {
            Some(stats) => println!(
                "  {:>4} {}  {} entries, {} changed, {} new, {} deleted",
                label.dimmed(),
                time,
                stats.source_entries,
                stats.changed_entries,
                stats.new_entries,
                stats.deleted_entries
            ),
            None => println!("  {:>4} {}  {}", label.dimmed(), time, "no statistics".dimmed()),
        }
    }
    Ok(())
}

/// Verify stored digests at one session
fn cmd_verify(mirror: &Path, at: &str) -> Result<()> {
    let rewind = open_rewind(mirror)?;
    let time = rewind.resolve_time(at)?;
    println!("{} {}", "Verifying session".blue().bold(), time.to_string().yellow());

    let start = Instant::now();
    let pb = spinner("Rebuilding and hashing files...");
    let report = rewind.verify(time);
    pb.finish_and_clear();
    let report = report.context("Verification failed")?;

    println!("  Files checked: {}", report.files_checked.to_string().cyan());
    if report.files_without_digest > 0 {
        println!("  Without digest: {}", report.files_without_digest.to_string().dimmed());
    }
    println!("  Time: {}", elapsed(start).cyan());

    if report.is_valid() {
        println!("{} All digests match", "✓".green().bold());
        Ok(())
    } else {
        for path in &report.mismatches {
            println!("  {} {}", "✗".red(), path);
        }
        bail!("{} files do not match their recorded digest", report.mismatches.len())
    }
}

fn open_rewind(mirror: &Path) -> Result<Rewind> {
    Rewind::open(mirror).with_context(|| format!("Failed to open repository at {}", mirror.display()))
}

/// Backup session times must be absolute
fn parse_session_time(spec: &str) -> Result<Timestamp> {
    match spec.parse::<TimeSpec>()? {
        TimeSpec::At(time) => Ok(time),
        other => bail!("Session time must be absolute, got {}", other),
    }
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn elapsed(start: Instant) -> String {
    // Whole milliseconds read better than humantime's nanosecond tail
    let millis = Duration::from_millis(start.elapsed().as_millis() as u64);
    format_duration(millis).to_string()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
