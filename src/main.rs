use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use photoseries::config::{Config, CONFIG_ENV};
use photoseries::db::{Database, SeriesFilter};
use photoseries::export::ExportLimits;
use photoseries::llm::{create_provider, LlmVerifier, VerificationQueue};
use photoseries::pipeline::{self, AnalyzeOptions};
use photoseries::scanner::Scanner;
use photoseries::series::{CandidateOrder, Reconciler};
use photoseries::tasks::TaskUpdate;
use photoseries::{export, logging};

#[derive(Parser, Debug)]
#[command(name = "photoseries", version, about = "Curate photo series into training datasets")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = CONFIG_ENV, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database file (overrides `db_path` from the config)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Also print log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find candidate series in a directory and verify them
    Analyze {
        /// Directory to scan (recursively)
        #[arg(value_name = "DIR")]
        directory: PathBuf,
        /// Process at most N candidates
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Keep discovery order instead of largest-first
        #[arg(long)]
        no_sort: bool,
        /// Verify again even when a verdict is already stored
        #[arg(long)]
        reanalyze: bool,
        /// List candidates without calling the verifier
        #[arg(long)]
        dry_run: bool,
        /// Concurrent verifier calls (overrides `analysis.workers`)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Show database statistics
    Stats {
        /// Also list the N largest accepted series
        #[arg(long, value_name = "N")]
        top: Option<usize>,
    },

    /// List stored series, most recently updated first
    List {
        #[arg(long, conflicts_with = "rejected")]
        accepted: bool,
        #[arg(long)]
        rejected: bool,
        #[arg(long, default_value_t = 50, value_name = "N")]
        limit: usize,
    },

    /// Show the stored verdict of one series
    Show {
        #[arg(value_name = "BASE_NAME")]
        base_name: String,
    },

    /// Delete a series and its images from the database
    Remove {
        #[arg(value_name = "BASE_NAME")]
        base_name: String,
    },

    /// Drop references to image files that no longer exist
    Clean,

    /// Copy accepted series into a training dataset directory
    Export {
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
        /// Minimum frames per series
        #[arg(long, value_name = "N")]
        min_length: Option<usize>,
        /// Maximum frames per series
        #[arg(long, value_name = "N")]
        max_length: Option<usize>,
    },

    /// Dump both tables as CSV plus accepted series as JSON
    Dump {
        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let _ = logging::init(None, cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    db.initialize()?;

    match cli.command {
        Commands::Analyze {
            directory,
            limit,
            no_sort,
            reanalyze,
            dry_run,
            workers,
        } => {
            let order = if no_sort {
                CandidateOrder::Discovery
            } else {
                config.grouping.candidate_order()
            };
            let scanner = Scanner::with_order(&config.grouping, order);
            let options = AnalyzeOptions { limit, reanalyze };

            if dry_run {
                return run_dry(&db, &scanner, &directory, options);
            }
            run_analyze(&config, &db, &scanner, &directory, options, workers)
        }
        Commands::Stats { top } => run_stats(&db, top),
        Commands::List {
            accepted,
            rejected,
            limit,
        } => {
            let filter = if accepted {
                SeriesFilter::Accepted
            } else if rejected {
                SeriesFilter::Rejected
            } else {
                SeriesFilter::Any
            };
            run_list(&db, filter, limit)
        }
        Commands::Show { base_name } => run_show(&db, &base_name),
        Commands::Remove { base_name } => match db.remove_series(&base_name)? {
            Some(images) => {
                println!("Removed {} ({} images)", base_name, images);
                Ok(())
            }
            None => bail!("no series named {}", base_name),
        },
        Commands::Clean => {
            let report = db.clean_missing_images()?;
            println!(
                "Checked {} images: {} missing references removed, {} series renumbered, {} empty series removed",
                report.checked,
                report.missing.len(),
                report.series_renumbered,
                report.empty_series_removed
            );
            Ok(())
        }
        Commands::Export {
            output_dir,
            min_length,
            max_length,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| config.export.output_dir.clone());
            let limits = ExportLimits {
                min_length: min_length.unwrap_or_else(|| config.export_min_length()),
                max_length: max_length.or(config.export.max_length),
            };
            run_export(&db, &output_dir, limits)
        }
        Commands::Dump { output_dir } => {
            let report = export::dump_database(&db, &output_dir)?;
            println!(
                "Wrote {} series rows, {} image rows and {} accepted series to {}",
                report.series_rows,
                report.image_rows,
                report.accepted_series,
                output_dir.display()
            );
            Ok(())
        }
    }
}

fn run_dry(
    db: &Database,
    scanner: &Scanner,
    directory: &Path,
    options: AnalyzeOptions,
) -> Result<()> {
    let (candidates, skipped) = pipeline::plan(db, scanner, directory, options)?;
    println!(
        "{} candidate series ({} already analyzed)",
        candidates.len(),
        skipped
    );
    for (i, candidate) in candidates.iter().enumerate() {
        println!("{:4}. {} ({} images)", i + 1, candidate.base_name(), candidate.image_count());
    }
    Ok(())
}

fn run_analyze(
    config: &Config,
    db: &Database,
    scanner: &Scanner,
    directory: &Path,
    options: AnalyzeOptions,
    workers: Option<usize>,
) -> Result<()> {
    let provider = create_provider(&config.llm)?;
    let verifier = LlmVerifier::new(Arc::from(provider), &config.llm);
    println!("Verifying with {} ({})", verifier.provider_name(), config.llm.model);

    let queue = VerificationQueue::new(
        Arc::new(verifier),
        Reconciler::new(config.analysis.reconcile_config()),
    )
    .with_workers(workers.unwrap_or(config.analysis.workers))
    .with_request_delay(Duration::from_millis(config.analysis.request_delay_ms));

    let (tx, rx) = mpsc::channel();
    let bar = progress_bar()?;
    let reporter = {
        let bar = bar.clone();
        std::thread::spawn(move || {
            for update in rx {
                match update {
                    TaskUpdate::Started { total } => bar.set_length(total as u64),
                    TaskUpdate::Progress(p) => {
                        bar.set_position(p.current as u64);
                        if let Some(item) = p.current_item {
                            bar.set_message(format!(
                                "{} {}",
                                p.message.unwrap_or_default(),
                                item
                            ));
                        }
                    }
                    TaskUpdate::Completed { message } => bar.finish_with_message(message),
                    TaskUpdate::Cancelled => bar.abandon_with_message("cancelled"),
                    TaskUpdate::Failed { error } => bar.abandon_with_message(error),
                }
            }
        })
    };

    let result = pipeline::analyze_directory(
        db,
        scanner,
        &queue,
        directory,
        options,
        Some(&tx),
        Arc::new(AtomicBool::new(false)),
    );
    drop(tx);
    let _ = reporter.join();
    let report = result?;

    let s = report.summary;
    println!();
    println!("Images found:        {}", report.total_images);
    println!("Unparsable names:    {}", report.grouping.unparsable);
    println!("Out of size bounds:  {}", report.grouping.out_of_bounds());
    println!("Already analyzed:    {}", report.skipped_existing);
    println!("Processed:           {}", s.processed);
    println!("  accepted:          {}", s.accepted);
    println!("  rejected:          {}", s.rejected);
    println!("  deferred:          {}", s.deferred);
    println!("  fallback-ordered:  {}", s.fallback_ordered);
    if s.deferred > 0 {
        println!("Deferred series will be retried on the next run.");
    }
    Ok(())
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {wide_msg}",
        )?
        .progress_chars("█▓▒░  "),
    );
    Ok(bar)
}

fn run_stats(db: &Database, top: Option<usize>) -> Result<()> {
    let stats = db.get_stats()?;

    println!("Series analyzed:        {}", stats.total);
    println!("Accepted series:        {}", stats.accepted);
    println!("Rejected series:        {}", stats.rejected);
    println!("Images in series:       {}", stats.image_rows);
    println!("Scan-order fallbacks:   {}", stats.fallback_ordered);
    if let Some(mean) = stats.mean_accepted_size {
        println!("Average accepted size:  {:.1}", mean);
    }

    if !stats.size_distribution.is_empty() {
        println!("\nSize distribution:");
        for (size, count) in &stats.size_distribution {
            println!("  {:3} images: {} series", size, count);
        }
    }

    if let Some(n) = top {
        println!("\nTop {} accepted series:", n);
        for (i, series) in db.top_series(n)?.iter().enumerate() {
            println!("{:3}. {} ({} images)", i + 1, series.base_name, series.image_count);
            if let Some(caption) = &series.caption {
                println!("     {}", caption);
            }
        }
    }

    let runs = db.recent_analyses(1)?;
    if let Some(last) = runs.first() {
        println!(
            "\nLast run: {} ({} images, {} candidates, {} accepted, {} deferred)",
            last.directory, last.total_images, last.total_series, last.accepted, last.deferred
        );
    }
    Ok(())
}

fn run_list(db: &Database, filter: SeriesFilter, limit: usize) -> Result<()> {
    let rows = db.list_summaries(filter, limit)?;
    if rows.is_empty() {
        println!("No series stored.");
        return Ok(());
    }

    println!("{:<5} {:<8} {:>6} {:<20} {}", "ID", "VERDICT", "IMAGES", "ORDERING", "BASE NAME");
    for row in rows {
        println!(
            "{:<5} {:<8} {:>6} {:<20} {}",
            row.id,
            if row.is_series { "accepted" } else { "rejected" },
            row.image_count,
            row.ordering_source,
            row.base_name
        );
    }
    Ok(())
}

fn run_show(db: &Database, base_name: &str) -> Result<()> {
    let Some(series) = db.get_series(base_name)? else {
        bail!("no series named {}", base_name);
    };

    println!("{} ({})", series.base_name, if series.is_series { "accepted" } else { "rejected" });
    println!("Directory: {}", series.directory);
    if let Some(caption) = &series.caption {
        println!("Caption:   {}", caption);
    }
    println!("Ordering:  {}", series.ordering.as_str());
    for image in &series.images {
        println!("  {:3}. {}", image.order_in_series, image.path.display());
    }

    println!("\nStored verdict:");
    match serde_json::from_str::<serde_json::Value>(&series.raw_verdict) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", series.raw_verdict),
    }
    Ok(())
}

fn run_export(db: &Database, output_dir: &Path, limits: ExportLimits) -> Result<()> {
    let report = export::export_dataset(db, output_dir, limits)?;

    println!(
        "Exported {} series ({} frames) to {}",
        report.exported.len(),
        report.frames_copied(),
        output_dir.display()
    );
    if report.too_short > 0 {
        println!(
            "Skipped {} series shorter than {} frames",
            report.too_short, limits.min_length
        );
    }
    if let Some(max_length) = limits.max_length.filter(|_| report.too_long > 0) {
        println!(
            "Skipped {} series longer than {} frames",
            report.too_long, max_length
        );
    }
    for skipped in &report.skipped_missing {
        println!(
            "Skipped {}: {} missing files",
            skipped.base_name,
            skipped.missing.len()
        );
    }
    Ok(())
}
