use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::warn;

use clinic_signals::config::Settings;
use clinic_signals::db::SqliteStore;
use clinic_signals::extract::PriceExtractor;
use clinic_signals::ingest::parse_extraction;
use clinic_signals::model::HospitalInput;
use clinic_signals::pipeline::{Engine, HospitalEvaluation};

#[derive(Parser)]
#[command(name = "clinic_signals", about = "Clinic price extraction, change signals and sales scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Evaluate every hospital in a JSONL file of extraction payloads
    Run {
        /// One extraction JSON object per line
        input: PathBuf,
        /// Max hospitals to evaluate
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Parse prices out of a text file (or stdin with "-") and print them
    Prices {
        file: PathBuf,
    },
    /// Grade history and signals for one hospital
    History {
        hospital_id: i64,
        /// Product id as in the criteria directory
        #[arg(short, long)]
        product: Option<String>,
    },
    /// Show database statistics
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Init => {
            let store = SqliteStore::open(&settings.database_path)?;
            store.init_schema()?;
            println!("Schema ready at {}", settings.database_path.display());
            Ok(())
        }
        Commands::Run { input, limit } => {
            let engine = Engine::from_settings(&settings)?;
            SqliteStore::open(&settings.database_path)?.init_schema()?;
            let mut hospitals = read_inputs(&input)?;
            if let Some(n) = limit {
                hospitals.truncate(n);
            }
            if hospitals.is_empty() {
                println!("No valid hospital payloads in {}.", input.display());
                return Ok(());
            }
            println!(
                "Evaluating {} hospitals against {} products...",
                hospitals.len(),
                engine.products.len()
            );
            let counts = evaluate_all(&engine, &settings, &hospitals)?;
            counts.print();
            Ok(())
        }
        Commands::Prices { file } => {
            let text = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?
            };
            let dict = settings.dictionary()?;
            let parsed = PriceExtractor::new(&dict).parse_prices(&text);
            println!(
                "{:<16} | {:>6} | {:<8} | {:>12} | {:>10} | {:<7} | {:<10} | {}",
                "Treatment", "Qty", "Unit", "Total", "Unit price", "Band", "Confidence", "Flags"
            );
            println!("{}", "-".repeat(100));
            for p in &parsed.prices {
                let flags: Vec<&str> = [
                    (p.is_event_price, "event"),
                    (p.is_package, "package"),
                    (p.is_outlier, "outlier"),
                ]
                .into_iter()
                .filter_map(|(on, name)| on.then_some(name))
                .collect();
                println!(
                    "{:<16} | {:>6} | {:<8} | {:>12} | {:>10} | {:<7} | {:<10} | {}",
                    truncate(p.standard_name.as_deref().unwrap_or(&p.treatment_name), 16),
                    p.quantity.map(|q| q.to_string()).unwrap_or_else(|| "-".into()),
                    p.unit_type.as_str(),
                    p.total_price,
                    p.unit_price.map(|u| format!("{:.2}", u)).unwrap_or_else(|| "-".into()),
                    p.price_band.as_str(),
                    p.confidence.as_str(),
                    flags.join(","),
                );
            }
            if !parsed.unparsed.is_empty() {
                println!("\n--- Unparsed ---");
                for line in &parsed.unparsed {
                    println!("  {}", line);
                }
            }
            println!("\n{} prices, {} unparsed lines", parsed.prices.len(), parsed.unparsed.len());
            Ok(())
        }
        Commands::History { hospital_id, product } => {
            let store = SqliteStore::open(&settings.database_path)?;
            store.init_schema()?;
            let products = match product {
                Some(p) => vec![p],
                None => settings.criteria()?.into_iter().map(|(id, _)| id).collect(),
            };
            for product_id in &products {
                println!("== {} ==", product_id);
                for h in store.grade_history(hospital_id, product_id)? {
                    println!(
                        "  {}  {:>7} -> {:<7} ({:>3})  {}",
                        h.changed_at.format("%Y-%m-%d %H:%M"),
                        h.old_grade.map_or("-", |g| g.as_str()),
                        h.new_grade.as_str(),
                        h.new_score,
                        h.reason
                    );
                }
            }
            let signals = store.signals_for(hospital_id)?;
            if !signals.is_empty() {
                println!("\n--- Signals ---");
                for (priority, kind, title) in &signals {
                    println!("  [{:<6}] {:<18} {}", priority, kind, title);
                }
            }
            Ok(())
        }
        Commands::Stats => {
            let store = SqliteStore::open(&settings.database_path)?;
            store.init_schema()?;
            let s = store.stats()?;
            println!("Hospitals:     {}", s.hospitals);
            println!("Snapshots:     {}", s.snapshots);
            println!("Prices:        {} ({} event)", s.prices, s.event_prices);
            println!("Changes:       {}", s.changes);
            println!("Signals:       {}", s.signals);
            println!("Profiles:      {}", s.profiles);
            println!("Scores:        {}", s.scores);
            println!("Grade changes: {}", s.grade_changes);
            for (grade, n) in &s.grades {
                println!("  {:<7} {}", grade, n);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Invalid lines are logged and skipped.
fn read_inputs(path: &Path) -> anyhow::Result<Vec<HospitalInput>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let inputs = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(i, line)| match parse_extraction(line) {
            Ok(input) => Some(input),
            Err(e) => {
                warn!(line = i + 1, error = %e, "skipping payload");
                None
            }
        })
        .collect();
    Ok(inputs)
}

#[derive(Default)]
struct RunCounts {
    hospitals: usize,
    failed: usize,
    first_crawls: usize,
    reanalyzed: usize,
    prices: usize,
    unparsed: usize,
    changes: usize,
    signals: usize,
    grade_changes: usize,
}

impl RunCounts {
    fn add(&mut self, e: &HospitalEvaluation) {
        self.hospitals += 1;
        self.first_crawls += e.is_first_crawl as usize;
        self.reanalyzed += e.reanalyzed as usize;
        self.prices += e.snapshot.pricing.len();
        self.unparsed += e.unparsed.len();
        self.changes += e.changes.len();
        self.signals += e.signals.len();
        self.grade_changes += e.grade_changes.len();
    }

    fn print(&self) {
        println!(
            "Evaluated {} hospitals ({} failed, {} first crawls, {} re-analyzed).",
            self.hospitals, self.failed, self.first_crawls, self.reanalyzed,
        );
        println!(
            "{} prices ({} unparsed lines), {} changes, {} signals, {} grade changes.",
            self.prices, self.unparsed, self.changes, self.signals, self.grade_changes,
        );
    }
}

fn evaluate_all(engine: &Engine, settings: &Settings, hospitals: &[HospitalInput]) -> anyhow::Result<RunCounts> {
    use indicatif::{ProgressBar, ProgressStyle};
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.workers)
        .build()
        .context("building worker pool")?;

    let pb = ProgressBar::new(hospitals.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let now = Utc::now();
    let mut counts = RunCounts::default();
    for chunk in hospitals.chunks(500) {
        let results: Vec<_> = pool.install(|| {
            chunk
                .par_iter()
                .map_init(
                    || SqliteStore::open(&settings.database_path),
                    |store, input| -> anyhow::Result<HospitalEvaluation> {
                        let store = store.as_ref().map_err(|e| anyhow!("{e:#}"))?;
                        let evaluation = engine.evaluate_hospital(store, input, now);
                        pb.inc(1);
                        evaluation
                    },
                )
                .collect()
        });

        for result in results {
            match result {
                Ok(evaluation) => counts.add(&evaluation),
                Err(e) => {
                    counts.failed += 1;
                    warn!(error = %format!("{e:#}"), "hospital evaluation failed");
                }
            }
        }
    }

    pb.finish_and_clear();
    Ok(counts)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
