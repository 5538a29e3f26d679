use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn, LevelFilter};
use pageview_counts::config::Settings;
use pageview_counts::download::HttpFetcher;
use pageview_counts::pipeline::Pipeline;
use pageview_counts::schedule::{already_processed, dump_urls, parse_start_and_end};
use pageview_counts::stats::{format_elapsed, RunStats};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::Arc;
use time::macros::format_description;

#[derive(Parser, Debug)]
#[command(
    name = "pageview-counts",
    version,
    about = "Download hourly pageview dumps and keep the most viewed pages per site"
)]
struct Cli {
    #[arg(help = "First hour to fetch (default: the hour that ended 24 hours ago)")]
    start: Option<String>,
    #[arg(help = "Last hour to fetch, inclusive (default: START)")]
    end: Option<String>,
    #[arg(long, help = "Path to a YAML settings file")]
    config: Option<PathBuf>,
    #[arg(long, help = "Directory for downloaded dumps awaiting analysis")]
    staging_dir: Option<PathBuf>,
    #[arg(long, help = "Directory for per-dump summaries")]
    results_dir: Option<PathBuf>,
    #[arg(long, help = "File of '<site_code> <page_title>' pairs to exclude")]
    denylist: Option<PathBuf>,
    #[arg(long, help = "Number of pages to keep per site")]
    top_n: Option<usize>,
    #[arg(long, help = "Number of concurrent downloads")]
    downloaders: Option<usize>,
    #[arg(long, help = "Number of analysis workers (0 for one per CPU core)")]
    analysis_workers: Option<usize>,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => {
                info!("Loading settings from: {}", path.display());
                Settings::from_yaml_file(path)?
            }
            None => Settings::default(),
        };
        if let Some(dir) = &self.staging_dir {
            settings.staging_dir = dir.clone();
        }
        if let Some(dir) = &self.results_dir {
            settings.results_dir = dir.clone();
        }
        if let Some(path) = &self.denylist {
            settings.denylist = path.clone();
        }
        if let Some(n) = self.top_n {
            settings.top_n = n;
        }
        if let Some(n) = self.downloaders {
            settings.downloaders = n;
        }
        if let Some(n) = self.analysis_workers {
            settings.analysis_workers = n;
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => { eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level); LevelFilter::Info }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting pageview counts");
    let settings = cli.settings()?;
    settings.ensure_directories()?;
    info!("Staging directory: {}", settings.staging_dir.display());
    info!("Results directory: {}", settings.results_dir.display());

    let earliest = DateTime::parse_from_rfc3339(&settings.earliest_dump)
        .with_context(|| format!("Invalid earliest_dump timestamp: {}", settings.earliest_dump))?
        .with_timezone(&Utc);
    let (start, end) = parse_start_and_end(cli.start.as_deref(), cli.end.as_deref(), earliest, Utc::now())?;
    info!("Fetching dumps from {} to {}", start, end);

    let existing = already_processed(&settings.results_dir)?;
    let urls = dump_urls(&settings.root_url, start, end, &existing);
    if urls.is_empty() {
        info!("Every dump in the range already has a summary.");
    }

    let fetcher = Arc::new(HttpFetcher::new(&settings.user_agent, settings.request_timeout())?);
    let stats = RunStats::new();

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .context("Failed to create progress bar template")?
        .progress_chars("=> "));
    progress_bar.set_message("Starting downloads...");

    let total_requested = urls.len();
    let pipeline = Pipeline::new(settings, fetcher, stats.clone(), progress_bar);
    let report = pipeline.run(urls)?;

    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(report.elapsed));
    info!("Dumps requested: {}", total_requested);
    for (counter, count) in stats.snapshot() {
        info!("  - {}: {}", counter, count);
    }
    if report.faulted {
        warn!("Run stopped early after a worker failure; see errors above.");
    }
    info!("-------------------------------------------------------");

    if report.faulted {
        std::process::exit(1);
    }

    Ok(())
}
