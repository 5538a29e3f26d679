//! Wires the download coordinator and the analysis pool together for one run.

use crate::analysis::{AnalysisOptions, AnalysisWorker};
use crate::config::Settings;
use crate::download::{file_name_from_url, Coordinator, DownloadOptions, Fetcher};
use crate::handoff::HandoffQueue;
use crate::signals::{supervise, FaultFlag};
use crate::stats::{Counter, RunStats};
use anyhow::{Context, Result};
use glob::{glob, Pattern};
use indicatif::ProgressBar;
use log::{error, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub faulted: bool,
    pub elapsed: Duration,
}

fn files_matching(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*{}", Pattern::escape(&dir.to_string_lossy()), suffix);
    let mut paths: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("Invalid staging pattern: {}", pattern))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Removes interrupted `.part` downloads and returns the complete dumps left
/// in the staging directory by an earlier run.
pub fn recover_staged(staging_dir: &Path) -> Result<Vec<PathBuf>> {
    for partial in files_matching(staging_dir, ".part")? {
        warn!("Removing interrupted download {}", partial.display());
        fs::remove_file(&partial)
            .with_context(|| format!("Failed to remove {}", partial.display()))?;
    }
    let staged = files_matching(staging_dir, ".gz")?;
    if !staged.is_empty() {
        info!(
            "Found {} dumps already staged in {}",
            staged.len(),
            staging_dir.display()
        );
    }
    Ok(staged)
}

pub struct Pipeline {
    settings: Settings,
    fetcher: Arc<dyn Fetcher>,
    stats: RunStats,
    progress: ProgressBar,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        fetcher: Arc<dyn Fetcher>,
        stats: RunStats,
        progress: ProgressBar,
    ) -> Self {
        Self {
            settings,
            fetcher,
            stats,
            progress,
        }
    }

    /// Downloads and summarizes every URL, plus whatever an earlier run left
    /// staged. Worker failures do not return an error; they show up as
    /// `faulted` in the report.
    pub fn run(&self, urls: Vec<String>) -> Result<RunReport> {
        let started = Instant::now();
        self.settings.validate()?;
        self.settings.ensure_directories()?;

        let handoff = HandoffQueue::new();
        let fault = FaultFlag::new();

        let staged = recover_staged(&self.settings.staging_dir)?;
        let staged_names: HashSet<String> = staged
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        for path in staged {
            handoff.push(path);
            self.stats.incr(Counter::Recovered);
        }

        let urls: Vec<String> = urls
            .into_iter()
            .filter(|url| match file_name_from_url(url) {
                Ok(name) => !staged_names.contains(name),
                Err(_) => true,
            })
            .collect();
        self.progress.set_length((urls.len() + handoff.len()) as u64);

        let coordinator = Coordinator::new(
            Arc::clone(&self.fetcher),
            handoff.clone(),
            fault.clone(),
            self.stats.clone(),
            DownloadOptions {
                workers: self.settings.downloaders,
                backoff: self.settings.backoff(),
                staging_dir: self.settings.staging_dir.clone(),
            },
        );
        let downloader = {
            let fault = fault.clone();
            let handoff = handoff.clone();
            thread::Builder::new()
                .name("download-coordinator".to_string())
                .spawn(move || {
                    if !supervise("Download coordinator", &fault, || coordinator.run(urls)) {
                        handoff.close();
                    }
                })
                .context("Failed to spawn download coordinator thread")?
        };

        self.run_analysis(&handoff, &fault)?;

        if downloader.join().is_err() {
            error!("Download coordinator thread panicked");
            fault.raise();
        }

        let faulted = fault.is_raised();
        if faulted {
            self.progress.abandon_with_message("Stopped on fault");
        } else {
            self.progress.finish_with_message("All dumps summarized");
        }
        Ok(RunReport {
            faulted,
            elapsed: started.elapsed(),
        })
    }

    fn run_analysis(&self, handoff: &HandoffQueue, fault: &FaultFlag) -> Result<()> {
        let num_workers = self.settings.resolved_analysis_workers();
        info!("Starting {} analysis workers", num_workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("analysis-{}", i))
            .build()
            .context("Failed to build analysis thread pool")?;

        let options = AnalysisOptions {
            top_n: self.settings.top_n,
            results_dir: self.settings.results_dir.clone(),
            denylist: self.settings.denylist.clone(),
            poll_interval: self.settings.poll_interval(),
        };

        pool.scope(|scope| {
            for id in 0..num_workers {
                let options = options.clone();
                scope.spawn(move |_| {
                    supervise(&format!("Analysis worker {}", id), fault, || {
                        AnalysisWorker::new(
                            id,
                            handoff.clone(),
                            fault.clone(),
                            self.stats.clone(),
                            options,
                            self.progress.clone(),
                        )?
                        .run()
                    });
                });
            }
        });
        Ok(())
    }
}
