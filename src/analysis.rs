//! Analysis workers: reduce each staged dump to its per-site top pages.

use crate::handoff::{Handoff, HandoffQueue};
use crate::records::{parse_line, Denylist};
use crate::schedule::summary_name;
use crate::signals::FaultFlag;
use crate::stats::{format_elapsed, Counter, RunStats};
use crate::topk::SiteTopK;
use anyhow::{anyhow, Context, Result};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use flate2::read::MultiGzDecoder;
use indicatif::ProgressBar;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub top_n: usize,
    pub results_dir: PathBuf,
    pub denylist: PathBuf,
    pub poll_interval: Duration,
}

/// Line tallies from one pass over a dump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanCounts {
    pub lines: usize,
    pub malformed: usize,
    pub denylisted: usize,
}

/// Streams a gzipped dump and keeps the `top_n` most viewed pages per site.
///
/// Every gzip member in the file is read. Malformed lines (wrong field count,
/// bad view count, invalid UTF-8) are counted and skipped. Read errors from
/// the file or the decoder are returned.
pub fn build_top_k(path: &Path, denylist: &Denylist, top_n: usize) -> Result<(SiteTopK, ScanCounts)> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let mut reader = BufReader::new(MultiGzDecoder::new(file));
    let mut tops = SiteTopK::new(top_n);
    let mut counts = ScanCounts::default();
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("Failed to read line {} of {}", counts.lines + 1, path.display()))?;
        if read == 0 {
            break;
        }
        counts.lines += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                counts.malformed += 1;
                debug!("Skipping line {} of {}: {}", counts.lines, path.display(), e);
                continue;
            }
        };
        let record = match parse_line(line) {
            Ok(record) => record,
            Err(e) => {
                counts.malformed += 1;
                debug!("Skipping line {} of {}: {}", counts.lines, path.display(), e);
                continue;
            }
        };
        if denylist.contains(record.site, record.title) {
            counts.denylisted += 1;
            continue;
        }
        tops.offer(record.site, record.title, record.views);
    }

    Ok((tops, counts))
}

/// Writes `<site> <title> <views>` lines, sites in first-seen order and each
/// site ascending by views. The file appears under its final name only once
/// it is complete.
pub fn persist_summary(results_dir: &Path, name: &str, tops: SiteTopK) -> Result<PathBuf> {
    let dest = results_dir.join(name);
    let partial = results_dir.join(format!("{name}.part"));

    let mut writer = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_path(&partial)
        .with_context(|| format!("Failed to create summary file: {}", partial.display()))?;

    for (site, pages) in tops.drain_all() {
        for page in pages {
            let views = page.views.to_string();
            writer
                .write_record([site.as_str(), page.title.as_str(), views.as_str()])
                .with_context(|| format!("Failed to write to {}", partial.display()))?;
        }
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", partial.display()))?;
    drop(writer);

    fs::rename(&partial, &dest)
        .with_context(|| format!("Failed to move {} into place", partial.display()))?;
    Ok(dest)
}

pub struct AnalysisWorker {
    id: usize,
    denylist: Denylist,
    queue: HandoffQueue,
    fault: FaultFlag,
    stats: RunStats,
    options: AnalysisOptions,
    progress: ProgressBar,
}

impl AnalysisWorker {
    /// Loads this worker's own copy of the denylist.
    pub fn new(
        id: usize,
        queue: HandoffQueue,
        fault: FaultFlag,
        stats: RunStats,
        options: AnalysisOptions,
        progress: ProgressBar,
    ) -> Result<Self> {
        let (denylist, malformed) = Denylist::load(&options.denylist)?;
        stats.add(Counter::MalformedDenylistLines, malformed);
        Ok(Self {
            id,
            denylist,
            queue,
            fault,
            stats,
            options,
            progress,
        })
    }

    /// Takes staged dumps until the queue is finished or a fault is raised.
    /// Any error ends the worker and is returned to the caller.
    pub fn run(&self) -> Result<()> {
        info!("Analysis worker {} started", self.id);
        loop {
            if self.fault.is_raised() {
                info!("Analysis worker {} stopping on fault", self.id);
                return Ok(());
            }
            match self.queue.next(self.options.poll_interval) {
                Handoff::Staged(path) => {
                    if self.fault.is_raised() {
                        info!(
                            "Analysis worker {} stopping on fault, leaving {} staged",
                            self.id,
                            path.display()
                        );
                        return Ok(());
                    }
                    self.analyze_file(&path)?;
                }
                Handoff::Idle => debug!("Analysis worker {} waiting for downloads", self.id),
                Handoff::Finished => {
                    info!("Analysis worker {} finished: no more staged dumps", self.id);
                    return Ok(());
                }
            }
        }
    }

    /// Summarizes one staged dump and deletes it.
    pub fn analyze_file(&self, path: &Path) -> Result<PathBuf> {
        let started = Instant::now();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Staged path has no usable file name: {}", path.display()))?;
        info!("Analysis worker {} processing {}", self.id, file_name);

        let (tops, counts) = build_top_k(path, &self.denylist, self.options.top_n)?;
        let sites = tops.site_count();
        self.stats.add(Counter::MalformedLines, counts.malformed);
        self.stats.add(Counter::DenylistedRecords, counts.denylisted);

        let summary = persist_summary(&self.options.results_dir, summary_name(file_name), tops)?;
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove staged file: {}", path.display()))?;

        self.stats.incr(Counter::Summarized);
        info!(
            "Wrote {} ({} sites from {} lines, {} malformed, {} denylisted) in {}",
            summary.display(),
            sites,
            counts.lines,
            counts.malformed,
            counts.denylisted,
            format_elapsed(started.elapsed())
        );
        self.progress.set_message(format!("OK: {}", file_name));
        self.progress.inc(1);
        Ok(summary)
    }
}
