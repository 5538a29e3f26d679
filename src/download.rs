//! Download coordinator.
//!
//! A small pool of async fetch workers shares one HTTP client and one URL
//! queue on a single-threaded runtime. Each finished download is renamed into
//! the staging directory and handed to the analysis workers through the
//! [`HandoffQueue`]. A 503 puts the URL back on the queue and the worker backs
//! off; any other non-success status drops the URL for good.

use crate::handoff::HandoffQueue;
use crate::signals::FaultFlag;
use crate::stats::{Counter, RunStats};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// How long an idle worker waits for a URL before re-checking the fault flag.
const IDLE_WAIT: Duration = Duration::from_millis(250);
/// How often the coordinator looks for workers that exited early while
/// waiting for the URL queue to drain.
const JOIN_CHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The body was written to the requested destination.
    Saved { bytes: u64 },
    /// The server answered with a non-success status; nothing was written.
    Status(StatusCode),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `url` and streams a successful body into `dest`.
    ///
    /// Transport and I/O failures are errors; HTTP error statuses are not.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch URL: {url}"))?;

        if let Some(rejected) = rejection(response.status()) {
            return Ok(rejected);
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create staging file: {}", dest.display()))?;
        let mut bytes = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed to read response body from: {url}"))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write to {}", dest.display()))?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(FetchOutcome::Saved { bytes })
    }
}

/// Non-success statuses become an outcome; success means the body should be
/// read.
fn rejection(status: StatusCode) -> Option<FetchOutcome> {
    (!status.is_success()).then_some(FetchOutcome::Status(status))
}

/// Last path segment of a URL: the dump's file name.
pub fn file_name_from_url(url: &str) -> Result<&str> {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("URL has no file name: {url}"))
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    outstanding: usize,
}

/// URL queue with join-style bookkeeping: every `put` must be matched by one
/// `task_done`, and `join` resolves once nothing is outstanding.
#[derive(Debug, Default)]
struct UrlQueue {
    state: Mutex<QueueState>,
    available: Notify,
    drained: Notify,
}

impl UrlQueue {
    fn seeded(urls: Vec<String>) -> Self {
        let outstanding = urls.len();
        Self {
            state: Mutex::new(QueueState {
                pending: urls.into(),
                outstanding,
            }),
            ..Self::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The state stays consistent even if a holder panicked: every
        // mutation is a single push, pop or counter update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put(&self, url: String) {
        {
            let mut state = self.lock();
            state.outstanding += 1;
            state.pending.push_back(url);
        }
        self.available.notify_one();
    }

    fn try_get(&self) -> Option<String> {
        self.lock().pending.pop_front()
    }

    /// Waits up to `idle` for a URL.
    async fn get(&self, idle: Duration) -> Option<String> {
        let notified = self.available.notified();
        if let Some(url) = self.try_get() {
            return Some(url);
        }
        let _ = tokio::time::timeout(idle, notified).await;
        self.try_get()
    }

    fn task_done(&self) {
        let now_drained = {
            let mut state = self.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            state.outstanding == 0
        };
        if now_drained {
            self.drained.notify_waiters();
        }
    }

    /// Removes every pending URL, marking each one done.
    fn discard_pending(&self) -> usize {
        let discarded: Vec<String> = self.lock().pending.drain(..).collect();
        for _ in &discarded {
            self.task_done();
        }
        discarded.len()
    }

    fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a dequeued URL done when dropped, including while unwinding from a
/// panic, in which case the fault flag is raised as well.
struct TaskDone<'a> {
    urls: &'a UrlQueue,
    fault: &'a FaultFlag,
}

impl Drop for TaskDone<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() && self.fault.raise() {
            error!("Download worker panicked. Stopping all workers.");
        }
        self.urls.task_done();
    }
}

enum Step {
    Staged,
    Requeue,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub workers: usize,
    pub backoff: Duration,
    pub staging_dir: PathBuf,
}

struct Shared {
    fetcher: Arc<dyn Fetcher>,
    urls: UrlQueue,
    handoff: HandoffQueue,
    fault: FaultFlag,
    stats: RunStats,
    options: DownloadOptions,
}

pub struct Coordinator {
    fetcher: Arc<dyn Fetcher>,
    handoff: HandoffQueue,
    fault: FaultFlag,
    stats: RunStats,
    options: DownloadOptions,
}

impl Coordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        handoff: HandoffQueue,
        fault: FaultFlag,
        stats: RunStats,
        options: DownloadOptions,
    ) -> Self {
        Self {
            fetcher,
            handoff,
            fault,
            stats,
            options,
        }
    }

    /// Blocking entry point: runs every download on a dedicated
    /// single-threaded runtime.
    pub fn run(&self, urls: Vec<String>) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build download runtime")?;
        runtime.block_on(self.download_all(urls));
        Ok(())
    }

    /// Downloads every URL, then closes the handoff queue. Worker failures
    /// raise the fault flag instead of being returned.
    pub async fn download_all(&self, urls: Vec<String>) {
        let total = urls.len();
        let num_workers = self.options.workers.min(total);
        info!(
            "Number of files to download: {} ({} download workers)",
            total, num_workers
        );

        let shared = Arc::new(Shared {
            fetcher: Arc::clone(&self.fetcher),
            urls: UrlQueue::seeded(urls),
            handoff: self.handoff.clone(),
            fault: self.fault.clone(),
            stats: self.stats.clone(),
            options: self.options.clone(),
        });

        let workers: Vec<JoinHandle<()>> = (0..num_workers)
            .map(|id| tokio::spawn(download_worker(id, Arc::clone(&shared))))
            .collect();

        loop {
            if tokio::time::timeout(JOIN_CHECK, shared.urls.join()).await.is_ok() {
                break;
            }
            if workers.iter().all(JoinHandle::is_finished) {
                warn!(
                    "All download workers exited with {} URLs outstanding",
                    shared.urls.outstanding()
                );
                break;
            }
        }

        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!("Download worker panicked: {}", e);
                }
            }
        }

        self.handoff.close();
        if self.fault.is_raised() {
            warn!("Downloads stopped early because of a fault");
        } else {
            info!("Downloads completed");
        }
    }
}

async fn download_worker(id: usize, shared: Arc<Shared>) {
    debug!("Download worker {} started", id);
    loop {
        if shared.fault.is_raised() {
            let discarded = shared.urls.discard_pending();
            info!(
                "Download worker {} stopping on fault ({} queued URLs discarded)",
                id, discarded
            );
            return;
        }

        let Some(url) = shared.urls.get(IDLE_WAIT).await else {
            continue;
        };
        let done = TaskDone {
            urls: &shared.urls,
            fault: &shared.fault,
        };

        let backoff = match download_one(&shared, &url).await {
            Ok(Step::Staged) | Ok(Step::Dropped) => None,
            Ok(Step::Requeue) => {
                // Requeue before marking done so the queue never looks drained.
                shared.urls.put(url);
                Some(shared.options.backoff)
            }
            Err(e) => {
                error!("Download worker {} failed: {:#}", id, e);
                if shared.fault.raise() {
                    error!("Fault flag raised by download worker {}. Stopping all workers.", id);
                }
                None
            }
        };
        drop(done);

        if let Some(delay) = backoff {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn download_one(shared: &Shared, url: &str) -> Result<Step> {
    let name = file_name_from_url(url)?;
    let dest = shared.options.staging_dir.join(name);
    let partial = shared.options.staging_dir.join(format!("{name}.part"));

    info!("Downloading {}", name);
    let outcome = shared
        .fetcher
        .fetch(url, &partial)
        .await
        .with_context(|| format!("Download of {url} failed"))?;

    match outcome {
        FetchOutcome::Saved { bytes } => {
            tokio::fs::rename(&partial, &dest).await.with_context(|| {
                format!("Failed to move {} into place", partial.display())
            })?;
            info!("Finished downloading {} ({} bytes)", name, bytes);
            shared.stats.incr(Counter::Downloaded);
            shared.handoff.push(dest);
            Ok(Step::Staged)
        }
        FetchOutcome::Status(StatusCode::SERVICE_UNAVAILABLE) => {
            warn!(
                "Attempting too many downloads at once (503 for {}). Requeueing and sleeping for {:?}",
                name, shared.options.backoff
            );
            shared.stats.incr(Counter::Retried);
            Ok(Step::Requeue)
        }
        FetchOutcome::Status(status) => {
            warn!("Code {}: skipping {}", status.as_u16(), url);
            shared.stats.incr(Counter::Dropped);
            Ok(Step::Dropped)
        }
    }
}
