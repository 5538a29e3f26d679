use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod defaults {
    pub const ROOT_URL: &str = "https://dumps.wikimedia.org/other/pageviews";
    /// Earliest hour for which pageview dumps are published.
    pub const EARLIEST_DUMP: &str = "2015-05-01T01:00:00+00:00";
    pub const STAGING_DIR: &str = "tmp";
    pub const RESULTS_DIR: &str = "results";
    pub const DENYLIST: &str = "blacklist_domains_and_pages";
    pub const TOP_N: usize = 25;
    /// More than three concurrent downloads reliably draws 503s from the dump server.
    pub const DOWNLOADERS: usize = 3;
    pub const ANALYSIS_WORKERS: usize = 1;
    pub const BACKOFF_SECS: u64 = 10;
    pub const POLL_INTERVAL_SECS: u64 = 5;
    pub const REQUEST_TIMEOUT_SECS: u64 = 600;
    pub const USER_AGENT: &str = concat!("pageview-counts/", env!("CARGO_PKG_VERSION"));
}

/// Run settings, read from an optional YAML file. Missing keys fall back to
/// [`defaults`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub root_url: String,
    pub earliest_dump: String,
    pub staging_dir: PathBuf,
    pub results_dir: PathBuf,
    pub denylist: PathBuf,
    pub top_n: usize,
    pub downloaders: usize,
    /// 0 means one worker per CPU core.
    pub analysis_workers: usize,
    pub backoff_secs: u64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_url: defaults::ROOT_URL.to_string(),
            earliest_dump: defaults::EARLIEST_DUMP.to_string(),
            staging_dir: PathBuf::from(defaults::STAGING_DIR),
            results_dir: PathBuf::from(defaults::RESULTS_DIR),
            denylist: PathBuf::from(defaults::DENYLIST),
            top_n: defaults::TOP_N,
            downloaders: defaults::DOWNLOADERS,
            analysis_workers: defaults::ANALYSIS_WORKERS,
            backoff_secs: defaults::BACKOFF_SECS,
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            user_agent: defaults::USER_AGENT.to_string(),
        }
    }
}

impl Settings {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open configuration file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse configuration YAML from {}", path.display()))?;
        Ok(settings)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resolved_analysis_workers(&self) -> usize {
        if self.analysis_workers == 0 {
            let cores = num_cpus::get();
            info!("Auto-detected {} CPU cores. Using {} analysis workers.", cores, cores);
            cores
        } else {
            self.analysis_workers
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.top_n > 0, "top_n must be at least 1");
        anyhow::ensure!(self.downloaders > 0, "downloaders must be at least 1");
        anyhow::ensure!(!self.root_url.is_empty(), "root_url must not be empty");
        Ok(())
    }

    /// Creates the staging and results directories if they do not exist yet.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.staging_dir, &self.results_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}
