use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::ProgressBar;
use pageview_counts::config::Settings;
use pageview_counts::download::{FetchOutcome, Fetcher};
use pageview_counts::pipeline::Pipeline;
use pageview_counts::schedule::{already_processed, dump_urls};
use pageview_counts::stats::{Counter, RunStats};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Serves gzip bodies by file name; names listed in `busy` answer 503 once.
struct FakeDumpServer {
    bodies: HashMap<String, Vec<u8>>,
    busy: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    calls: AtomicUsize,
}

impl FakeDumpServer {
    fn new(bodies: &[(&str, &str)]) -> Self {
        Self {
            bodies: bodies
                .iter()
                .map(|(name, text)| (name.to_string(), gzip(text)))
                .collect(),
            busy: Mutex::new(HashSet::new()),
            broken: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Fetcher for FakeDumpServer {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = url.rsplit('/').next().unwrap_or_default();
        if self.broken.contains(name) {
            return Err(anyhow!("connection reset by peer"));
        }
        if self.busy.lock().unwrap().remove(name) {
            return Ok(FetchOutcome::Status(StatusCode::SERVICE_UNAVAILABLE));
        }
        match self.bodies.get(name) {
            Some(body) => {
                fs::write(dest, body)?;
                Ok(FetchOutcome::Saved { bytes: body.len() as u64 })
            }
            None => Ok(FetchOutcome::Status(StatusCode::NOT_FOUND)),
        }
    }
}

fn settings_in(root: &Path) -> Settings {
    fs::write(root.join("denylist"), "en Main_Page\nen Special:Search\n").unwrap();
    Settings {
        root_url: "http://dumps.test/other/pageviews".to_string(),
        staging_dir: root.join("tmp"),
        results_dir: root.join("results"),
        denylist: root.join("denylist"),
        top_n: 2,
        downloaders: 2,
        analysis_workers: 2,
        backoff_secs: 0,
        poll_interval_secs: 1,
        ..Settings::default()
    }
}

fn hour(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[test]
fn downloads_summarizes_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let settings = settings_in(root.path());
    let start = hour("2020-05-19T00:00:00Z");
    let urls = dump_urls(&settings.root_url, start, start + TimeDelta::hours(2), &HashSet::new());
    assert_eq!(urls.len(), 3);

    let server = FakeDumpServer::new(&[
        (
            "pageviews-20200519-000000.gz",
            "en Main_Page 900 0\nen Cats 30 0\nen Dogs 20 0\nen Fish 10 0\nde Katzen 7 0\n",
        ),
        (
            "pageviews-20200519-010000.gz",
            "de Hunde 3 0\nnot a valid line\nde Katzen 4 0\n",
        ),
        // pageviews-20200519-020000.gz is missing upstream: a 404.
    ]);
    server
        .busy
        .lock()
        .unwrap()
        .insert("pageviews-20200519-010000.gz".to_string());
    let server = Arc::new(server);

    let stats = RunStats::new();
    let report = Pipeline::new(settings.clone(), server.clone(), stats.clone(), ProgressBar::hidden())
        .run(urls)
        .unwrap();

    assert!(!report.faulted);
    let results = &settings.results_dir;
    assert_eq!(
        fs::read_to_string(results.join("pageviews-20200519-000000")).unwrap(),
        "en Dogs 20\nen Cats 30\nde Katzen 7\n"
    );
    assert_eq!(
        fs::read_to_string(results.join("pageviews-20200519-010000")).unwrap(),
        "de Hunde 3\nde Katzen 4\n"
    );
    assert!(!results.join("pageviews-20200519-020000").exists());
    assert_eq!(fs::read_dir(&settings.staging_dir).unwrap().count(), 0);

    assert_eq!(server.calls.load(Ordering::SeqCst), 4);
    assert_eq!(stats.get(Counter::Downloaded), 2);
    assert_eq!(stats.get(Counter::Retried), 1);
    assert_eq!(stats.get(Counter::Dropped), 1);
    assert_eq!(stats.get(Counter::Summarized), 2);
    assert_eq!(stats.get(Counter::MalformedLines), 1);
    assert_eq!(stats.get(Counter::DenylistedRecords), 1);

    // A second run over the same range has nothing left to fetch.
    let existing = already_processed(results).unwrap();
    let again = dump_urls(&settings.root_url, start, start + TimeDelta::hours(1), &existing);
    assert!(again.is_empty());
}

#[test]
fn leftover_staged_dumps_are_summarized_without_refetching() {
    let root = tempfile::tempdir().unwrap();
    let settings = settings_in(root.path());
    fs::create_dir_all(&settings.staging_dir).unwrap();
    fs::write(
        settings.staging_dir.join("pageviews-20200519-000000.gz"),
        gzip("en Cats 5 0\n"),
    )
    .unwrap();
    fs::write(settings.staging_dir.join("pageviews-20200519-010000.gz.part"), b"half").unwrap();

    let start = hour("2020-05-19T00:00:00Z");
    let urls = dump_urls(&settings.root_url, start, start, &HashSet::new());
    let server = Arc::new(FakeDumpServer::new(&[]));
    let stats = RunStats::new();
    let report = Pipeline::new(settings.clone(), server.clone(), stats.clone(), ProgressBar::hidden())
        .run(urls)
        .unwrap();

    assert!(!report.faulted);
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stats.get(Counter::Recovered), 1);
    assert_eq!(
        fs::read_to_string(settings.results_dir.join("pageviews-20200519-000000")).unwrap(),
        "en Cats 5\n"
    );
    assert_eq!(fs::read_dir(&settings.staging_dir).unwrap().count(), 0);
}

#[test]
fn transport_failure_faults_the_run_but_keeps_finished_work() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = settings_in(root.path());
    settings.downloaders = 1;
    let start = hour("2020-05-19T00:00:00Z");
    let urls = dump_urls(&settings.root_url, start, start + TimeDelta::hours(1), &HashSet::new());

    let mut server = FakeDumpServer::new(&[("pageviews-20200519-000000.gz", "en Cats 5 0\n")]);
    server.broken.insert("pageviews-20200519-010000.gz".to_string());
    let server = Arc::new(server);

    let report = Pipeline::new(settings.clone(), server, RunStats::new(), ProgressBar::hidden())
        .run(urls)
        .unwrap();

    assert!(report.faulted);
    let leftovers: Vec<String> = fs::read_dir(&settings.results_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(leftovers.iter().all(|name| !name.ends_with(".part")));
}

#[test]
fn missing_denylist_faults_the_run() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = settings_in(root.path());
    settings.denylist = root.path().join("absent");
    let start = hour("2020-05-19T00:00:00Z");
    let urls = dump_urls(&settings.root_url, start, start, &HashSet::new());
    let server = Arc::new(FakeDumpServer::new(&[("pageviews-20200519-000000.gz", "en Cats 5 0\n")]));

    let report = Pipeline::new(settings, server, RunStats::new(), ProgressBar::hidden())
        .run(urls)
        .unwrap();
    assert!(report.faulted);
}
