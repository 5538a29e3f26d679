use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Recovered,
    Downloaded,
    Retried,
    Dropped,
    Summarized,
    MalformedLines,
    DenylistedRecords,
    MalformedDenylistLines,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::Recovered,
        Counter::Downloaded,
        Counter::Retried,
        Counter::Dropped,
        Counter::Summarized,
        Counter::MalformedLines,
        Counter::DenylistedRecords,
        Counter::MalformedDenylistLines,
    ];
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Counter::Recovered => "staged dumps recovered",
            Counter::Downloaded => "dumps downloaded",
            Counter::Retried => "downloads retried after 503",
            Counter::Dropped => "downloads dropped",
            Counter::Summarized => "dumps summarized",
            Counter::MalformedLines => "malformed dump lines",
            Counter::DenylistedRecords => "denylisted records skipped",
            Counter::MalformedDenylistLines => "malformed denylist lines",
        };
        f.write_str(label)
    }
}

/// Run-wide counters shared by the download and analysis pools.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    counts: Arc<DashMap<Counter, AtomicUsize>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counter: Counter, n: usize) {
        if n == 0 {
            return;
        }
        self.counts
            .entry(counter)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> usize {
        self.counts
            .get(&counter)
            .map_or(0, |c| c.value().load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<(Counter, usize)> {
        Counter::ALL.iter().map(|c| (*c, self.get(*c))).collect()
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, elapsed.subsec_millis())
    }
}
