//! Turns a date range into the list of hourly dump URLs to fetch.
//!
//! Dump timestamps mark the *end* of the hour they cover, so every parsed time
//! is rounded up to the next whole hour.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use glob::{glob, Pattern};
use log::{debug, info};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("could not convert \"{0}\" to a timestamp")]
    Unparsable(String),
    #[error("end date {end} cannot be before start date {start}")]
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Rounds up to the next whole hour; times already on the hour are unchanged.
pub fn ceil_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let past_hour = ts.timestamp().rem_euclid(3600);
    let nanos = i64::from(ts.timestamp_subsec_nanos());
    if past_hour == 0 && nanos == 0 {
        return ts;
    }
    ts - TimeDelta::nanoseconds(nanos) + TimeDelta::seconds(3600 - past_hour)
}

/// Parses a user supplied time. Offsets are converted to UTC and times
/// without one are taken to be UTC already.
pub fn parse_time_string(input: &str) -> Result<DateTime<Utc>, ScheduleError> {
    let s = input.trim();
    let parsed = parse_with_offset(s)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| {
            NAIVE_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .ok_or_else(|| ScheduleError::Unparsable(input.to_string()))?;
    Ok(ceil_hour(parsed))
}

fn parse_with_offset(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z"))
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
}

/// Resolves the requested range:
/// - no start: the hour that ended 24 hours before `now`,
/// - no end: a single hour at `start`,
/// - both ends are clamped to `earliest`.
pub fn parse_start_and_end(
    start: Option<&str>,
    end: Option<&str>,
    earliest: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ScheduleError> {
    let start = match start {
        Some(s) => parse_time_string(s)?,
        None => ceil_hour(now) - TimeDelta::hours(24),
    };
    let end = match end {
        Some(e) => parse_time_string(e)?,
        None => start,
    };
    let earliest = ceil_hour(earliest);
    let (start, end) = (start.max(earliest), end.max(earliest));
    if end < start {
        return Err(ScheduleError::EndBeforeStart { start, end });
    }
    Ok((start, end))
}

/// `pageviews-YYYYMMDD-HH0000.gz`
pub fn dump_file_name(hour: DateTime<Utc>) -> String {
    hour.format("pageviews-%Y%m%d-%H0000.gz").to_string()
}

/// `<root>/<YYYY>/<YYYY-MM>/pageviews-YYYYMMDD-HH0000.gz`
pub fn dump_url(root: &str, hour: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}",
        root.trim_end_matches('/'),
        hour.format("%Y/%Y-%m"),
        dump_file_name(hour)
    )
}

/// Every hour from `start` to `end`, inclusive.
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> {
    std::iter::successors(Some(start), |h| Some(*h + TimeDelta::hours(1)))
        .take_while(move |h| *h <= end)
}

/// Builds the download list, leaving out hours whose summary name (the dump
/// name without `.gz`) is in `skip`.
pub fn dump_urls(
    root: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    skip: &HashSet<String>,
) -> Vec<String> {
    hours_between(start, end)
        .filter(|hour| {
            let name = dump_file_name(*hour);
            let summary = summary_name(&name);
            if skip.contains(summary) {
                debug!("Already have {}, not downloading it again", summary);
                false
            } else {
                true
            }
        })
        .map(|hour| dump_url(root, hour))
        .collect()
}

/// Strips the compression suffix from a dump file name.
pub fn summary_name(dump_name: &str) -> &str {
    dump_name.strip_suffix(".gz").unwrap_or(dump_name)
}

/// Names of the summaries already present in `results_dir`.
pub fn already_processed(results_dir: &Path) -> Result<HashSet<String>> {
    let pattern = Pattern::escape(&results_dir.to_string_lossy()) + "/*";
    let names: HashSet<String> = glob(&pattern)
        .with_context(|| format!("Invalid results directory pattern: {}", pattern))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    info!("Found {} existing summaries in {}", names.len(), results_dir.display());
    Ok(names)
}
