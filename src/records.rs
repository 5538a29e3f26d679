//! Pageview dump lines and the site/page denylist.

use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// One parsed dump line: `<site_code> <page_title> <view_count> <bytes>`.
/// The trailing response-size field is validated for presence only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub site: &'a str,
    pub title: &'a str,
    pub views: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),
    #[error("view count '{0}' is not a non-negative integer")]
    ViewCount(String),
}

/// Splits on any run of whitespace, so tabs, repeated spaces and a trailing
/// newline are all tolerated.
pub fn parse_line(line: &str) -> Result<Record<'_>, LineError> {
    let mut fields = line.split_whitespace();
    let (Some(site), Some(title), Some(views), Some(_), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(LineError::FieldCount(line.split_whitespace().count()));
    };
    let views = views
        .parse::<u64>()
        .map_err(|_| LineError::ViewCount(views.to_string()))?;
    Ok(Record { site, title, views })
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected 2 fields, found {0}")]
pub struct DenylistLineError(pub usize);

/// (site_code, page_title) pairs excluded from every summary, grouped by
/// site so lookups work on borrowed strings.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    by_site: HashMap<String, HashSet<String>>,
    len: usize,
}

impl Denylist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one `<site_code> <page_title>` line.
    pub fn add_line(&mut self, line: &str) -> Result<(), DenylistLineError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [site, title] => {
                self.insert(site, title);
                Ok(())
            }
            other => Err(DenylistLineError(other.len())),
        }
    }

    pub fn insert(&mut self, site: &str, title: &str) {
        if self
            .by_site
            .entry(site.to_string())
            .or_default()
            .insert(title.to_string())
        {
            self.len += 1;
        }
    }

    pub fn contains(&self, site: &str, title: &str) -> bool {
        self.by_site
            .get(site)
            .map_or(false, |titles| titles.contains(title))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Loads a denylist file. Blank lines are ignored; malformed lines are
    /// logged and skipped rather than failing the load. Returns the list and
    /// the number of skipped lines.
    pub fn load(path: &Path) -> Result<(Self, usize)> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open denylist file: {}", path.display()))?;
        let mut denylist = Self::new();
        let mut malformed = 0;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("Failed to read line {} of {}", line_num + 1, path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = denylist.add_line(&line) {
                malformed += 1;
                warn!("Malformed denylist line {} ({}): {}", line_num + 1, e, line.trim());
            }
        }
        info!(
            "Loaded {} denylisted pages from {} ({} malformed lines skipped)",
            denylist.len(),
            path.display(),
            malformed
        );
        Ok((denylist, malformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case("en Home 10 0")]
    #[case("en    Home \t\t 10 0")]
    #[case("en Home 10 0\n")]
    #[case("\ten Home 10 0   ")]
    fn parses_well_formed_lines(#[case] line: &str) {
        assert_eq!(
            parse_line(line),
            Ok(Record { site: "en", title: "Home", views: 10 })
        );
    }

    #[rstest]
    #[case("en Home", LineError::FieldCount(2))]
    #[case("hi", LineError::FieldCount(1))]
    #[case("", LineError::FieldCount(0))]
    #[case("i am some junk data i am really bad", LineError::FieldCount(8))]
    #[case("en Home ten 0", LineError::ViewCount("ten".to_string()))]
    #[case("en Home -3 0", LineError::ViewCount("-3".to_string()))]
    #[case("good good i_should_be_int unimportant", LineError::ViewCount("i_should_be_int".to_string()))]
    fn rejects_malformed_lines(#[case] line: &str, #[case] expected: LineError) {
        assert_eq!(parse_line(line), Err(expected));
    }

    #[rstest]
    #[case("domain_code page_name")]
    #[case("domain_code    \t    page_name")]
    #[case("domain_code page_name\n")]
    fn denylist_accepts_two_field_lines(#[case] line: &str) {
        let mut denylist = Denylist::new();
        denylist.add_line(line).unwrap();
        assert!(denylist.contains("domain_code", "page_name"));
    }

    #[rstest]
    #[case("domain_code page_name and some junk too", 6)]
    #[case("hi", 1)]
    fn denylist_rejects_other_field_counts(#[case] line: &str, #[case] found: usize) {
        let mut denylist = Denylist::new();
        assert_eq!(denylist.add_line(line), Err(DenylistLineError(found)));
        assert!(denylist.is_empty());
    }

    #[test]
    fn membership_is_exact_on_both_components() {
        let mut denylist = Denylist::new();
        denylist.insert("en", "my_page");
        assert!(denylist.contains("en", "my_page"));
        assert!(!denylist.contains("en", "not_my_page"));
        assert!(!denylist.contains("de", "my_page"));
        assert!(!denylist.contains("en", "My_page"));
    }

    #[test]
    fn filters_denylisted_records() {
        let mut denylist = Denylist::new();
        denylist.insert("en", "Home");
        denylist.insert("de", "Foo");
        let lines = ["en Home 10 0", "en Other 5 0"];
        let kept: Vec<Record> = lines
            .iter()
            .filter_map(|l| parse_line(l).ok())
            .filter(|r| !denylist.contains(r.site, r.title))
            .collect();
        assert_eq!(kept, vec![Record { site: "en", title: "Other", views: 5 }]);
    }

    #[test]
    fn load_skips_blank_and_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "en Main_Page").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "one_field_only").unwrap();
        writeln!(file, "de\tSpezial:Suche").unwrap();
        let (denylist, malformed) = Denylist::load(file.path()).unwrap();
        assert_eq!(denylist.len(), 2);
        assert_eq!(malformed, 1);
        assert!(denylist.contains("de", "Spezial:Suche"));
    }

    #[test]
    fn load_fails_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Denylist::load(&dir.path().join("absent")).is_err());
    }
}
