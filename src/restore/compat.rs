// restoretool/src/restore/compat.rs
//! Decides whether a dump can be loaded into a schema other than `public`.
//!
//! Some pg_dump releases qualify every object with `public.` and reset the
//! search path in a way that cannot be redirected, so their dumps have to be
//! restored in place.

use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::LazyLock;

use super::archive::open_dump;
use crate::errors::Result;

const HEADER_SCAN_LINES: usize = 100;

static DUMPED_BY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Dumped by pg_dump version (\d+(?:\.\d+)*)").expect("valid dump header regex")
});

static PUBLIC_QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpublic\.").expect("valid qualifier regex"));

/// Dotted numeric version, compared component-wise with missing parts as zero.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct DumpVersion(Vec<u32>);

impl DumpVersion {
    pub fn parse(text: &str) -> Option<Self> {
        let parts = text
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(DumpVersion(parts))
    }

    fn component(&self, index: usize) -> u32 {
        self.0.get(index).copied().unwrap_or(0)
    }

    pub fn major(&self) -> u32 {
        self.component(0)
    }
}

impl PartialEq for DumpVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for DumpVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for DumpVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DumpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

/// pg_dump releases whose output cannot be relocated: `[from, until)`.
/// `None` as the upper bound means every later release.
const NON_RELOCATABLE: &[(&str, Option<&str>)] = &[
    ("9.3.22", Some("9.4")),
    ("9.4.17", Some("9.5")),
    ("9.5.12", Some("9.6")),
    ("9.6.8", Some("9.7")),
    ("10.3", Some("11")),
    ("11", None),
];

pub fn produces_relocatable_dump(version: &DumpVersion) -> bool {
    !NON_RELOCATABLE.iter().any(|(from, until)| {
        let lower = DumpVersion::parse(from);
        let upper = until.and_then(DumpVersion::parse);
        let above_lower = lower.is_some_and(|l| *version >= l);
        let below_upper = upper.is_none_or(|u| *version < u);
        above_lower && below_upper
    })
}

/// Extracts the producing pg_dump version from the dump header text.
pub fn dumped_by_version(header: &str) -> Option<DumpVersion> {
    DUMPED_BY
        .captures(header)
        .and_then(|c| c.get(1))
        .and_then(|m| DumpVersion::parse(m.as_str()))
}

/// Reads the first lines of a (possibly gzipped) dump.
pub fn read_dump_header(path: &Path) -> Result<String> {
    let reader = open_dump(path)?;
    let mut header = String::new();
    for line in reader.lines().take(HEADER_SCAN_LINES) {
        header.push_str(&line?);
        header.push('\n');
    }
    Ok(header)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Move live tables away, then load the dump straight into `public`.
    InPlace,
    /// Load the dump into `restore` while the site is live, then swap.
    ShadowSchema,
}

impl RestoreStrategy {
    /// Without a recognisable version line relocation cannot be proven safe.
    pub fn select(version: Option<&DumpVersion>) -> Self {
        match version {
            Some(v) if produces_relocatable_dump(v) => RestoreStrategy::ShadowSchema,
            _ => RestoreStrategy::InPlace,
        }
    }
}

impl fmt::Display for RestoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStrategy::InPlace => f.write_str("in-place"),
            RestoreStrategy::ShadowSchema => f.write_str("shadow schema"),
        }
    }
}

/// Rewrites a dump line by line so that it targets the `restore` schema.
///
/// Rows between `COPY ... FROM stdin;` and the closing `\.` are table data
/// and pass through untouched.
#[derive(Debug, Default)]
pub struct ShadowRewriter {
    in_copy_data: bool,
}

impl ShadowRewriter {
    pub fn rewrite<'a>(&mut self, line: &'a str) -> Cow<'a, str> {
        if self.in_copy_data {
            if line.trim_end_matches(['\n', '\r']) == "\\." {
                self.in_copy_data = false;
            }
            return Cow::Borrowed(line);
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("COPY ") && trimmed.trim_end().ends_with("FROM stdin;") {
            self.in_copy_data = true;
        }
        rewrite_for_shadow(line)
    }
}

/// Rewrites one statement line so that it targets the `restore` schema.
pub fn rewrite_for_shadow(line: &str) -> Cow<'_, str> {
    let trimmed = line.trim_start();
    let ending = &line[line.trim_end_matches(['\n', '\r']).len()..];
    if trimmed.starts_with("CREATE SCHEMA public") {
        return Cow::Owned(format!("CREATE SCHEMA IF NOT EXISTS restore;{}", ending));
    }
    if trimmed.starts_with("COMMENT ON SCHEMA public") || trimmed.starts_with("ALTER SCHEMA public")
    {
        return Cow::Owned(format!("-- {}", line));
    }
    if trimmed.starts_with("SET search_path = public") {
        return Cow::Owned(format!("SET search_path = restore, public, pg_catalog;{}", ending));
    }
    if trimmed.starts_with("--") {
        return Cow::Borrowed(line);
    }
    if trimmed.starts_with("INSERT INTO ") {
        // Only the target table; the values are data.
        return PUBLIC_QUALIFIER.replacen(line, 1, "restore.");
    }
    PUBLIC_QUALIFIER.replace_all(line, "restore.")
}
