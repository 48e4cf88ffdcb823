use chrono::NaiveDate;
use std::collections::btree_map::{self, BTreeMap};
use std::io::{self, BufRead};
use tracing::{debug, warn};

use crate::domain;
use crate::error::RankError;

/// Detailed warnings per snapshot before the rest drop to `debug`.
const MAX_DETAILED_WARNINGS: usize = 20;

/// Every (domain, rank) pair observed for exactly one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankSnapshot {
    date: NaiveDate,
    entries: BTreeMap<String, u32>,
}

impl RankSnapshot {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            entries: BTreeMap::new(),
        }
    }

    /// Builds a snapshot from `(rank, domain)` pairs, the order the feed uses.
    pub fn from_pairs<'a>(date: NaiveDate, pairs: impl IntoIterator<Item = (u32, &'a str)>) -> Self {
        let mut snapshot = Self::new(date);
        for (rank, name) in pairs {
            snapshot.insert(name.to_string(), rank);
        }
        snapshot
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rank_of(&self, domain: &str) -> Option<u32> {
        self.entries.get(domain).copied()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(d, r)| (d.as_str(), *r))
    }

    /// Inserts a ranked domain. A repeated domain keeps its best rank and
    /// the call returns `false`.
    pub fn insert(&mut self, domain: String, rank: u32) -> bool {
        match self.entries.entry(domain) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(rank);
                true
            }
            btree_map::Entry::Occupied(mut slot) => {
                if rank < *slot.get() {
                    slot.insert(rank);
                }
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseReport {
    pub parsed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub header_skipped: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedSnapshot {
    pub snapshot: RankSnapshot,
    pub report: ParseReport,
}

/// Parser for `rank,domain` feed files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotParser;

impl SnapshotParser {
    pub fn parse_str(date: NaiveDate, text: &str) -> io::Result<ParsedSnapshot> {
        Self::parse_reader(date, text.as_bytes())
    }

    /// Parses a whole feed. Only I/O failures abort; bad lines are skipped.
    pub fn parse_reader<R: BufRead>(date: NaiveDate, reader: R) -> io::Result<ParsedSnapshot> {
        let mut snapshot = RankSnapshot::new(date);
        let mut report = ParseReport::default();
        let mut seen_content = false;

        for (index, raw) in reader.split(b'\n').enumerate() {
            let raw = raw?;
            let line_number = index + 1;

            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    report.skipped += 1;
                    log_malformed(date, &report, &RankError::MalformedRecord {
                        line: line_number,
                        reason: format!("invalid utf-8: {}", e),
                    });
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            let first_content = !seen_content;
            seen_content = true;

            match parse_line(line, line_number) {
                Ok((rank, name)) => {
                    report.parsed += 1;
                    if !snapshot.insert(name, rank) {
                        report.duplicates += 1;
                    }
                }
                Err(_) if first_content && looks_like_header(line) => {
                    report.header_skipped = true;
                    debug!(action = "skip", component = "snapshot_parser", date = %date, header = line, "Skipping header line");
                }
                Err(e) => {
                    report.skipped += 1;
                    log_malformed(date, &report, &e);
                }
            }
        }

        if report.skipped > 0 {
            warn!(
                action = "complete",
                component = "snapshot_parser",
                date = %date,
                parsed = report.parsed,
                skipped = report.skipped,
                "Snapshot parsed with malformed records"
            );
        }
        if report.duplicates > 0 {
            debug!(action = "complete", component = "snapshot_parser", date = %date, duplicates = report.duplicates, "Duplicate domains kept at best rank");
        }

        Ok(ParsedSnapshot { snapshot, report })
    }
}

fn parse_line(line: &str, line_number: usize) -> Result<(u32, String), RankError> {
    let malformed = |reason: String| RankError::MalformedRecord {
        line: line_number,
        reason,
    };

    let (rank_field, domain_field) = line
        .split_once(',')
        .ok_or_else(|| malformed("missing ',' separator".to_string()))?;

    let rank: u32 = rank_field
        .trim()
        .parse()
        .map_err(|_| malformed(format!("non-numeric rank {:?}", rank_field.trim())))?;
    if rank == 0 {
        return Err(malformed("rank must be positive".to_string()));
    }

    // Extra columns after the domain are ignored
    let domain_field = domain_field.split(',').next().unwrap_or_default();
    let name = domain::normalize_domain(domain_field)
        .ok_or_else(|| malformed("empty domain".to_string()))?;
    if !domain::is_valid_domain(&name) {
        return Err(malformed(format!("invalid domain {:?}", name)));
    }

    Ok((rank, name))
}

fn looks_like_header(line: &str) -> bool {
    line.split(',')
        .next()
        .map(|field| field.trim().parse::<u64>().is_err())
        .unwrap_or(false)
}

fn log_malformed(date: NaiveDate, report: &ParseReport, err: &RankError) {
    if report.skipped <= MAX_DETAILED_WARNINGS {
        warn!(action = "skip", component = "snapshot_parser", date = %date, error = %err, "Skipping malformed record");
    } else {
        debug!(action = "skip", component = "snapshot_parser", date = %date, error = %err, "Skipping malformed record");
    }
}
