//! In-memory rank history: a sparse domain → date → rank map plus the date
//! each domain was first observed.
//!
//! The store only grows. A domain that drops out of the feed keeps its
//! earlier ranks and gets an [`RankCell::Absent`] marker for the dates it
//! was missing, so every committed date answers "rank of D on T" without
//! ambiguity.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;

use crate::snapshot::RankSnapshot;

/// One cell of the rank matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RankCell {
    Ranked(NonZeroU32),
    /// Known to history but missing from that date's snapshot.
    Absent,
}

impl RankCell {
    /// Decodes the persisted form, where `0` is the absence sentinel.
    pub fn from_raw(raw: u32) -> Self {
        NonZeroU32::new(raw).map_or(RankCell::Absent, RankCell::Ranked)
    }

    pub fn to_raw(self) -> u32 {
        match self {
            RankCell::Ranked(rank) => rank.get(),
            RankCell::Absent => 0,
        }
    }

    pub fn rank(self) -> Option<u32> {
        match self {
            RankCell::Ranked(rank) => Some(rank.get()),
            RankCell::Absent => None,
        }
    }

    pub fn is_absent(self) -> bool {
        matches!(self, RankCell::Absent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHistory {
    first_seen: NaiveDate,
    ranks: BTreeMap<NaiveDate, RankCell>,
}

impl DomainHistory {
    pub fn new(first_seen: NaiveDate) -> Self {
        Self {
            first_seen,
            ranks: BTreeMap::new(),
        }
    }

    pub fn first_seen(&self) -> NaiveDate {
        self.first_seen
    }

    pub fn ranks(&self) -> &BTreeMap<NaiveDate, RankCell> {
        &self.ranks
    }

    pub(crate) fn record(&mut self, date: NaiveDate, cell: RankCell) {
        self.ranks.insert(date, cell);
    }
}

/// What a single [`TimeSeriesStore::merge`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub ranked: usize,
    pub created: usize,
    pub marked_absent: usize,
    /// The date had already been merged and was overwritten.
    pub remerged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeSeriesStore {
    domains: BTreeMap<String, DomainHistory>,
    dates: BTreeSet<NaiveDate>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from persisted parts.
    pub(crate) fn restore(
        domains: BTreeMap<String, DomainHistory>,
        dates: BTreeSet<NaiveDate>,
    ) -> Self {
        Self { domains, dates }
    }

    /// Folds one day's snapshot into the history.
    ///
    /// Unknown domains are created with `first_seen = date`; known domains
    /// missing from the snapshot are marked absent for `date`, unless they
    /// were first seen after it. Re-merging a date overwrites that date's
    /// cells and leaves everything else alone.
    pub fn merge(&mut self, snapshot: &RankSnapshot) -> MergeOutcome {
        let date = snapshot.date();
        let mut outcome = MergeOutcome {
            remerged: !self.dates.insert(date),
            ..MergeOutcome::default()
        };

        for (name, rank) in snapshot.iter() {
            if !self.domains.contains_key(name) {
                self.domains.insert(name.to_string(), DomainHistory::new(date));
                outcome.created += 1;
            }
            if let Some(history) = self.domains.get_mut(name) {
                history.record(date, RankCell::from_raw(rank));
                outcome.ranked += 1;
            }
        }

        for (name, history) in self.domains.iter_mut() {
            if history.first_seen <= date && !snapshot.contains(name) {
                history.record(date, RankCell::Absent);
                outcome.marked_absent += 1;
            }
        }

        outcome
    }

    /// Rank of `domain` on `date`. `None` when the domain is unknown or the
    /// date was never merged; a missing cell on a merged date reads as absent.
    pub fn rank_on(&self, domain: &str, date: NaiveDate) -> Option<RankCell> {
        let history = self.domains.get(domain)?;
        if !self.dates.contains(&date) {
            return None;
        }
        Some(history.ranks.get(&date).copied().unwrap_or(RankCell::Absent))
    }

    pub fn first_seen(&self, domain: &str) -> Option<NaiveDate> {
        self.domains.get(domain).map(DomainHistory::first_seen)
    }

    pub fn history(&self, domain: &str) -> Option<&DomainHistory> {
        self.domains.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, &DomainHistory)> {
        self.domains.iter().map(|(name, h)| (name.as_str(), h))
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    pub fn dates(&self) -> &BTreeSet<NaiveDate> {
        &self.dates
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.dates.iter().next_back().copied()
    }

    pub fn nearest_date_on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.dates.range(..=date).next_back().copied()
    }

    pub fn domains_first_seen_on(&self, date: NaiveDate) -> Vec<&str> {
        self.domains
            .iter()
            .filter(|(_, h)| h.first_seen == date)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.dates.is_empty()
    }

    /// Number of materialised cells, absence markers included.
    pub fn cell_count(&self) -> usize {
        self.domains.values().map(|h| h.ranks.len()).sum()
    }
}
