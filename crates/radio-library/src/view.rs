//! Sorted and filtered projections of the library.
//!
//! Projections copy records out and never touch stored order.  Every sort
//! uses `sort_by`, which is stable, so equal keys keep their relative order
//! between renders.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::StationRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOption {
    /// Most recently played first; never-played stations last.
    #[default]
    Recent,
    NameAsc,
    NameDesc,
    DateAddedAsc,
    DateAddedDesc,
    ListeningAsc,
    ListeningDesc,
    /// Country code A→Z, stations without a code last.
    Country,
    /// Highest bitrate first.
    Bitrate,
    /// Most votes first.
    Votes,
}

impl SortOption {
    pub const ALL: [SortOption; 10] = [
        SortOption::Recent,
        SortOption::NameAsc,
        SortOption::NameDesc,
        SortOption::DateAddedAsc,
        SortOption::DateAddedDesc,
        SortOption::ListeningAsc,
        SortOption::ListeningDesc,
        SortOption::Country,
        SortOption::Bitrate,
        SortOption::Votes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortOption::Recent => "recent",
            SortOption::NameAsc => "name-asc",
            SortOption::NameDesc => "name-desc",
            SortOption::DateAddedAsc => "date-added-asc",
            SortOption::DateAddedDesc => "date-added-desc",
            SortOption::ListeningAsc => "listening-asc",
            SortOption::ListeningDesc => "listening-desc",
            SortOption::Country => "country",
            SortOption::Bitrate => "bitrate",
            SortOption::Votes => "votes",
        }
    }
}

impl fmt::Display for SortOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|o| o.as_str() == s.trim())
            .ok_or_else(|| format!("unknown sort option: {s}"))
    }
}

/// Case-insensitive substring match against the display and custom names.
/// An empty query matches everything.
pub fn matches_filter(record: &StationRecord, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    record.display_name.to_lowercase().contains(&needle)
        || record
            .custom_name
            .as_deref()
            .is_some_and(|c| c.to_lowercase().contains(&needle))
}

/// Filter then sort.  `listening_ms` supplies each record's aggregate
/// listening time; it is written into the returned copies.
pub fn project<'a, I, F>(records: I, sort: SortOption, filter: &str, listening_ms: F) -> Vec<StationRecord>
where
    I: IntoIterator<Item = &'a StationRecord>,
    F: Fn(&StationRecord) -> u64,
{
    let mut out: Vec<StationRecord> = records
        .into_iter()
        .filter(|r| matches_filter(r, filter))
        .map(|r| {
            let mut copy = r.clone();
            copy.total_listening_time_ms = listening_ms(r);
            copy
        })
        .collect();
    sort_records(&mut out, sort);
    out
}

pub fn sort_records(records: &mut [StationRecord], sort: SortOption) {
    match sort {
        SortOption::Recent => records.sort_by(|a, b| recency(b).cmp(&recency(a))),
        SortOption::NameAsc => records.sort_by(|a, b| name_key(a).cmp(&name_key(b))),
        SortOption::NameDesc => records.sort_by(|a, b| name_key(b).cmp(&name_key(a))),
        SortOption::DateAddedAsc => records.sort_by(|a, b| a.date_added.cmp(&b.date_added)),
        SortOption::DateAddedDesc => records.sort_by(|a, b| b.date_added.cmp(&a.date_added)),
        SortOption::ListeningAsc => {
            records.sort_by(|a, b| a.total_listening_time_ms.cmp(&b.total_listening_time_ms))
        }
        SortOption::ListeningDesc => {
            records.sort_by(|a, b| b.total_listening_time_ms.cmp(&a.total_listening_time_ms))
        }
        SortOption::Country => records.sort_by(compare_country),
        SortOption::Bitrate => {
            records.sort_by(|a, b| b.bitrate_kbps.unwrap_or(0).cmp(&a.bitrate_kbps.unwrap_or(0)))
        }
        SortOption::Votes => {
            records.sort_by(|a, b| b.vote_count.unwrap_or(0).cmp(&a.vote_count.unwrap_or(0)))
        }
    }
}

fn recency(record: &StationRecord) -> i64 {
    record
        .last_played_at
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

fn name_key(record: &StationRecord) -> String {
    record.name().to_lowercase()
}

fn country_code(record: &StationRecord) -> Option<String> {
    record
        .country_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_uppercase)
}

fn compare_country(a: &StationRecord, b: &StationRecord) -> Ordering {
    match (country_code(a), country_code(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
