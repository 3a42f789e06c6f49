//! Core domain model, record-key layout, and derived-statistics math for FARP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "farp-core";

/// The four external bibliographic sources records can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    GoogleScholar,
    Scopus,
    WebOfScience,
    Orcid,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::GoogleScholar,
        Source::Scopus,
        Source::WebOfScience,
        Source::Orcid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::GoogleScholar => "google_scholar",
            Source::Scopus => "scopus",
            Source::WebOfScience => "web_of_science",
            Source::Orcid => "orcid",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record classification as reported by the source, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Journal,
    Conference,
    Book,
    Chapter,
}

/// Venue scope tag carried on conference records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueScope {
    International,
    National,
}

/// Per-source external identifiers, each independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub google_scholar_id: Option<String>,
    pub scopus_id: Option<String>,
    pub researcher_id: Option<String>,
    pub orcid_id: Option<String>,
}

impl ExternalIds {
    pub fn for_source(&self, source: Source) -> Option<&str> {
        match source {
            Source::GoogleScholar => self.google_scholar_id.as_deref(),
            Source::Scopus => self.scopus_id.as_deref(),
            Source::WebOfScience => self.researcher_id.as_deref(),
            Source::Orcid => self.orcid_id.as_deref(),
        }
    }

    pub fn any(&self) -> bool {
        Source::ALL.iter().any(|s| self.for_source(*s).is_some())
    }
}

/// Faculty identity plus external-source handles and sync bookkeeping.
///
/// Created at account creation by the surrounding system; mutated by profile
/// setup and by every successful sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyProfile {
    pub user_id: String,
    pub faculty_id: String,
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub designation: Option<String>,
    pub research_area: Option<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub profile_setup_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// One externally observed publication/conference/book entry.
///
/// `(user_id, source, stable_key)` is unique: re-fetching the same source
/// overwrites in place and never duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub user_id: String,
    pub source: Source,
    pub stable_key: String,
    pub title: String,
    pub year: i32,
    pub citations: u32,
    pub kind: RecordKind,
    pub venue_scope: Option<VenueScope>,
    pub venue: Option<String>,
    pub authors: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn key(&self) -> String {
        keys::record(&self.user_id, self.source, &self.stable_key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationStats {
    pub total: usize,
    pub this_year: usize,
    pub journals: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceStats {
    pub total: usize,
    pub international: usize,
    pub national: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookStats {
    pub total: usize,
    pub books: usize,
    pub chapters: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationStats {
    pub total: u64,
    pub h_index: usize,
    pub i10_index: usize,
}

/// Derived per-user aggregate, always a pure function of the user's current
/// record set. Carries no timestamps and no accumulated state, so it is safe
/// to discard and recompute at any time. `Default` is the zeroed snapshot
/// served before any sync has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub publications: PublicationStats,
    pub conferences: ConferenceStats,
    pub books: BookStats,
    pub citations: CitationStats,
}

/// Per-user weekly refresh schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchedule {
    pub user_id: String,
    pub enabled: bool,
    pub next_due_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

/// Fixed refresh cadence: one week.
pub fn sync_cadence() -> chrono::Duration {
    chrono::Duration::days(7)
}

/// Composite-key layout for the record store.
///
/// Every persisted value lives under one of these key families; prefix scans
/// over `record:{userId}:` return all of a user's records regardless of
/// source.
pub mod keys {
    use super::Source;

    pub const SCHEDULE_PREFIX: &str = "schedule:";

    pub fn faculty_profile(user_id: &str) -> String {
        format!("faculty_profile:{user_id}")
    }

    pub fn record(user_id: &str, source: Source, stable_key: &str) -> String {
        format!("record:{user_id}:{}:{stable_key}", source.as_str())
    }

    pub fn user_records(user_id: &str) -> String {
        format!("record:{user_id}:")
    }

    pub fn source_records(user_id: &str, source: Source) -> String {
        format!("record:{user_id}:{}:", source.as_str())
    }

    pub fn stats(user_id: &str) -> String {
        format!("stats:{user_id}")
    }

    pub fn schedule(user_id: &str) -> String {
        format!("{}{user_id}", SCHEDULE_PREFIX)
    }
}

/// Pure statistics computation over a user's full record set.
pub mod stats {
    use super::{RecordKind, SourceRecord, StatisticsSnapshot, VenueScope};

    /// Largest `h` such that at least `h` records have >= `h` citations each.
    /// Empty input yields 0.
    pub fn h_index(citations: &[u32]) -> usize {
        let mut sorted = citations.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        let mut h = 0;
        for (i, &c) in sorted.iter().enumerate() {
            if c as usize >= i + 1 {
                h = i + 1;
            } else {
                break;
            }
        }
        h
    }

    /// Count of records with at least 10 citations.
    pub fn i10_index(citations: &[u32]) -> usize {
        citations.iter().filter(|&&c| c >= 10).count()
    }

    /// Recompute the full snapshot from the current record set.
    ///
    /// Deterministic and side-effect-free: the same input set produces the
    /// same snapshot regardless of record order or any prior snapshot.
    pub fn compute_snapshot(records: &[SourceRecord], current_year: i32) -> StatisticsSnapshot {
        let citations: Vec<u32> = records.iter().map(|r| r.citations).collect();

        let mut snapshot = StatisticsSnapshot {
            publications: super::PublicationStats {
                total: records.len(),
                this_year: records.iter().filter(|r| r.year == current_year).count(),
                journals: records
                    .iter()
                    .filter(|r| r.kind == RecordKind::Journal)
                    .count(),
            },
            ..StatisticsSnapshot::default()
        };

        for record in records {
            match record.kind {
                RecordKind::Conference => {
                    snapshot.conferences.total += 1;
                    match record.venue_scope {
                        Some(VenueScope::International) => snapshot.conferences.international += 1,
                        Some(VenueScope::National) => snapshot.conferences.national += 1,
                        None => {}
                    }
                }
                RecordKind::Book => {
                    snapshot.books.total += 1;
                    snapshot.books.books += 1;
                }
                RecordKind::Chapter => {
                    snapshot.books.total += 1;
                    snapshot.books.chapters += 1;
                }
                RecordKind::Journal => {}
            }
        }

        snapshot.citations = super::CitationStats {
            total: citations.iter().map(|&c| u64::from(c)).sum(),
            h_index: h_index(&citations),
            i10_index: i10_index(&citations),
        };

        snapshot
    }
}
