//! Core domain model for jobwatch: watch targets, postings, fingerprints and seen-history.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Number of fingerprints a target remembers; older entries are evicted first.
pub const HISTORY_CAPACITY: usize = 100;

const FINGERPRINT_SEPARATOR: u8 = 0x1f;

/// Hex-encoded SHA-256 content digest identifying a posting across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintId(String);

impl FingerprintId {
    /// Wraps a digest previously produced by [`fingerprint`], e.g. one read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FingerprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic digest over `(title, organization, url)`.
///
/// Fields are joined with the ASCII unit separator so that moving characters between
/// adjacent fields always changes the digest input.
pub fn fingerprint(title: &str, organization: &str, url: &str) -> FingerprintId {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([FINGERPRINT_SEPARATOR]);
    hasher.update(organization.as_bytes());
    hasher.update([FINGERPRINT_SEPARATOR]);
    hasher.update(url.as_bytes());
    FingerprintId(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Hourly => "hourly",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            Cadence::Hourly => Duration::hours(1),
            Cadence::Daily => Duration::days(1),
            Cadence::Weekly => Duration::weeks(1),
        }
    }
}

impl FromStr for Cadence {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Cadence::Hourly),
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            other => Err(ParseEnumError {
                kind: "cadence",
                value: other.to_string(),
            }),
        }
    }
}

/// User-driven lifecycle state. The pipeline reads it but never changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Active,
    Paused,
    Inactive,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Active => "active",
            TargetStatus::Paused => "paused",
            TargetStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for TargetStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TargetStatus::Active),
            "paused" => Ok(TargetStatus::Paused),
            "inactive" => Ok(TargetStatus::Inactive),
            other => Err(ParseEnumError {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Bounded FIFO ring of previously seen fingerprints, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<FingerprintId>", into = "Vec<FingerprintId>")]
pub struct SeenHistory {
    entries: VecDeque<FingerprintId>,
}

impl SeenHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fingerprint: &FingerprintId) -> bool {
        self.entries.contains(fingerprint)
    }

    pub fn push(&mut self, fingerprint: FingerprintId) {
        self.entries.push_back(fingerprint);
        if self.entries.len() > HISTORY_CAPACITY {
            let overflow = self.entries.len() - HISTORY_CAPACITY;
            self.entries.drain(..overflow);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FingerprintId> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<FingerprintId> {
        self.entries.iter().cloned().collect()
    }
}

impl Extend<FingerprintId> for SeenHistory {
    fn extend<I: IntoIterator<Item = FingerprintId>>(&mut self, iter: I) {
        for fingerprint in iter {
            self.push(fingerprint);
        }
    }
}

impl FromIterator<FingerprintId> for SeenHistory {
    fn from_iter<I: IntoIterator<Item = FingerprintId>>(iter: I) -> Self {
        let mut history = SeenHistory::new();
        history.extend(iter);
        history
    }
}

impl From<Vec<FingerprintId>> for SeenHistory {
    fn from(entries: Vec<FingerprintId>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<SeenHistory> for Vec<FingerprintId> {
    fn from(history: SeenHistory) -> Self {
        history.entries.into()
    }
}

/// A user-configured monitoring subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub id: Uuid,
    pub source_url: String,
    pub organization: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default)]
    pub status: TargetStatus,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: SeenHistory,
    pub destination: String,
}

impl WatchTarget {
    pub fn new(
        source_url: impl Into<String>,
        organization: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            organization: organization.into(),
            keywords: Vec::new(),
            cadence: Cadence::default(),
            status: TargetStatus::default(),
            last_checked: None,
            history: SeenHistory::new(),
            destination: destination.into(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }

    /// True when the cadence interval has elapsed since the last successful check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked {
            None => true,
            Some(last) => now - last >= self.cadence.interval(),
        }
    }

    /// Case-insensitive substring match against the keyword filter; empty filter matches all.
    pub fn matches_keywords(&self, title: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let title = title.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| title.contains(&keyword.to_lowercase()))
    }
}

/// A posting extracted from a page, before dedup filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePosting {
    pub title: String,
    pub location: String,
    pub url: String,
}

/// A fingerprinted posting owned by a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub target_id: Uuid,
    pub title: String,
    pub organization: String,
    pub location: String,
    pub url: String,
    pub discovered_at: DateTime<Utc>,
    pub fingerprint: FingerprintId,
}

impl Posting {
    pub fn from_candidate(
        target: &WatchTarget,
        candidate: CandidatePosting,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = fingerprint(&candidate.title, &target.organization, &candidate.url);
        Self {
            id: Uuid::new_v5(&target.id, fingerprint.as_str().as_bytes()),
            target_id: target.id,
            title: candidate.title,
            organization: target.organization.clone(),
            location: candidate.location,
            url: candidate.url,
            discovered_at,
            fingerprint,
        }
    }
}

/// Stamps candidates and keeps those whose fingerprint is absent from the target's history.
///
/// A fingerprint repeated within `candidates` is kept once.
pub fn filter_new(
    target: &WatchTarget,
    candidates: Vec<CandidatePosting>,
    now: DateTime<Utc>,
) -> Vec<Posting> {
    let mut kept = HashSet::new();
    candidates
        .into_iter()
        .map(|candidate| Posting::from_candidate(target, candidate, now))
        .filter(|posting| {
            !target.history.contains(&posting.fingerprint) && kept.insert(posting.fingerprint.clone())
        })
        .collect()
}

/// Appends the postings' fingerprints to history and advances `last_checked`.
pub fn record_seen(mut target: WatchTarget, postings: &[Posting], now: DateTime<Utc>) -> WatchTarget {
    target
        .history
        .extend(postings.iter().map(|posting| posting.fingerprint.clone()));
    target.last_checked = Some(match target.last_checked {
        Some(previous) => previous.max(now),
        None => now,
    });
    target
}
