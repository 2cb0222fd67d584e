use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const COMMIT_ID_LEN: usize = 20;

/// A git object id. Serialized as a 40 character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId([u8; COMMIT_ID_LEN]);

impl CommitId {
    pub const ZERO: CommitId = CommitId([0u8; COMMIT_ID_LEN]);

    pub fn new(bytes: [u8; COMMIT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; COMMIT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; COMMIT_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; COMMIT_ID_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommitIdError(String);

impl fmt::Display for ParseCommitIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid commit id '{}'", self.0)
    }
}

impl std::error::Error for ParseCommitIdError {}

impl FromStr for CommitId {
    type Err = ParseCommitIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = hex::decode(trimmed).map_err(|_| ParseCommitIdError(trimmed.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| ParseCommitIdError(trimmed.to_string()))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.short())
    }
}

impl Serialize for CommitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Author or committer identity. Ordered by name, then email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameAndEmail {
    pub name: String,
    pub email: String,
}

impl NameAndEmail {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for NameAndEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Calendar day as a count of days since 1970-01-01 (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Day(pub i32);

const SECONDS_PER_DAY: i64 = 86_400;

impl Day {
    pub fn from_timestamp(epoch_seconds: i64) -> Self {
        Day(epoch_seconds.div_euclid(SECONDS_PER_DAY) as i32)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
        Day(date.signed_duration_since(epoch).num_days() as i32)
    }

    pub fn to_date(self) -> Option<NaiveDate> {
        DateTime::from_timestamp(i64::from(self.0) * SECONDS_PER_DAY, 0).map(|dt| dt.date_naive())
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_date() {
            Some(date) => write!(f, "{date}"),
            None => write!(f, "day#{}", self.0),
        }
    }
}

/// Commit, addition and deletion totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub commits: i32,
    pub additions: i32,
    pub deletions: i32,
}

impl Contribution {
    pub fn new(commits: i32, additions: i32, deletions: i32) -> Self {
        Self {
            commits,
            additions,
            deletions,
        }
    }

    pub fn merge(&mut self, other: &Contribution) {
        self.commits += other.commits;
        self.additions += other.additions;
        self.deletions += other.deletions;
    }

    pub fn is_empty(&self) -> bool {
        self.commits == 0 && self.additions == 0 && self.deletions == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    Commits,
    Additions,
    Deletions,
}

impl ContributionKind {
    pub fn value_of(self, contribution: &Contribution) -> i32 {
        match self {
            ContributionKind::Commits => contribution.commits,
            ContributionKind::Additions => contribution.additions,
            ContributionKind::Deletions => contribution.deletions,
        }
    }
}

impl FromStr for ContributionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commits" => Ok(ContributionKind::Commits),
            "additions" => Ok(ContributionKind::Additions),
            "deletions" => Ok(ContributionKind::Deletions),
            other => Err(format!("unknown contribution kind '{other}'")),
        }
    }
}

/// Ranked contributor with totals and the per-day breakdown inside the queried range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub author: NameAndEmail,
    pub total: Contribution,
    pub daily: BTreeMap<Day, Contribution>,
}

/// One file entry of a commit diff. Either side is absent for additions and deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub additions: i32,
    pub deletions: i32,
}

impl FileChange {
    pub fn is_rename(&self) -> bool {
        matches!((&self.old_path, &self.new_path), (Some(old), Some(new)) if old != new)
    }

    /// Every distinct path touched by this change.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        let new = self.new_path.as_deref();
        let old = self.old_path.as_deref().filter(|old| Some(*old) != new);
        new.into_iter().chain(old)
    }

    pub fn path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonIdent {
    pub name: String,
    pub email: String,
    pub when: i64,
}

impl PersonIdent {
    pub fn name_and_email(&self) -> NameAndEmail {
        NameAndEmail::new(self.name.clone(), self.email.clone())
    }
}

/// A commit as streamed by a history walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCommit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub author: Option<PersonIdent>,
    pub committer: Option<PersonIdent>,
    pub commit_time: i64,
    pub message: String,
    #[serde(default)]
    pub changes: Vec<FileChange>,
}

impl LogCommit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Day of the commit date.
    pub fn day(&self) -> Day {
        Day::from_timestamp(self.commit_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTip {
    pub name: String,
    pub commit: CommitId,
    pub commit_time: i64,
}
