//! Read side: the query vocabulary shared by local execution and forwarding,
//! and the queries that need more than a single key lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use commitinfo_types::{
    CommitId, Contribution, ContributionKind, Contributor, Day, NameAndEmail,
};
use serde::{Deserialize, Serialize};

use crate::aggregates::{LineStats, read_daily_contributions, read_overall_contributions};
use crate::codec::{commit_count_key, decode_int, long_key};
use crate::dictionary;
use crate::error::Result;
use crate::store::{StoreName, Txn};

/// An email address of a platform user, as handed in by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub value: String,
    pub verified: bool,
}

impl EmailAddress {
    pub fn verified(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            verified: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    CommitCount,
    FileCount,
    Files,
    Users,
    LineIncrements,
    OverallContributions,
    TopContributors {
        top: usize,
        kind: ContributionKind,
        from: Day,
        to: Day,
    },
    HistoryPaths {
        path: String,
    },
    Descendants {
        ancestors: Vec<CommitId>,
    },
    FixCommits {
        issue: u64,
    },
    SortUsersByContribution {
        user_emails: BTreeMap<u64, Vec<EmailAddress>>,
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    Count(i32),
    Files(Vec<String>),
    Users(Vec<NameAndEmail>),
    LineIncrements(LineStats),
    OverallContributions(BTreeMap<Day, Contribution>),
    TopContributors(Vec<Contributor>),
    Paths(BTreeSet<String>),
    Commits(Vec<CommitId>),
    UserIds(Vec<u64>),
}

/// The platform user owning a verified email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailOwner {
    pub display_name: String,
    /// Primary address of the owner, present only when it is verified.
    pub primary_email: Option<String>,
}

/// Maps raw commit identities to platform users at query time, so a user
/// verifying another address is reflected without collecting again.
pub trait IdentityDirectory: Send + Sync {
    /// Owner of `email` when the address is verified and belongs to a user.
    fn verified_owner(&self, email: &str) -> Option<EmailOwner>;
}

/// No platform users: every identity is reported as committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentities;

impl IdentityDirectory for NoIdentities {
    fn verified_owner(&self, _email: &str) -> Option<EmailOwner> {
        None
    }
}

pub(crate) fn resolve_identity(identities: &dyn IdentityDirectory, raw: NameAndEmail) -> NameAndEmail {
    match identities.verified_owner(&raw.email) {
        Some(owner) => {
            let email = owner.primary_email.unwrap_or(raw.email);
            NameAndEmail::new(owner.display_name, email)
        }
        None => raw,
    }
}

pub(crate) fn overall_contributions(txn: &Txn<'_>) -> Result<BTreeMap<Day, Contribution>> {
    Ok(read_overall_contributions(txn)?
        .into_iter()
        .map(|(day, contribution)| (Day(day), contribution))
        .collect())
}

/// Ranks resolved contributors over `[from, to]` by `kind`, highest first.
/// Raw identities resolving to the same user are merged.
pub(crate) fn top_contributors(
    txn: &Txn<'_>,
    identities: &dyn IdentityDirectory,
    top: usize,
    kind: ContributionKind,
    from: Day,
    to: Day,
) -> Result<Vec<Contributor>> {
    let mut resolved: HashMap<i32, Option<NameAndEmail>> = HashMap::new();
    let mut totals: HashMap<NameAndEmail, Contribution> = HashMap::new();
    let mut daily: HashMap<NameAndEmail, BTreeMap<Day, Contribution>> = HashMap::new();

    for day in read_overall_contributions(txn)?.into_keys() {
        if day < from.0 || day > to.0 {
            continue;
        }
        for (user_index, contribution) in read_daily_contributions(txn, day)? {
            let user = match resolved.get(&user_index) {
                Some(user) => user.clone(),
                None => {
                    let user = dictionary::user_of(txn, user_index)?
                        .map(|raw| resolve_identity(identities, raw));
                    resolved.insert(user_index, user.clone());
                    user
                }
            };
            let Some(user) = user else {
                continue;
            };
            totals.entry(user.clone()).or_default().merge(&contribution);
            daily
                .entry(user)
                .or_default()
                .entry(Day(day))
                .or_default()
                .merge(&contribution);
        }
    }

    let mut ranked: Vec<(NameAndEmail, Contribution)> = totals.into_iter().collect();
    ranked.sort_by(|(a_user, a), (b_user, b)| {
        kind.value_of(b)
            .cmp(&kind.value_of(a))
            .then_with(|| a_user.cmp(b_user))
    });
    ranked.truncate(top);

    Ok(ranked
        .into_iter()
        .map(|(author, total)| Contributor {
            daily: daily.remove(&author).unwrap_or_default(),
            author,
            total,
        })
        .collect())
}

/// Commits touching `path` authored under any of the verified `emails`.
fn commit_count_on_path(txn: &Txn<'_>, emails: &[EmailAddress], path: &str) -> Result<i64> {
    let Some(path_index) = dictionary::find_path(txn, path)? else {
        return Ok(0);
    };
    let mut count = 0i64;
    for email in emails.iter().filter(|email| email.verified) {
        let Some(email_index) = dictionary::find_email(txn, &email.value)? else {
            continue;
        };
        let key = long_key(commit_count_key(email_index, path_index));
        if let Some(bytes) = txn.get(StoreName::CommitCounts, &key)? {
            count += i64::from(decode_int("commit_counts", &bytes)?);
        }
    }
    Ok(count)
}

/// Orders users by how often they committed to `files`, most active first.
/// A file nobody committed to is replaced by its closest parent directory with
/// commits, falling back to the repository root. At most `max_files` files are
/// consulted.
pub(crate) fn sort_users_by_contribution(
    txn: &Txn<'_>,
    user_emails: &BTreeMap<u64, Vec<EmailAddress>>,
    files: &[String],
    max_files: usize,
) -> Result<Vec<u64>> {
    if user_emails.len() <= 1 {
        return Ok(user_emails.keys().copied().collect());
    }

    let mut counts: BTreeMap<u64, i64> = user_emails.keys().map(|user| (*user, 0)).collect();
    let mut add_counts = |path: &str| -> Result<i64> {
        let mut added = 0;
        for (user, emails) in user_emails {
            let count = commit_count_on_path(txn, emails, path)?;
            *counts.entry(*user).or_insert(0) += count;
            added += count;
        }
        Ok(added)
    };

    for file in files.iter().take(max_files) {
        let mut path = file.as_str();
        while add_counts(path)? == 0 {
            match path.rfind('/') {
                Some(idx) => path = &path[..idx],
                None => {
                    add_counts("")?;
                    break;
                }
            }
        }
    }

    let mut users: Vec<(u64, i64)> = counts.into_iter().collect();
    users.sort_by(|(a_user, a), (b_user, b)| b.cmp(a).then_with(|| a_user.cmp(b_user)));
    Ok(users.into_iter().map(|(user, _)| user).collect())
}
