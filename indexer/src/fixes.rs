//! Issue-fixing commits. For every issue only the most specific fixing
//! commits are kept: a commit superseded by one of its descendants is dropped.

use std::collections::HashSet;

use commitinfo_types::CommitId;
use regex::Regex;
use tracing::warn;

use crate::codec::{decode_commits, encode_commits, long_key};
use crate::error::{IndexError, Result};
use crate::git::GitRepository;
use crate::graph;
use crate::store::{StoreName, Txn};

pub const DEFAULT_FIX_KEYWORDS: [&str; 12] = [
    "fix", "fixes", "fixed", "fixing", "resolve", "resolves", "resolved", "resolving", "close",
    "closes", "closed", "closing",
];

/// Extracts issue numbers from phrases such as `fixes #12` or `closes #3, #4 and #9`.
#[derive(Debug, Clone)]
pub struct FixIssueParser {
    phrase: Regex,
    reference: Regex,
}

impl FixIssueParser {
    pub fn new(keywords: &[String]) -> Result<Self> {
        let alternatives = if keywords.is_empty() {
            DEFAULT_FIX_KEYWORDS
                .iter()
                .map(|keyword| regex::escape(keyword))
                .collect::<Vec<_>>()
        } else {
            keywords
                .iter()
                .map(|keyword| regex::escape(keyword.trim()))
                .collect()
        };
        let phrase = Regex::new(&format!(
            r"(?i)\b(?:{})\b:?\s+(#\d+(?:\s*(?:,|\band\b)\s*#\d+)*)",
            alternatives.join("|")
        ))
        .map_err(|err| IndexError::Internal(anyhow::anyhow!("invalid fix keywords: {err}")))?;
        let reference = Regex::new(r"#(\d+)")
            .map_err(|err| IndexError::Internal(anyhow::anyhow!("invalid issue pattern: {err}")))?;
        Ok(Self { phrase, reference })
    }

    /// Issue numbers in order of first mention.
    pub fn parse(&self, message: &str) -> Vec<u64> {
        let mut seen = HashSet::new();
        let mut issues = Vec::new();
        for phrase in self.phrase.captures_iter(message) {
            let Some(refs) = phrase.get(1) else {
                continue;
            };
            for reference in self.reference.captures_iter(refs.as_str()) {
                let Some(number) = reference.get(1) else {
                    continue;
                };
                match number.as_str().parse::<u64>() {
                    Ok(issue) if seen.insert(issue) => issues.push(issue),
                    Ok(_) => {}
                    Err(err) => warn!(
                        reference = number.as_str(),
                        error = %err,
                        "skipping unparsable issue reference"
                    ),
                }
            }
        }
        issues
    }
}

fn fix_commits_of(txn: &Txn<'_>, issue: u64) -> Result<Vec<CommitId>> {
    Ok(txn
        .get(StoreName::FixCommits, &long_key(issue))?
        .map(|bytes| decode_commits(&bytes))
        .unwrap_or_default())
}

/// Adds `candidate` as a fixing commit of `issue`, dropping existing entries that
/// are its ancestors. The candidate is not added when an existing entry already
/// descends from it. Returns whether the candidate was added.
pub fn record_fix(
    txn: &Txn<'_>,
    git: &dyn GitRepository,
    issue: u64,
    candidate: CommitId,
) -> Result<bool> {
    let existing = fix_commits_of(txn, issue)?;
    if existing.contains(&candidate) {
        return Ok(false);
    }

    let mut kept = Vec::with_capacity(existing.len() + 1);
    let mut add = true;
    for current in existing {
        match git.is_merged_into(&current, &candidate) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => warn!(
                issue,
                commit = %current,
                candidate = %candidate,
                error = %err,
                "failed to check fix commit ancestry; keeping both"
            ),
        }
        match git.is_merged_into(&candidate, &current) {
            Ok(true) => add = false,
            Ok(false) => {}
            Err(err) => warn!(
                issue,
                commit = %current,
                candidate = %candidate,
                error = %err,
                "failed to check fix commit ancestry; keeping both"
            ),
        }
        kept.push(current);
    }
    if add {
        kept.push(candidate);
    }

    txn.put(StoreName::FixCommits, &long_key(issue), &encode_commits(&kept))?;
    Ok(add)
}

/// Fixing commits of `issue` that are reachable from one of `tips`.
pub fn fix_commits(txn: &Txn<'_>, issue: u64, tips: &HashSet<CommitId>) -> Result<Vec<CommitId>> {
    let mut reachable = Vec::new();
    for candidate in fix_commits_of(txn, issue)? {
        if tips.contains(&candidate)
            || graph::descendants(txn, &[candidate])?
                .iter()
                .any(|descendant| tips.contains(descendant))
        {
            reachable.push(candidate);
        }
    }
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Environment;
    use crate::testing::FakeGit;

    fn id(byte: u8) -> CommitId {
        CommitId::new([byte; 20])
    }

    #[test]
    fn parses_keywords_and_reference_lists() {
        let parser = FixIssueParser::new(&[]).expect("parser");
        assert_eq!(parser.parse("Fixes #12"), vec![12]);
        assert_eq!(parser.parse("closes #3, #4 and #9; resolved: #3"), vec![3, 4, 9]);
        assert_eq!(parser.parse("prefix#12 is not a fix phrase"), Vec::<u64>::new());
        assert!(parser.parse("mentions #5 without keyword").is_empty());
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let parser = FixIssueParser::new(&["repairs".to_string()]).expect("parser");
        assert_eq!(parser.parse("repairs #7"), vec![7]);
        assert!(parser.parse("fixes #7").is_empty());
    }

    #[test]
    fn descendant_supersedes_ancestor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let (a, b) = (id(1), id(2));
        let git = FakeGit::default().with_edge(a, b);

        let (first, second, third) = env
            .compute_in_transaction(|txn| {
                Ok((
                    record_fix(txn, &git, 42, a)?,
                    record_fix(txn, &git, 42, b)?,
                    record_fix(txn, &git, 42, a)?,
                ))
            })
            .expect("record");
        assert!(first && second && !third);

        let stored = env
            .compute_in_readonly_transaction(|txn| fix_commits_of(txn, 42))
            .expect("read");
        assert_eq!(stored, vec![b]);
    }

    #[test]
    fn unrelated_fixes_are_both_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let git = FakeGit::default();

        env.compute_in_transaction(|txn| {
            record_fix(txn, &git, 1, id(5))?;
            record_fix(txn, &git, 1, id(6))?;
            Ok(())
        })
        .expect("record");

        let stored = env
            .compute_in_readonly_transaction(|txn| fix_commits_of(txn, 1))
            .expect("read");
        assert_eq!(stored, vec![id(5), id(6)]);
    }

    #[test]
    fn query_keeps_only_commits_reaching_a_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let git = FakeGit::default();
        let (fix, child, dangling, tip) = (id(1), id(2), id(3), id(4));

        env.compute_in_transaction(|txn| {
            graph::add_child(txn, &fix, &child)?;
            graph::add_child(txn, &child, &tip)?;
            record_fix(txn, &git, 9, fix)?;
            record_fix(txn, &git, 9, dangling)?;
            Ok(())
        })
        .expect("record");

        let reachable = env
            .compute_in_readonly_transaction(|txn| fix_commits(txn, 9, &HashSet::from([tip])))
            .expect("query");
        assert_eq!(reachable, vec![fix]);
    }
}
