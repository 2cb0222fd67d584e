//! Incremental collection of commit history into the per-repository stores.
//!
//! A collection run walks the commits reachable from the new tip but not from
//! the last collected tip and applies them in ranges `(since, until]`, one
//! transaction per range. Range boundaries are mainline commits, so each one is
//! an ancestor of the next and a crash between ranges leaves a consistent state
//! that the next run resumes from.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use commitinfo_types::{CommitId, NameAndEmail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregates;
use crate::cache::QueryCache;
use crate::codec::{commit_count_key, decode_int, int_key, long_key};
use crate::config::{IndexerConfig, RepoSettings};
use crate::dictionary;
use crate::error::Result;
use crate::fixes::{self, FixIssueParser};
use crate::git::{GitRepository, LogOptions};
use crate::graph;
use crate::history;
use crate::store::{Environment, StoreName, Txn, keys};
use crate::utils::path_and_parents;

/// Everything a collection run needs for one repository.
pub struct CollectContext<'a> {
    pub env: &'a Environment,
    pub git: &'a dyn GitRepository,
    pub repo: &'a RepoSettings,
    pub config: &'a IndexerConfig,
    pub fix_parser: &'a FixIssueParser,
    pub cache: &'a QueryCache,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectOutcome {
    pub commits_collected: usize,
    pub checkpoints: Vec<CommitId>,
    /// Issues that gained a fixing commit during this run.
    pub attached_issues: BTreeSet<u64>,
    pub line_stats_updated: bool,
    pub contributions_updated: bool,
    pub files_updated: bool,
}

#[derive(Debug, Default)]
struct RangeOutcome {
    commits: usize,
    attached_issues: BTreeSet<u64>,
}

/// Splits `history` (parents first) into checkpoints. A cut is made once at
/// least `batch_size` commits were seen since the previous cut and the current
/// commit is on the mainline. The last checkpoint is always `tip`.
pub fn plan_checkpoints(
    history: &[CommitId],
    mainline: &HashSet<CommitId>,
    batch_size: usize,
    tip: CommitId,
) -> Vec<CommitId> {
    let batch_size = batch_size.max(1);
    let mut checkpoints = Vec::new();
    let mut pending = 0usize;
    for commit in history {
        pending += 1;
        if pending >= batch_size && mainline.contains(commit) {
            checkpoints.push(*commit);
            pending = 0;
        }
    }
    if checkpoints.last() != Some(&tip) {
        checkpoints.push(tip);
    }
    checkpoints
}

pub(crate) fn read_commit_key(txn: &Txn<'_>, key: &[u8]) -> Result<Option<CommitId>> {
    Ok(txn
        .get(StoreName::Default, key)?
        .and_then(|bytes| CommitId::from_slice(&bytes)))
}

pub(crate) fn read_int_key(txn: &Txn<'_>, key: &[u8]) -> Result<i32> {
    match txn.get(StoreName::Default, key)? {
        Some(bytes) => decode_int("default_store", &bytes),
        None => Ok(0),
    }
}

pub(crate) fn read_users(txn: &Txn<'_>) -> Result<BTreeSet<NameAndEmail>> {
    match txn.get(StoreName::Default, keys::USERS)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(BTreeSet::new()),
    }
}

/// A checkpoint is only trusted while its commit still exists in the repository.
pub(crate) fn existing_checkpoint(
    git: &dyn GitRepository,
    checkpoint: Option<CommitId>,
    label: &'static str,
) -> Option<CommitId> {
    let checkpoint = checkpoint?;
    match git.has_object(&checkpoint) {
        Ok(true) => Some(checkpoint),
        Ok(false) => {
            warn!(
                stage = "collect",
                event = "checkpoint.missing",
                checkpoint = label,
                commit = %checkpoint,
                "checkpoint commit no longer exists; rebuilding from scratch"
            );
            None
        }
        Err(err) => {
            warn!(
                stage = "collect",
                event = "checkpoint.missing",
                checkpoint = label,
                commit = %checkpoint,
                error = %err,
                "failed to look up checkpoint commit; rebuilding from scratch"
            );
            None
        }
    }
}

/// Collects everything reachable from `tip` and, for the default branch, the
/// mainline aggregates. Running it again with the same tip writes nothing.
pub fn collect(ctx: &CollectContext<'_>, tip: CommitId, ref_name: &str) -> Result<CollectOutcome> {
    let start = Instant::now();
    let repo_id = ctx.repo.id;
    info!(
        stage = "collect",
        event = "collect.begin",
        repo = repo_id,
        ref_name = %ref_name,
        commit = %tip,
        "starting commit collection"
    );

    let mut outcome = CollectOutcome::default();

    let (collected, last) = ctx.env.compute_in_readonly_transaction(|txn| {
        Ok((
            graph::is_collected(txn, &tip)?,
            read_commit_key(txn, keys::LAST_COMMIT)?,
        ))
    })?;

    if collected {
        debug!(repo = repo_id, commit = %tip, "tip already collected");
    } else {
        let last = existing_checkpoint(ctx.git, last, "lastCommit");
        let history = ctx.git.rev_list(&tip, last.as_ref(), false)?;
        if !history.is_empty() {
            let mainline: HashSet<CommitId> = ctx
                .git
                .rev_list(&tip, last.as_ref(), true)?
                .into_iter()
                .collect();
            let checkpoints =
                plan_checkpoints(&history, &mainline, ctx.config.collect_batch_size, tip);
            info!(
                stage = "collect",
                event = "collect.plan",
                repo = repo_id,
                history = history.len(),
                mainline = mainline.len(),
                checkpoints = checkpoints.len(),
                "planned checkpoints"
            );

            let mut since = last;
            for checkpoint in &checkpoints {
                let range = collect_range(ctx, since, *checkpoint)?;
                outcome.commits_collected += range.commits;
                outcome.attached_issues.extend(range.attached_issues);
                since = Some(*checkpoint);
            }
            outcome.checkpoints = checkpoints;
        }
    }

    if ctx.repo.is_default_branch(ref_name) {
        outcome.line_stats_updated = aggregates::collect_line_stats(ctx, tip)?;
        outcome.contributions_updated = aggregates::collect_contributions(ctx, tip)?;
        outcome.files_updated = aggregates::collect_files(ctx, tip)?;
    }

    info!(
        stage = "collect",
        event = "collect.end",
        result = "ok",
        repo = repo_id,
        ref_name = %ref_name,
        commit = %tip,
        commits_collected = outcome.commits_collected,
        checkpoints = outcome.checkpoints.len(),
        attached_issues = outcome.attached_issues.len(),
        duration_ms = start.elapsed().as_millis(),
        "commit collection completed"
    );
    Ok(outcome)
}

/// Applies the commits of `(since, until]` in one transaction and moves the
/// `lastCommit` checkpoint to `until`.
fn collect_range(
    ctx: &CollectContext<'_>,
    since: Option<CommitId>,
    until: CommitId,
) -> Result<RangeOutcome> {
    let start = Instant::now();
    let range = ctx.env.compute_in_transaction(|txn| {
        let mut outcome = RangeOutcome::default();
        let mut users = read_users(txn)?;
        let users_before = users.len();
        let mut commit_count = read_int_key(txn, keys::COMMIT_COUNT)?;
        let mut count_deltas: HashMap<u64, i32> = HashMap::new();

        let options = LogOptions {
            first_parent: false,
            detect_renames: true,
            line_changes: false,
        };
        ctx.git.log(&until, since.as_ref(), options, &mut |commit| {
            if !graph::mark_collected(txn, &commit.id)? {
                return Ok(());
            }
            for parent in &commit.parents {
                graph::add_child(txn, parent, &commit.id)?;
            }
            commit_count += 1;
            outcome.commits += 1;

            for issue in ctx.fix_parser.parse(&commit.message) {
                if fixes::record_fix(txn, ctx.git, issue, commit.id)? {
                    outcome.attached_issues.insert(issue);
                }
            }

            if let Some(committer) = &commit.committer {
                users.insert(committer.name_and_email());
            }

            if let Some(author) = &commit.author {
                let identity = author.name_and_email();
                dictionary::user_index(txn, &identity)?;
                users.insert(identity);
                let email_index = dictionary::email_index(txn, &author.email)?;

                // The root is counted through the changed paths, so merges and
                // empty commits leave it untouched.
                let mut touched: BTreeSet<&str> = BTreeSet::new();
                for change in &commit.changes {
                    for path in change.paths() {
                        touched.extend(path_and_parents(path));
                    }
                }
                for path in touched {
                    let path_index = dictionary::path_index(txn, path)?;
                    *count_deltas
                        .entry(commit_count_key(email_index, path_index))
                        .or_default() += 1;
                }
            }

            for change in &commit.changes {
                if let (true, Some(old), Some(new)) =
                    (change.is_rename(), &change.old_path, &change.new_path)
                {
                    history::record_rename(txn, old, new, ctx.config.max_history_paths)?;
                }
            }
            Ok(())
        })?;

        for (key, delta) in count_deltas {
            let key = long_key(key);
            let current = match txn.get(StoreName::CommitCounts, &key)? {
                Some(bytes) => decode_int("commit_counts", &bytes)?,
                None => 0,
            };
            txn.put(StoreName::CommitCounts, &key, &int_key(current + delta))?;
        }

        if users.len() != users_before {
            txn.put(StoreName::Default, keys::USERS, &serde_json::to_vec(&users)?)?;
        }
        txn.put(StoreName::Default, keys::COMMIT_COUNT, &int_key(commit_count))?;
        txn.put(StoreName::Default, keys::LAST_COMMIT, until.as_bytes())?;
        Ok(outcome)
    })?;

    ctx.cache.invalidate_commit_count(ctx.repo.id);
    ctx.cache.invalidate_users(ctx.repo.id);

    debug!(
        stage = "collect",
        event = "collect.range.end",
        result = "ok",
        repo = ctx.repo.id,
        since = ?since,
        until = %until,
        commits = range.commits,
        duration_ms = start.elapsed().as_millis(),
        "collected commit range"
    );
    Ok(range)
}
