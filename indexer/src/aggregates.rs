//! Mainline aggregates of the default branch: per-day line increments per
//! language, per-day contributions per author, and the file list of the tip.
//! Each keeps its own checkpoint and is rebuilt alone when that checkpoint can
//! no longer be trusted.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use commitinfo_types::{CommitId, Contribution, Day, FileChange, LogCommit};
use tracing::{info, warn};

use crate::codec::{decode_contributions, decode_int, encode_contributions, int_key};
use crate::collector::{CollectContext, existing_checkpoint, read_commit_key};
use crate::config::RepoSettings;
use crate::dictionary;
use crate::error::Result;
use crate::git::{GitRepository, LogOptions};
use crate::store::{StoreName, Txn, keys};
use crate::utils::language_of;

/// Net added lines per language, bucketed by commit day.
pub type LineStats = BTreeMap<Day, BTreeMap<String, i32>>;

const MAINLINE_DIFFS: LogOptions = LogOptions {
    first_parent: true,
    detect_renames: false,
    line_changes: true,
};

/// A mainline checkpoint is kept only if its commit exists and is still an
/// ancestor of `tip`; after a force push the aggregate starts over.
fn mainline_checkpoint(
    git: &dyn GitRepository,
    checkpoint: Option<CommitId>,
    tip: CommitId,
    label: &'static str,
) -> Option<CommitId> {
    let checkpoint = existing_checkpoint(git, checkpoint, label)?;
    match git.is_merged_into(&checkpoint, &tip) {
        Ok(true) => Some(checkpoint),
        Ok(false) => {
            warn!(
                stage = "aggregate",
                event = "checkpoint.diverged",
                checkpoint = label,
                commit = %checkpoint,
                tip = %tip,
                "checkpoint is not an ancestor of the tip; rebuilding from scratch"
            );
            None
        }
        Err(err) => {
            warn!(
                stage = "aggregate",
                event = "checkpoint.diverged",
                checkpoint = label,
                commit = %checkpoint,
                tip = %tip,
                error = %err,
                "failed to check checkpoint ancestry; rebuilding from scratch"
            );
            None
        }
    }
}

fn read_checkpoint(ctx: &CollectContext<'_>, key: &'static [u8]) -> Result<Option<CommitId>> {
    ctx.env
        .compute_in_readonly_transaction(|txn| read_commit_key(txn, key))
}

pub(crate) fn read_line_stats(txn: &Txn<'_>) -> Result<LineStats> {
    match txn.get(StoreName::Default, keys::LINE_STATS)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(LineStats::new()),
    }
}

/// Net line change per language of one commit, restricted to analyzed paths.
/// Languages whose changes cancel out are omitted.
fn language_increments(repo: &RepoSettings, changes: &[FileChange]) -> BTreeMap<&'static str, i32> {
    let mut increments = BTreeMap::new();
    for change in changes {
        let Some(path) = change.path() else {
            continue;
        };
        let lines = change.additions - change.deletions;
        if lines == 0 || !change.paths().any(|candidate| repo.analyzes(candidate)) {
            continue;
        }
        if let Some(language) = language_of(path) {
            *increments.entry(language).or_insert(0) += lines;
        }
    }
    increments.retain(|_, lines| *lines != 0);
    increments
}

pub(crate) fn apply_line_stats(repo: &RepoSettings, stats: &mut LineStats, commit: &LogCommit) {
    let increments = language_increments(repo, &commit.changes);
    if increments.is_empty() {
        return;
    }
    let on_day = stats.entry(commit.day()).or_default();
    for (language, lines) in increments {
        *on_day.entry(language.to_string()).or_insert(0) += lines;
    }
}

/// Replays mainline diffs of `(lastCommitOfLineStats, tip]`. Returns false when
/// the checkpoint already is `tip`.
pub fn collect_line_stats(ctx: &CollectContext<'_>, tip: CommitId) -> Result<bool> {
    let start = Instant::now();
    let stored = read_checkpoint(ctx, keys::LAST_COMMIT_OF_LINE_STATS)?;
    let last = mainline_checkpoint(ctx.git, stored, tip, "lastCommitOfLineStats");
    if last == Some(tip) {
        return Ok(false);
    }

    let commits = ctx.env.compute_in_transaction(|txn| {
        let mut stats = match last {
            Some(_) => read_line_stats(txn)?,
            None => LineStats::new(),
        };
        let mut commits = 0usize;
        ctx.git
            .log(&tip, last.as_ref(), MAINLINE_DIFFS, &mut |commit| {
                apply_line_stats(ctx.repo, &mut stats, &commit);
                commits += 1;
                Ok(())
            })?;
        txn.put(StoreName::Default, keys::LINE_STATS, &serde_json::to_vec(&stats)?)?;
        txn.put(
            StoreName::Default,
            keys::LAST_COMMIT_OF_LINE_STATS,
            tip.as_bytes(),
        )?;
        Ok(commits)
    })?;

    info!(
        stage = "aggregate",
        event = "line_stats.end",
        result = "ok",
        repo = ctx.repo.id,
        commit = %tip,
        rebuilt = last.is_none(),
        commits,
        duration_ms = start.elapsed().as_millis(),
        "updated line statistics"
    );
    Ok(true)
}

/// One commit's contribution: the commit itself plus lines changed on analyzed paths.
pub(crate) fn contribution_of(repo: &RepoSettings, commit: &LogCommit) -> Contribution {
    let mut contribution = Contribution::new(1, 0, 0);
    for change in &commit.changes {
        if change.paths().any(|path| repo.analyzes(path)) {
            contribution.additions += change.additions;
            contribution.deletions += change.deletions;
        }
    }
    contribution
}

pub(crate) fn read_overall_contributions(txn: &Txn<'_>) -> Result<BTreeMap<i32, Contribution>> {
    match txn.get(StoreName::Default, keys::OVERALL_CONTRIBUTIONS)? {
        Some(bytes) => decode_contributions("default_store", &bytes),
        None => Ok(BTreeMap::new()),
    }
}

pub(crate) fn read_daily_contributions(
    txn: &Txn<'_>,
    day: i32,
) -> Result<BTreeMap<i32, Contribution>> {
    match txn.get(StoreName::DailyContributions, &int_key(day))? {
        Some(bytes) => decode_contributions("daily_contributions", &bytes),
        None => Ok(BTreeMap::new()),
    }
}

/// Accumulates contributions of non-merge mainline commits of
/// `(lastCommitOfContribs, tip]`, overall per day and per author per day.
pub fn collect_contributions(ctx: &CollectContext<'_>, tip: CommitId) -> Result<bool> {
    let start = Instant::now();
    let stored = read_checkpoint(ctx, keys::LAST_COMMIT_OF_CONTRIBS)?;
    let last = mainline_checkpoint(ctx.git, stored, tip, "lastCommitOfContribs");
    if last == Some(tip) {
        return Ok(false);
    }

    let commits = ctx.env.compute_in_transaction(|txn| {
        if last.is_none() {
            txn.clear(StoreName::DailyContributions)?;
            txn.delete(StoreName::Default, keys::OVERALL_CONTRIBUTIONS)?;
        }
        let mut overall = read_overall_contributions(txn)?;
        let mut daily: HashMap<i32, BTreeMap<i32, Contribution>> = HashMap::new();
        let mut commits = 0usize;

        ctx.git
            .log(&tip, last.as_ref(), MAINLINE_DIFFS, &mut |commit| {
                if commit.is_merge() {
                    return Ok(());
                }
                let day = commit.day().0;
                let contribution = contribution_of(ctx.repo, &commit);
                overall.entry(day).or_default().merge(&contribution);

                if let Some(author) = &commit.author {
                    let user = dictionary::user_index(txn, &author.name_and_email())?;
                    let on_day = match daily.entry(day) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            let existing = match read_daily_contributions(txn, day) {
                                Ok(existing) => existing,
                                Err(err) => {
                                    warn!(
                                        stage = "aggregate",
                                        event = "contributions.corrupt",
                                        repo = ctx.repo.id,
                                        day,
                                        error = %err,
                                        "discarding unreadable daily contributions"
                                    );
                                    BTreeMap::new()
                                }
                            };
                            entry.insert(existing)
                        }
                    };
                    on_day.entry(user).or_default().merge(&contribution);
                }
                commits += 1;
                Ok(())
            })?;

        for (day, contributions) in &daily {
            txn.put(
                StoreName::DailyContributions,
                &int_key(*day),
                &encode_contributions(contributions),
            )?;
        }
        txn.put(
            StoreName::Default,
            keys::OVERALL_CONTRIBUTIONS,
            &encode_contributions(&overall),
        )?;
        txn.put(StoreName::Default, keys::LAST_COMMIT_OF_CONTRIBS, tip.as_bytes())?;
        Ok(commits)
    })?;

    info!(
        stage = "aggregate",
        event = "contributions.end",
        result = "ok",
        repo = ctx.repo.id,
        commit = %tip,
        rebuilt = last.is_none(),
        commits,
        duration_ms = start.elapsed().as_millis(),
        "updated contributions"
    );
    Ok(true)
}

pub(crate) fn read_files(txn: &Txn<'_>) -> Result<BTreeSet<String>> {
    match txn.get(StoreName::Default, keys::FILES)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(BTreeSet::new()),
    }
}

pub(crate) fn read_file_count(txn: &Txn<'_>) -> Result<i32> {
    match txn.get(StoreName::Default, keys::FILE_COUNT)? {
        Some(bytes) => decode_int("default_store", &bytes),
        None => Ok(0),
    }
}

fn apply_file_change(files: &mut BTreeSet<String>, change: FileChange) -> bool {
    match (change.old_path, change.new_path) {
        (None, Some(new)) => files.insert(new),
        (Some(old), None) => files.remove(&old),
        (Some(old), Some(new)) if old != new => {
            let removed = files.remove(&old);
            files.insert(new) || removed
        }
        _ => false,
    }
}

/// Keeps the file list of the default branch tip current. Without a checkpoint
/// the tip tree is listed; otherwise the tree diff since the checkpoint is
/// applied. Returns whether the list changed.
pub fn collect_files(ctx: &CollectContext<'_>, tip: CommitId) -> Result<bool> {
    let start = Instant::now();
    let stored = read_checkpoint(ctx, keys::LAST_COMMIT_OF_FILES)?;
    let last = existing_checkpoint(ctx.git, stored, "lastCommitOfFiles");
    if last == Some(tip) {
        return Ok(false);
    }

    let (changed, count) = match last {
        None => {
            let files: BTreeSet<String> = ctx.git.list_files(&tip)?.into_iter().collect();
            ctx.env.compute_in_transaction(|txn| {
                write_files(txn, &files)?;
                txn.put(StoreName::Default, keys::LAST_COMMIT_OF_FILES, tip.as_bytes())?;
                Ok((true, files.len()))
            })?
        }
        Some(last) => {
            let changes = ctx.git.file_changes(&last, &tip, true)?;
            ctx.env.compute_in_transaction(|txn| {
                let mut files = read_files(txn)?;
                let mut changed = false;
                for change in changes {
                    changed |= apply_file_change(&mut files, change);
                }
                if changed {
                    write_files(txn, &files)?;
                }
                txn.put(StoreName::Default, keys::LAST_COMMIT_OF_FILES, tip.as_bytes())?;
                Ok((changed, files.len()))
            })?
        }
    };

    if changed {
        ctx.cache.invalidate_files(ctx.repo.id);
    }
    info!(
        stage = "aggregate",
        event = "files.end",
        result = "ok",
        repo = ctx.repo.id,
        commit = %tip,
        rebuilt = last.is_none(),
        changed,
        files = count,
        duration_ms = start.elapsed().as_millis(),
        "updated file list"
    );
    Ok(changed)
}

fn write_files(txn: &Txn<'_>, files: &BTreeSet<String>) -> Result<()> {
    txn.put(StoreName::Default, keys::FILES, &serde_json::to_vec(files)?)?;
    let count = i32::try_from(files.len()).unwrap_or(i32::MAX);
    txn.put(StoreName::Default, keys::FILE_COUNT, &int_key(count))
}
