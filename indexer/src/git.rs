use std::path::{Path, PathBuf};
use std::sync::Mutex;

use commitinfo_types::{CommitId, FileChange, LogCommit, PersonIdent, RefTip};
use git2::{
    Commit, Delta, Diff, DiffFile, DiffFindOptions, DiffOptions, ObjectType, Oid, Patch, Repository, Signature,
    Sort, TreeWalkMode, TreeWalkResult,
};
use tracing::trace;

use crate::error::{Result, poisoned};

/// What a history walk reports for each commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Follow only the first parent of merges.
    pub first_parent: bool,
    /// Report renames as one change instead of a delete plus an add.
    pub detect_renames: bool,
    /// Count added and deleted lines per file.
    pub line_changes: bool,
}

/// Git primitives the indexing engine relies on.
pub trait GitRepository: Send + Sync {
    /// Commits reachable from `until` but not from `since`, parents before children.
    fn rev_list(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        first_parent: bool,
    ) -> Result<Vec<CommitId>>;

    /// Streams the commits of `since..until` (parents first) to `consumer`.
    /// Merge commits carry no file changes, except on first-parent walks where
    /// they are diffed against their first parent.
    fn log(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        options: LogOptions,
        consumer: &mut dyn FnMut(LogCommit) -> Result<()>,
    ) -> Result<()>;

    fn has_object(&self, id: &CommitId) -> Result<bool>;

    /// True when `ancestor` equals `descendant` or is reachable from it.
    fn is_merged_into(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool>;

    /// Branch and tag tips, peeled to commits.
    fn commit_refs(&self) -> Result<Vec<RefTip>>;

    fn commit_time(&self, id: &CommitId) -> Result<i64>;

    fn list_files(&self, commit: &CommitId) -> Result<Vec<String>>;

    fn file_changes(
        &self,
        from: &CommitId,
        to: &CommitId,
        detect_renames: bool,
    ) -> Result<Vec<FileChange>>;
}

/// [`GitRepository`] backed by libgit2.
pub struct LocalRepository {
    path: PathBuf,
    repo: Mutex<Repository>,
}

impl LocalRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            repo: Mutex::new(repo),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> Result<T>) -> Result<T> {
        let repo = self
            .repo
            .lock()
            .map_err(poisoned("git repository mutex"))?;
        f(&repo)
    }
}

fn oid(id: &CommitId) -> Result<Oid> {
    Ok(Oid::from_bytes(id.as_bytes())?)
}

fn commit_id(oid: Oid) -> CommitId {
    CommitId::from_slice(oid.as_bytes()).unwrap_or(CommitId::ZERO)
}

fn person(signature: &Signature<'_>) -> PersonIdent {
    PersonIdent {
        name: String::from_utf8_lossy(signature.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(signature.email_bytes()).into_owned(),
        when: signature.when().seconds(),
    }
}

fn walk(
    repo: &Repository,
    until: &CommitId,
    since: Option<&CommitId>,
    first_parent: bool,
) -> Result<Vec<Oid>> {
    let mut revwalk = repo.revwalk()?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    revwalk.push(oid(until)?)?;
    if let Some(since) = since {
        revwalk.hide(oid(since)?)?;
    }
    if first_parent {
        revwalk.simplify_first_parent()?;
    }
    let mut oids = Vec::new();
    for entry in revwalk {
        oids.push(entry?);
    }
    Ok(oids)
}

fn commit_diff<'r>(
    repo: &'r Repository,
    commit: &Commit<'_>,
    options: LogOptions,
) -> Result<Option<Diff<'r>>> {
    if commit.parent_count() > 1 && !options.first_parent {
        return Ok(None);
    }
    let tree = commit.tree()?;
    let parent_tree = if commit.parent_count() >= 1 {
        Some(commit.parent(0)?.tree()?)
    } else {
        None
    };
    let mut diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    if options.detect_renames {
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;
    }
    Ok(Some(diff))
}

fn file_path(file: DiffFile<'_>) -> Option<String> {
    file.path()
        .map(|path| path.to_string_lossy().replace('\\', "/"))
}

fn diff_changes(diff: &Diff<'_>, line_changes: bool) -> Result<Vec<FileChange>> {
    let mut changes = Vec::with_capacity(diff.deltas().len());
    for (idx, delta) in diff.deltas().enumerate() {
        let (old_path, new_path) = match delta.status() {
            Delta::Added | Delta::Copied => (None, file_path(delta.new_file())),
            Delta::Deleted => (file_path(delta.old_file()), None),
            Delta::Unmodified | Delta::Ignored | Delta::Untracked => continue,
            _ => (file_path(delta.old_file()), file_path(delta.new_file())),
        };

        let (additions, deletions) = if line_changes {
            match Patch::from_diff(diff, idx)? {
                Some(patch) => {
                    let (_, additions, deletions) = patch.line_stats()?;
                    (additions as i32, deletions as i32)
                }
                None => (0, 0),
            }
        } else {
            (0, 0)
        };

        changes.push(FileChange {
            old_path,
            new_path,
            additions,
            deletions,
        });
    }
    Ok(changes)
}

fn load_commit(repo: &Repository, oid: Oid, options: LogOptions) -> Result<LogCommit> {
    let commit = repo.find_commit(oid)?;
    let changes = match commit_diff(repo, &commit, options)? {
        Some(diff) => diff_changes(&diff, options.line_changes)?,
        None => Vec::new(),
    };
    Ok(LogCommit {
        id: commit_id(oid),
        parents: commit.parent_ids().map(commit_id).collect(),
        author: Some(person(&commit.author())),
        committer: Some(person(&commit.committer())),
        commit_time: commit.time().seconds(),
        message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        changes,
    })
}

impl GitRepository for LocalRepository {
    fn rev_list(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        first_parent: bool,
    ) -> Result<Vec<CommitId>> {
        self.with_repo(|repo| {
            Ok(walk(repo, until, since, first_parent)?
                .into_iter()
                .map(commit_id)
                .collect())
        })
    }

    fn log(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        options: LogOptions,
        consumer: &mut dyn FnMut(LogCommit) -> Result<()>,
    ) -> Result<()> {
        let oids = self.with_repo(|repo| walk(repo, until, since, options.first_parent))?;
        // The repository lock is released before handing each commit out, so
        // consumers may query the repository themselves.
        for oid in oids {
            let commit = self.with_repo(|repo| load_commit(repo, oid, options))?;
            trace!(commit = %oid, changes = commit.changes.len(), "streaming commit");
            consumer(commit)?;
        }
        Ok(())
    }

    fn has_object(&self, id: &CommitId) -> Result<bool> {
        self.with_repo(|repo| Ok(repo.odb()?.exists(oid(id)?)))
    }

    fn is_merged_into(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        self.with_repo(|repo| Ok(repo.graph_descendant_of(oid(descendant)?, oid(ancestor)?)?))
    }

    fn commit_refs(&self) -> Result<Vec<RefTip>> {
        self.with_repo(|repo| {
            let mut tips = Vec::new();
            for reference in repo.references()? {
                let reference = reference?;
                let Some(name) = reference.name() else {
                    continue;
                };
                if !name.starts_with("refs/heads/") && !name.starts_with("refs/tags/") {
                    continue;
                }
                let Ok(commit) = reference.peel_to_commit() else {
                    continue;
                };
                tips.push(RefTip {
                    name: name.to_string(),
                    commit: commit_id(commit.id()),
                    commit_time: commit.time().seconds(),
                });
            }
            Ok(tips)
        })
    }

    fn commit_time(&self, id: &CommitId) -> Result<i64> {
        self.with_repo(|repo| Ok(repo.find_commit(oid(id)?)?.time().seconds()))
    }

    fn list_files(&self, commit: &CommitId) -> Result<Vec<String>> {
        self.with_repo(|repo| {
            let tree = repo.find_commit(oid(commit)?)?.tree()?;
            let mut files = Vec::new();
            tree.walk(TreeWalkMode::PreOrder, |root, entry| {
                if entry.kind() == Some(ObjectType::Blob) {
                    if let Some(name) = entry.name() {
                        files.push(format!("{root}{name}"));
                    }
                }
                TreeWalkResult::Ok
            })?;
            Ok(files)
        })
    }

    fn file_changes(
        &self,
        from: &CommitId,
        to: &CommitId,
        detect_renames: bool,
    ) -> Result<Vec<FileChange>> {
        self.with_repo(|repo| {
            let old_tree = repo.find_commit(oid(from)?)?.tree()?;
            let new_tree = repo.find_commit(oid(to)?)?.tree()?;
            let mut opts = DiffOptions::new();
            opts.ignore_submodules(true);
            let mut diff =
                repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;
            if detect_renames {
                diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;
            }
            diff_changes(&diff, false)
        })
    }
}
