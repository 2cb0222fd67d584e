use std::collections::{HashMap, HashSet};

use commitinfo_types::{CommitId, FileChange, LogCommit, PersonIdent, RefTip};

use crate::error::Result;
use crate::git::{GitRepository, LogOptions};

pub fn id(byte: u8) -> CommitId {
    CommitId::new([byte; 20])
}

/// A linear commit authored by `author` at `commit_time`.
pub fn commit(
    byte: u8,
    parent: Option<u8>,
    author: &str,
    commit_time: i64,
    message: &str,
    changes: Vec<FileChange>,
) -> LogCommit {
    let ident = PersonIdent {
        name: author.to_string(),
        email: format!("{}@example.com", author.to_ascii_lowercase()),
        when: commit_time,
    };
    LogCommit {
        id: id(byte),
        parents: parent.map(id).into_iter().collect(),
        author: Some(ident.clone()),
        committer: Some(ident),
        commit_time,
        message: message.to_string(),
        changes,
    }
}

pub fn modified(path: &str, additions: i32, deletions: i32) -> FileChange {
    FileChange {
        old_path: Some(path.to_string()),
        new_path: Some(path.to_string()),
        additions,
        deletions,
    }
}

pub fn added(path: &str, additions: i32) -> FileChange {
    FileChange {
        old_path: None,
        new_path: Some(path.to_string()),
        additions,
        deletions: 0,
    }
}

pub fn renamed(old: &str, new: &str) -> FileChange {
    FileChange {
        old_path: Some(old.to_string()),
        new_path: Some(new.to_string()),
        additions: 0,
        deletions: 0,
    }
}

/// In-memory repository for unit tests. Scripted commits form one linear
/// history in insertion order; extra edges only feed reachability checks.
#[derive(Debug, Default)]
pub struct FakeGit {
    parents: HashMap<CommitId, Vec<CommitId>>,
    commits: Vec<LogCommit>,
    refs: Vec<RefTip>,
    files: HashMap<CommitId, Vec<String>>,
}

impl FakeGit {
    pub fn with_edge(mut self, parent: CommitId, child: CommitId) -> Self {
        self.parents.entry(child).or_default().push(parent);
        self.parents.entry(parent).or_default();
        self
    }

    pub fn with_commit(mut self, commit: LogCommit) -> Self {
        let parents = self.parents.entry(commit.id).or_default();
        for parent in &commit.parents {
            if !parents.contains(parent) {
                parents.push(*parent);
            }
        }
        self.commits.push(commit);
        self
    }

    pub fn with_ref(mut self, name: &str, commit: CommitId) -> Self {
        self.parents.entry(commit).or_default();
        self.refs.push(RefTip {
            name: name.to_string(),
            commit,
            commit_time: 0,
        });
        self
    }

    pub fn with_files(mut self, commit: CommitId, files: &[&str]) -> Self {
        self.files
            .insert(commit, files.iter().map(|file| file.to_string()).collect());
        self
    }

    fn range(&self, until: &CommitId, since: Option<&CommitId>) -> &[LogCommit] {
        let Some(end) = self.commits.iter().position(|commit| commit.id == *until) else {
            return &[];
        };
        let begin = since
            .and_then(|since| self.commits.iter().position(|commit| commit.id == *since))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        if begin > end {
            return &[];
        }
        &self.commits[begin..=end]
    }
}

impl GitRepository for FakeGit {
    fn rev_list(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        _first_parent: bool,
    ) -> Result<Vec<CommitId>> {
        Ok(self.range(until, since).iter().map(|commit| commit.id).collect())
    }

    fn log(
        &self,
        until: &CommitId,
        since: Option<&CommitId>,
        _options: LogOptions,
        consumer: &mut dyn FnMut(LogCommit) -> Result<()>,
    ) -> Result<()> {
        for commit in self.range(until, since) {
            consumer(commit.clone())?;
        }
        Ok(())
    }

    fn has_object(&self, id: &CommitId) -> Result<bool> {
        Ok(self.parents.contains_key(id))
    }

    fn is_merged_into(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        let mut stack = vec![*descendant];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == *ancestor {
                return Ok(true);
            }
            if seen.insert(current) {
                if let Some(parents) = self.parents.get(&current) {
                    stack.extend(parents.iter().copied());
                }
            }
        }
        Ok(false)
    }

    fn commit_refs(&self) -> Result<Vec<RefTip>> {
        Ok(self.refs.clone())
    }

    fn commit_time(&self, id: &CommitId) -> Result<i64> {
        Ok(self
            .commits
            .iter()
            .find(|commit| commit.id == *id)
            .map(|commit| commit.commit_time)
            .unwrap_or(0))
    }

    fn list_files(&self, commit: &CommitId) -> Result<Vec<String>> {
        Ok(self.files.get(commit).cloned().unwrap_or_default())
    }

    fn file_changes(
        &self,
        from: &CommitId,
        to: &CommitId,
        _detect_renames: bool,
    ) -> Result<Vec<FileChange>> {
        Ok(self
            .range(to, Some(from))
            .iter()
            .flat_map(|commit| commit.changes.iter().cloned())
            .collect())
    }
}
