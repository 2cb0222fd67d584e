use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use commitinfo_types::NameAndEmail;

use crate::config::RepoId;
use crate::error::Result;

#[derive(Debug, Default)]
struct RepoEntry {
    commit_count: Option<i32>,
    users: Option<Arc<Vec<NameAndEmail>>>,
    files: Option<Arc<Vec<String>>>,
    file_count: Option<i32>,
}

/// Read-through cache of the hottest per-repository queries. Entries are
/// dropped by the writer right after the transaction that changed them.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<RepoId, RepoEntry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, repo: RepoId, field: impl FnOnce(&RepoEntry) -> Option<T>) -> Option<T> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&repo).and_then(field)
    }

    fn write(&self, repo: RepoId, update: impl FnOnce(&mut RepoEntry)) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        update(entries.entry(repo).or_default());
    }

    pub fn commit_count(&self, repo: RepoId, load: impl FnOnce() -> Result<i32>) -> Result<i32> {
        if let Some(count) = self.read(repo, |entry| entry.commit_count) {
            return Ok(count);
        }
        let count = load()?;
        self.write(repo, |entry| entry.commit_count = Some(count));
        Ok(count)
    }

    pub fn users(
        &self,
        repo: RepoId,
        load: impl FnOnce() -> Result<Vec<NameAndEmail>>,
    ) -> Result<Arc<Vec<NameAndEmail>>> {
        if let Some(users) = self.read(repo, |entry| entry.users.clone()) {
            return Ok(users);
        }
        let users = Arc::new(load()?);
        self.write(repo, |entry| entry.users = Some(Arc::clone(&users)));
        Ok(users)
    }

    pub fn files(
        &self,
        repo: RepoId,
        load: impl FnOnce() -> Result<Vec<String>>,
    ) -> Result<Arc<Vec<String>>> {
        if let Some(files) = self.read(repo, |entry| entry.files.clone()) {
            return Ok(files);
        }
        let files = Arc::new(load()?);
        self.write(repo, |entry| entry.files = Some(Arc::clone(&files)));
        Ok(files)
    }

    pub fn file_count(&self, repo: RepoId, load: impl FnOnce() -> Result<i32>) -> Result<i32> {
        if let Some(count) = self.read(repo, |entry| entry.file_count) {
            return Ok(count);
        }
        let count = load()?;
        self.write(repo, |entry| entry.file_count = Some(count));
        Ok(count)
    }

    pub fn invalidate_commit_count(&self, repo: RepoId) {
        self.write(repo, |entry| entry.commit_count = None);
    }

    pub fn invalidate_users(&self, repo: RepoId) {
        self.write(repo, |entry| entry.users = None);
    }

    pub fn invalidate_files(&self, repo: RepoId) {
        self.write(repo, |entry| {
            entry.files = None;
            entry.file_count = None;
        });
    }

    pub fn remove(&self, repo: RepoId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&repo);
    }
}
