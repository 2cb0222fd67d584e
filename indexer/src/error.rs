use std::sync::PoisonError;

use thiserror::Error;

use crate::config::RepoId;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt record in store '{store}': {detail}")]
    Corrupt { store: &'static str, detail: String },
    #[error("repository {repo} is served by '{active}', not by this node")]
    NotActive { repo: RepoId, active: String },
    #[error("unknown repository {0}")]
    UnknownRepository(RepoId),
    #[error("{0} poisoned by a panicking thread")]
    Poisoned(&'static str),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IndexError {
    pub fn corrupt(store: &'static str, detail: impl Into<String>) -> Self {
        IndexError::Corrupt {
            store,
            detail: detail.into(),
        }
    }
}

/// Maps a poisoned lock to [`IndexError::Poisoned`], for use with `map_err`.
pub(crate) fn poisoned<T>(what: &'static str) -> impl FnOnce(PoisonError<T>) -> IndexError {
    move |_| IndexError::Poisoned(what)
}
