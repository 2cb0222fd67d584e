use std::path::PathBuf;

use glob::Pattern;

use crate::error::{IndexError, Result};

pub type RepoId = u64;

pub const DEFAULT_COLLECT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_MAX_HISTORY_PATHS: usize = 100;
pub const DEFAULT_MAX_COMMIT_FILES: usize = 100;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub data_dir: PathBuf,
    /// Maximum number of commits applied in one checkpoint transaction.
    pub collect_batch_size: usize,
    pub max_history_paths: usize,
    /// Upper bound on files consulted when ranking users by contribution.
    pub max_commit_files: usize,
    pub local_server: String,
}

impl IndexerConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            collect_batch_size: DEFAULT_COLLECT_BATCH_SIZE,
            max_history_paths: DEFAULT_MAX_HISTORY_PATHS,
            max_commit_files: DEFAULT_MAX_COMMIT_FILES,
            local_server: "local".to_string(),
        }
    }

    pub fn with_collect_batch_size(mut self, size: usize) -> Self {
        self.collect_batch_size = size.max(1);
        self
    }

    pub fn with_max_history_paths(mut self, cap: usize) -> Self {
        self.max_history_paths = cap.max(1);
        self
    }

    pub fn with_local_server(mut self, server: impl Into<String>) -> Self {
        self.local_server = server.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct RepoSettings {
    pub id: RepoId,
    pub name: String,
    pub git_dir: PathBuf,
    pub default_branch: String,
    /// Limits line statistics and contributions to matching paths. Empty means every path.
    pub code_analysis_patterns: Vec<Pattern>,
    /// Overrides the default fix keywords when non-empty.
    pub fix_keywords: Vec<String>,
}

impl RepoSettings {
    pub fn new(id: RepoId, name: impl Into<String>, git_dir: PathBuf) -> Self {
        Self {
            id,
            name: name.into(),
            git_dir,
            default_branch: "main".to_string(),
            code_analysis_patterns: Vec::new(),
            fix_keywords: Vec::new(),
        }
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    pub fn with_code_analysis_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.code_analysis_patterns = patterns
            .into_iter()
            .map(|raw| {
                Pattern::new(raw.as_ref()).map_err(|err| {
                    IndexError::Internal(anyhow::anyhow!(
                        "invalid code analysis pattern '{}': {err}",
                        raw.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    pub fn with_fix_keywords(mut self, keywords: Vec<String>) -> Self {
        self.fix_keywords = keywords;
        self
    }

    pub fn default_branch_ref(&self) -> String {
        format!("refs/heads/{}", self.default_branch)
    }

    pub fn is_default_branch(&self, ref_name: &str) -> bool {
        ref_name == self.default_branch_ref()
    }

    pub fn analyzes(&self, path: &str) -> bool {
        self.code_analysis_patterns.is_empty()
            || self
                .code_analysis_patterns
                .iter()
                .any(|pattern| pattern.matches(path))
    }
}
