use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use commitinfo_indexer::RepoId;
use commitinfo_indexer::cluster::ClusterRouter;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::scheduler::{IndexEvent, Scheduler};

/// Which server is active for each repository, as written by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipFile {
    #[serde(default)]
    pub repos: BTreeMap<RepoId, String>,
}

impl OwnershipFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ownership file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse ownership file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create ownership directory {}", parent.display())
            })?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(self).context("failed to serialize ownership")?;
        std::fs::write(&tmp_path, raw)
            .with_context(|| format!("failed to write temp ownership {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to move temp ownership {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    /// Repositories owned by `server` here but not in `previous`.
    pub fn gained_by(&self, previous: &OwnershipFile, server: &str) -> Vec<RepoId> {
        self.repos
            .iter()
            .filter(|(repo, owner)| {
                owner.as_str() == server && previous.repos.get(*repo) != Some(*owner)
            })
            .map(|(repo, _)| *repo)
            .collect()
    }
}

/// [`ClusterRouter`] fed by an ownership file. Without a file this node owns
/// every repository.
#[derive(Debug)]
pub struct OwnershipTable {
    local_server: String,
    path: Option<PathBuf>,
    current: RwLock<OwnershipFile>,
}

impl OwnershipTable {
    pub fn load(local_server: impl Into<String>, path: Option<PathBuf>) -> Result<Self> {
        let start = Instant::now();
        let current = match &path {
            Some(path) => OwnershipFile::load(path)?,
            None => OwnershipFile::default(),
        };
        info!(
            stage = "ownership",
            event = "ownership.load.end",
            result = "ok",
            path = ?path.as_ref().map(|path| path.display().to_string()),
            repo_count = current.repos.len(),
            duration_ms = start.elapsed().as_millis(),
            "loaded ownership table"
        );

        Ok(Self {
            local_server: local_server.into(),
            path,
            current: RwLock::new(current),
        })
    }

    /// Re-reads the ownership file and returns the repositories this node
    /// became active for.
    pub fn refresh(&self) -> Result<Vec<RepoId>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let next = OwnershipFile::load(path)?;

        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current == next {
            return Ok(Vec::new());
        }
        let gained = next.gained_by(&current, &self.local_server);
        info!(
            stage = "ownership",
            event = "ownership.changed",
            repo_count = next.repos.len(),
            gained = gained.len(),
            "ownership table changed"
        );
        *current = next;
        Ok(gained)
    }

    pub async fn watch(&self, interval: Duration, scheduler: Scheduler) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.refresh() {
                Ok(gained) if gained.is_empty() => {}
                Ok(repos) => {
                    scheduler
                        .submit(IndexEvent::OwnershipChanged { repos })
                        .await
                }
                Err(err) => error!(
                    stage = "ownership",
                    event = "ownership.refresh.end",
                    result = "fail",
                    error = %format!("{err:#}"),
                    "failed to refresh ownership table"
                ),
            }
        }
    }
}

impl ClusterRouter for OwnershipTable {
    fn local_server(&self) -> &str {
        &self.local_server
    }

    fn active_server(&self, repo: RepoId) -> Option<String> {
        if self.path.is_none() {
            return Some(self.local_server.clone());
        }
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .repos
            .get(&repo)
            .cloned()
    }
}
