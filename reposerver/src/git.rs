use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use commitinfo_indexer::RepoId;
use commitinfo_types::CommitId;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::RepoConfig;
use crate::scheduler::{IndexEvent, Scheduler};

/// Branch and tag names mapped to the commit they peel to.
pub type RefSnapshot = BTreeMap<String, CommitId>;

const REF_FORMAT: &str = "--format=%(refname) %(objectname) %(*objectname)";

#[derive(Debug, Clone)]
pub struct Git {
    bin: String,
}

impl Git {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub async fn validate_binary_exists(&self) -> Result<()> {
        info!(
            stage = "git",
            event = "git.binary_check.begin",
            git_bin = %self.bin,
            "checking git binary availability"
        );

        let status = Command::new(&self.bin)
            .arg("--version")
            .status()
            .await
            .with_context(|| format!("failed to check binary '{}'", self.bin))?;

        if !status.success() {
            error!(
                stage = "git",
                event = "git.binary_check.end",
                result = "fail",
                git_bin = %self.bin,
                status_code = ?status.code(),
                "git binary check failed"
            );
            bail!("binary '{}' is not available in PATH", self.bin);
        }

        info!(
            stage = "git",
            event = "git.binary_check.end",
            result = "ok",
            git_bin = %self.bin,
            "git binary check succeeded"
        );

        Ok(())
    }

    pub async fn list_refs(&self, git_dir: &Path, repo: &str) -> Result<RefSnapshot> {
        let git_dir = git_dir.display().to_string();
        let output = self
            .run_capture(
                [
                    "--git-dir",
                    git_dir.as_str(),
                    "for-each-ref",
                    REF_FORMAT,
                    "refs/heads",
                    "refs/tags",
                ],
                "list_refs",
                repo,
            )
            .await?;
        parse_refs(&output)
    }

    async fn run_capture<I, S>(&self, args: I, operation: &str, repo: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args_vec = args
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>();
        let cmd_display = format!("{} {}", self.bin, args_vec.join(" "));

        let start = Instant::now();
        let output = Command::new(&self.bin)
            .args(&args_vec)
            .output()
            .await
            .with_context(|| format!("failed to execute '{cmd_display}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                stage = "git",
                event = "git.cmd.end",
                result = "fail",
                operation = %operation,
                repo = %repo,
                duration_ms = start.elapsed().as_millis(),
                status_code = ?output.status.code(),
                stderr = %stderr.trim(),
                command = %cmd_display,
                "git command failed"
            );
            return Err(anyhow!(
                "git command failed (status {:?}): {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        debug!(
            stage = "git",
            event = "git.cmd.end",
            result = "ok",
            operation = %operation,
            repo = %repo,
            duration_ms = start.elapsed().as_millis(),
            command = %cmd_display,
            "git command completed"
        );

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `for-each-ref` output. Annotated tags carry the peeled commit as a
/// third column.
pub fn parse_refs(output: &str) -> Result<RefSnapshot> {
    let mut refs = RefSnapshot::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let mut columns = line.split_whitespace();
        let (Some(name), Some(object)) = (columns.next(), columns.next()) else {
            bail!("malformed ref line '{line}'");
        };
        let target = columns.next().unwrap_or(object);
        let commit = target
            .parse::<CommitId>()
            .with_context(|| format!("invalid object id for {name}"))?;
        refs.insert(name.to_string(), commit);
    }
    Ok(refs)
}

/// Ref changes between two snapshots. Deleted refs are reported with a zero
/// new id.
pub fn diff_refs(repo: RepoId, previous: &RefSnapshot, current: &RefSnapshot) -> Vec<IndexEvent> {
    let mut events = Vec::new();
    for (name, new) in current {
        let old = previous.get(name).copied().unwrap_or(CommitId::ZERO);
        if old != *new {
            events.push(IndexEvent::RefUpdated {
                repo,
                ref_name: name.clone(),
                old,
                new: *new,
            });
        }
    }
    for (name, old) in previous {
        if !current.contains_key(name) {
            events.push(IndexEvent::RefUpdated {
                repo,
                ref_name: name.clone(),
                old: *old,
                new: CommitId::ZERO,
            });
        }
    }
    events
}

#[derive(Debug, Clone)]
struct WatchedRepo {
    id: RepoId,
    name: String,
    git_dir: PathBuf,
}

/// Polls each repository's refs and turns differences into
/// [`IndexEvent::RefUpdated`]. The first poll only records a baseline.
pub struct RefWatcher {
    git: Git,
    repos: Vec<WatchedRepo>,
    snapshots: HashMap<RepoId, RefSnapshot>,
}

impl RefWatcher {
    pub fn new(git: Git, repos: &[RepoConfig]) -> Self {
        Self {
            git,
            repos: repos
                .iter()
                .map(|repo| WatchedRepo {
                    id: repo.id,
                    name: repo.name.clone(),
                    git_dir: repo.git_dir.clone(),
                })
                .collect(),
            snapshots: HashMap::new(),
        }
    }

    pub async fn poll(&mut self) -> Vec<IndexEvent> {
        let mut events = Vec::new();
        for repo in &self.repos {
            let current = match self.git.list_refs(&repo.git_dir, &repo.name).await {
                Ok(current) => current,
                Err(err) => {
                    error!(
                        stage = "watch",
                        event = "refs.poll.end",
                        result = "fail",
                        repo = repo.id,
                        error = %format!("{err:#}"),
                        "failed to list refs"
                    );
                    continue;
                }
            };
            if let Some(previous) = self.snapshots.get(&repo.id) {
                events.extend(diff_refs(repo.id, previous, &current));
            }
            self.snapshots.insert(repo.id, current);
        }
        events
    }

    pub async fn run(mut self, interval: Duration, scheduler: Scheduler) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let events = self.poll().await;
            if !events.is_empty() {
                info!(
                    stage = "watch",
                    event = "refs.poll.end",
                    result = "ok",
                    updates = events.len(),
                    "ref updates detected"
                );
            }
            for event in events {
                scheduler.submit(event).await;
            }
        }
    }
}
