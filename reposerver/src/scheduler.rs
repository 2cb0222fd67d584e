use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use commitinfo_indexer::git::GitRepository;
use commitinfo_indexer::{CollectOutcome, CommitInfoEngine, RepoId};
use commitinfo_types::{CommitId, RefTip};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Priority of collection work. Lower runs first within a batch.
pub const COLLECT_PRIORITY: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    RefUpdated {
        repo: RepoId,
        ref_name: String,
        old: CommitId,
        new: CommitId,
    },
    SystemStarted,
    /// This node became active for `repos`.
    OwnershipChanged { repos: Vec<RepoId> },
    EntityRemoved { repo: RepoId },
}

/// What the scheduler needs from the indexing engine. All calls block.
pub trait CollectWork: Send + Sync + 'static {
    fn repository_ids(&self) -> Vec<RepoId>;
    fn is_active_here(&self, repo: RepoId) -> bool;
    fn check_version(&self, repo: RepoId) -> Result<bool>;
    /// Branch and tag tips peeled to commits.
    fn ref_tips(&self, repo: RepoId) -> Result<Vec<RefTip>>;
    /// None when the commit is not in the repository.
    fn commit_time(&self, repo: RepoId, commit: &CommitId) -> Result<Option<i64>>;
    fn collect(&self, repo: RepoId, commit: CommitId, ref_name: &str) -> Result<CollectOutcome>;
    fn remove(&self, repo: RepoId) -> Result<()>;
}

impl CollectWork for CommitInfoEngine {
    fn repository_ids(&self) -> Vec<RepoId> {
        CommitInfoEngine::repository_ids(self)
    }

    fn is_active_here(&self, repo: RepoId) -> bool {
        self.router().is_active_here(repo)
    }

    fn check_version(&self, repo: RepoId) -> Result<bool> {
        Ok(CommitInfoEngine::check_version(self, repo)?)
    }

    fn ref_tips(&self, repo: RepoId) -> Result<Vec<RefTip>> {
        Ok(self.git(repo)?.commit_refs()?)
    }

    fn commit_time(&self, repo: RepoId, commit: &CommitId) -> Result<Option<i64>> {
        let git = self.git(repo)?;
        if !git.has_object(commit)? {
            return Ok(None);
        }
        Ok(Some(git.commit_time(commit)?))
    }

    fn collect(&self, repo: RepoId, commit: CommitId, ref_name: &str) -> Result<CollectOutcome> {
        Ok(CommitInfoEngine::collect(self, repo, commit, ref_name)?)
    }

    fn remove(&self, repo: RepoId) -> Result<()> {
        Ok(self.remove_repository(repo)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkState {
    #[default]
    Idle,
    Queued,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CollectingWork {
    priority: u32,
    commit_time: i64,
    commit: CommitId,
    ref_name: String,
}

#[derive(Debug, Default)]
struct RepoQueue {
    state: WorkState,
    pending: Vec<CollectingWork>,
    /// Removed while a batch was running; the drain removes it afterwards.
    removing: bool,
}

#[derive(Debug, Default)]
struct BatchStats {
    works: usize,
    commits_collected: usize,
}

struct Shared {
    backend: Arc<dyn CollectWork>,
    semaphore: Arc<Semaphore>,
    /// Repositories with no entry are idle.
    queues: Mutex<HashMap<RepoId, RepoQueue>>,
    idle: Notify,
    runtime: Handle,
}

/// Serializes collection per repository and runs repositories in parallel,
/// at most `max_repo_concurrency` at a time.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn CollectWork>, max_repo_concurrency: usize) -> Result<Self> {
        let runtime = Handle::try_current().context("scheduler requires a tokio runtime")?;
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                semaphore: Arc::new(Semaphore::new(max_repo_concurrency.max(1))),
                queues: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                runtime,
            }),
        })
    }

    /// Turns an event into queued work. Blocks on git and store access, so
    /// async callers should go through [`Scheduler::submit`].
    pub fn dispatch(&self, event: IndexEvent) {
        debug!(stage = "scheduler", event = "dispatch", payload = ?event, "dispatching index event");
        match event {
            IndexEvent::RefUpdated {
                repo,
                ref_name,
                new,
                ..
            } => self.on_ref_updated(repo, ref_name, new),
            IndexEvent::SystemStarted => {
                for repo in self.shared.backend.repository_ids() {
                    if self.shared.backend.is_active_here(repo) {
                        self.reconcile(repo);
                    }
                }
            }
            IndexEvent::OwnershipChanged { repos } => {
                for repo in repos {
                    if self.shared.backend.is_active_here(repo) {
                        self.reconcile(repo);
                    } else {
                        debug!(repo, "ownership change for repository not active here");
                    }
                }
            }
            IndexEvent::EntityRemoved { repo } => self.on_removed(repo),
        }
    }

    pub async fn submit(&self, event: IndexEvent) {
        let this = self.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || this.dispatch(event)).await {
            error!(
                stage = "scheduler",
                event = "dispatch.join",
                result = "fail",
                error = %err,
                "event dispatch panicked or was cancelled"
            );
        }
    }

    pub fn state(&self, repo: RepoId) -> WorkState {
        self.queues()
            .get(&repo)
            .map(|queue| queue.state)
            .unwrap_or_default()
    }

    /// Resolves once every repository is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.queues().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<RepoId, RepoQueue>> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_ref_updated(&self, repo: RepoId, ref_name: String, new: CommitId) {
        let tracked = ref_name.starts_with("refs/heads/") || ref_name.starts_with("refs/tags/");
        if new.is_zero() || !tracked {
            debug!(repo, ref_name = %ref_name, "ignoring ref update");
            return;
        }
        if !self.shared.backend.is_active_here(repo) {
            debug!(repo, ref_name = %ref_name, "repository not active here");
            return;
        }

        match self.shared.backend.commit_time(repo, &new) {
            Ok(Some(commit_time)) => self.enqueue(
                repo,
                CollectingWork {
                    priority: COLLECT_PRIORITY,
                    commit_time,
                    commit: new,
                    ref_name,
                },
            ),
            Ok(None) => warn!(
                stage = "scheduler",
                repo,
                ref_name = %ref_name,
                commit = %new,
                "updated ref points at a missing commit"
            ),
            Err(err) => error!(
                stage = "scheduler",
                repo,
                ref_name = %ref_name,
                commit = %new,
                error = %format!("{err:#}"),
                "failed to read commit time"
            ),
        }
    }

    /// Re-scans every branch and tag tip of `repo`.
    fn reconcile(&self, repo: RepoId) {
        let start = Instant::now();
        let backend = &self.shared.backend;
        if let Err(err) = backend.check_version(repo) {
            error!(
                stage = "scheduler",
                event = "reconcile.end",
                result = "fail",
                repo,
                error = %format!("{err:#}"),
                "version check failed"
            );
            return;
        }

        let mut tips = match backend.ref_tips(repo) {
            Ok(tips) => tips,
            Err(err) => {
                error!(
                    stage = "scheduler",
                    event = "reconcile.end",
                    result = "fail",
                    repo,
                    error = %format!("{err:#}"),
                    "failed to list ref tips"
                );
                return;
            }
        };
        tips.sort_by_key(|tip| tip.commit_time);

        let tip_count = tips.len();
        for tip in tips {
            self.enqueue(
                repo,
                CollectingWork {
                    priority: COLLECT_PRIORITY,
                    commit_time: tip.commit_time,
                    commit: tip.commit,
                    ref_name: tip.name,
                },
            );
        }
        info!(
            stage = "scheduler",
            event = "reconcile.end",
            result = "ok",
            repo,
            tip_count,
            duration_ms = start.elapsed().as_millis(),
            "queued ref tips"
        );
    }

    fn on_removed(&self, repo: RepoId) {
        {
            let mut queues = self.queues();
            match queues.get_mut(&repo) {
                Some(queue) if queue.state == WorkState::Running => {
                    queue.pending.clear();
                    queue.removing = true;
                    info!(
                        stage = "scheduler",
                        event = "repo.remove.deferred",
                        repo,
                        "repository removal waits for the running batch"
                    );
                    return;
                }
                _ => {}
            }
            queues.remove(&repo);
        }
        self.shared.idle.notify_waiters();
        self.remove_repository(repo);
    }

    fn remove_repository(&self, repo: RepoId) {
        match self.shared.backend.remove(repo) {
            Ok(()) => info!(stage = "scheduler", event = "repo.remove.end", result = "ok", repo, "removed repository"),
            Err(err) => error!(
                stage = "scheduler",
                event = "repo.remove.end",
                result = "fail",
                repo,
                error = %format!("{err:#}"),
                "failed to remove repository"
            ),
        }
    }

    fn enqueue(&self, repo: RepoId, work: CollectingWork) {
        let spawn = {
            let mut queues = self.queues();
            let queue = queues.entry(repo).or_default();
            if queue.removing {
                debug!(repo, ref_name = %work.ref_name, "repository is being removed");
                false
            } else if queue
                .pending
                .iter()
                .any(|queued| queued.commit == work.commit && queued.ref_name == work.ref_name)
            {
                debug!(repo, ref_name = %work.ref_name, commit = %work.commit, "work already queued");
                false
            } else {
                queue.pending.push(work);
                if queue.state == WorkState::Idle {
                    queue.state = WorkState::Queued;
                    true
                } else {
                    false
                }
            }
        };

        if spawn {
            let this = self.clone();
            self.shared.runtime.spawn(async move { this.drain(repo).await });
        }
    }

    async fn drain(self, repo: RepoId) {
        loop {
            let wait_start = Instant::now();
            let Ok(permit) = Arc::clone(&self.shared.semaphore).acquire_owned().await else {
                return;
            };

            let mut works = {
                let mut queues = self.queues();
                let Some(queue) = queues.get_mut(&repo) else {
                    drop(queues);
                    self.shared.idle.notify_waiters();
                    return;
                };
                if queue.state == WorkState::Running {
                    // Another drain owns this repository and picks up the pending work.
                    return;
                }
                if queue.pending.is_empty() {
                    queues.remove(&repo);
                    drop(queues);
                    self.shared.idle.notify_waiters();
                    return;
                }
                queue.state = WorkState::Running;
                std::mem::take(&mut queue.pending)
            };
            works.sort_by_key(|work| (work.priority, work.commit_time));

            let start = Instant::now();
            info!(
                stage = "scheduler",
                event = "batch.begin",
                repo,
                works = works.len(),
                semaphore_wait_ms = wait_start.elapsed().as_millis(),
                "starting collection batch"
            );

            let backend = Arc::clone(&self.shared.backend);
            let result =
                tokio::task::spawn_blocking(move || run_batch(backend.as_ref(), repo, works)).await;
            drop(permit);

            match result {
                Ok(Ok(stats)) => info!(
                    stage = "scheduler",
                    event = "batch.end",
                    result = "ok",
                    repo,
                    works = stats.works,
                    commits_collected = stats.commits_collected,
                    duration_ms = start.elapsed().as_millis(),
                    "collection batch completed"
                ),
                Ok(Err(err)) => error!(
                    stage = "scheduler",
                    event = "batch.end",
                    result = "fail",
                    repo,
                    duration_ms = start.elapsed().as_millis(),
                    error = %format!("{err:#}"),
                    "collection batch failed; remaining work dropped"
                ),
                Err(err) => error!(
                    stage = "scheduler",
                    event = "batch.end",
                    result = "fail",
                    repo,
                    duration_ms = start.elapsed().as_millis(),
                    error = %err,
                    "collection batch panicked or was cancelled"
                ),
            }

            let removing = self
                .queues()
                .get(&repo)
                .is_some_and(|queue| queue.removing);
            if removing {
                let this = self.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || this.remove_repository(repo)).await
                {
                    error!(
                        stage = "scheduler",
                        event = "repo.remove.end",
                        result = "fail",
                        repo,
                        error = %err,
                        "repository removal panicked or was cancelled"
                    );
                }
                self.queues().remove(&repo);
                self.shared.idle.notify_waiters();
                return;
            }

            {
                let mut queues = self.queues();
                let more = queues
                    .get(&repo)
                    .is_some_and(|queue| !queue.pending.is_empty());
                if !more {
                    queues.remove(&repo);
                    drop(queues);
                    self.shared.idle.notify_waiters();
                    return;
                }
                if let Some(queue) = queues.get_mut(&repo) {
                    queue.state = WorkState::Queued;
                }
            }
        }
    }
}

fn run_batch(backend: &dyn CollectWork, repo: RepoId, works: Vec<CollectingWork>) -> Result<BatchStats> {
    let mut stats = BatchStats::default();
    for work in works {
        let outcome = backend
            .collect(repo, work.commit, &work.ref_name)
            .with_context(|| format!("failed to collect {} at {}", work.ref_name, work.commit))?;
        stats.works += 1;
        stats.commits_collected += outcome.commits_collected;
    }
    Ok(stats)
}
