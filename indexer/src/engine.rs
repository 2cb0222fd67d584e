use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use commitinfo_types::{
    CommitId, Contribution, ContributionKind, Contributor, Day, NameAndEmail,
};
use tracing::{debug, info};

use crate::aggregates::{self, LineStats};
use crate::cache::QueryCache;
use crate::cluster::{ClusterRouter, QueryForwarder, StandaloneRouter};
use crate::collector::{self, CollectContext, CollectOutcome};
use crate::config::{IndexerConfig, RepoId, RepoSettings};
use crate::error::{IndexError, Result, poisoned};
use crate::fixes::{self, FixIssueParser};
use crate::git::{GitRepository, LocalRepository};
use crate::graph;
use crate::history;
use crate::query::{self, EmailAddress, IdentityDirectory, NoIdentities, Query, QueryResult};
use crate::store::{EnvironmentManager, keys};
use crate::utils::compare_path_segments;

struct RepoHandle {
    settings: RepoSettings,
    git: Arc<dyn GitRepository>,
    fix_parser: FixIssueParser,
    /// Held for the whole of a collection so runs for one repository never overlap.
    collecting: Mutex<()>,
}

/// Owns every repository's environment, the query cache and the repository
/// handles. Writes happen only through [`CommitInfoEngine::collect`] on the
/// node active for the repository; reads are routed there.
pub struct CommitInfoEngine {
    config: IndexerConfig,
    envs: EnvironmentManager,
    cache: QueryCache,
    repos: RwLock<HashMap<RepoId, Arc<RepoHandle>>>,
    router: Arc<dyn ClusterRouter>,
    forwarder: Option<Arc<dyn QueryForwarder>>,
    identities: Arc<dyn IdentityDirectory>,
}

impl CommitInfoEngine {
    pub fn new(config: IndexerConfig, router: Arc<dyn ClusterRouter>) -> Self {
        Self {
            envs: EnvironmentManager::new(config.data_dir.clone()),
            config,
            cache: QueryCache::new(),
            repos: RwLock::new(HashMap::new()),
            router,
            forwarder: None,
            identities: Arc::new(NoIdentities),
        }
    }

    /// An engine that serves every repository itself.
    pub fn standalone(config: IndexerConfig) -> Self {
        let router = Arc::new(StandaloneRouter::new(config.local_server.clone()));
        Self::new(config, router)
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn QueryForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_identities(mut self, identities: Arc<dyn IdentityDirectory>) -> Self {
        self.identities = identities;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn router(&self) -> &dyn ClusterRouter {
        self.router.as_ref()
    }

    /// Registers a repository backed by the git directory in its settings.
    pub fn register(&self, settings: RepoSettings) -> Result<()> {
        let git = LocalRepository::open(&settings.git_dir)?;
        self.register_with(settings, Arc::new(git))
    }

    pub fn register_with(&self, settings: RepoSettings, git: Arc<dyn GitRepository>) -> Result<()> {
        let fix_parser = FixIssueParser::new(&settings.fix_keywords)?;
        let repo = settings.id;
        debug!(repo, name = %settings.name, git_dir = %settings.git_dir.display(), "registered repository");
        let handle = RepoHandle {
            settings,
            git,
            fix_parser,
            collecting: Mutex::new(()),
        };
        self.repos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(repo, Arc::new(handle));
        Ok(())
    }

    pub fn repository_ids(&self) -> Vec<RepoId> {
        let mut ids: Vec<RepoId> = self
            .repos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn settings(&self, repo: RepoId) -> Result<RepoSettings> {
        Ok(self.handle(repo)?.settings.clone())
    }

    pub fn git(&self, repo: RepoId) -> Result<Arc<dyn GitRepository>> {
        Ok(Arc::clone(&self.handle(repo)?.git))
    }

    fn handle(&self, repo: RepoId) -> Result<Arc<RepoHandle>> {
        self.repos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&repo)
            .cloned()
            .ok_or(IndexError::UnknownRepository(repo))
    }

    fn ensure_active(&self, repo: RepoId) -> Result<()> {
        if self.router.is_active_here(repo) {
            return Ok(());
        }
        Err(IndexError::NotActive {
            repo,
            active: self
                .router
                .active_server(repo)
                .unwrap_or_else(|| "<none>".to_string()),
        })
    }

    /// Discards the repository's environment when it was written in another
    /// format. Returns true when it was reset.
    pub fn check_version(&self, repo: RepoId) -> Result<bool> {
        let handle = self.handle(repo).ok();
        let _guard = exclusive(handle.as_deref())?;
        let reset = self.envs.check_version(repo)?;
        if reset {
            self.cache.remove(repo);
        }
        Ok(reset)
    }

    pub fn collect(&self, repo: RepoId, tip: CommitId, ref_name: &str) -> Result<CollectOutcome> {
        self.ensure_active(repo)?;
        let handle = self.handle(repo)?;
        let _guard = exclusive(Some(&*handle))?;
        // Removed while this call waited for the previous collection.
        self.handle(repo)?;
        let env = self.envs.env(repo)?;
        let ctx = CollectContext {
            env: &env,
            git: handle.git.as_ref(),
            repo: &handle.settings,
            config: &self.config,
            fix_parser: &handle.fix_parser,
            cache: &self.cache,
        };
        collector::collect(&ctx, tip, ref_name)
    }

    /// Forgets a repository and deletes its environment once any running
    /// collection for it has finished.
    pub fn remove_repository(&self, repo: RepoId) -> Result<()> {
        let handle = self
            .repos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&repo);
        let _guard = exclusive(handle.as_deref())?;
        self.cache.remove(repo);
        self.envs.remove(repo)
    }

    /// Copies the collected state of `source` to `target`, e.g. for a fork.
    pub fn clone_info(&self, source: RepoId, target: RepoId) -> Result<()> {
        let start = Instant::now();
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("commit-info.zst");
        self.envs.export(source, &archive)?;
        self.envs.import(target, &archive)?;
        self.cache.remove(target);
        info!(
            stage = "engine",
            event = "clone.end",
            result = "ok",
            source,
            target,
            duration_ms = start.elapsed().as_millis(),
            "cloned commit info"
        );
        Ok(())
    }

    pub fn export(&self, repo: RepoId, target: &Path) -> Result<()> {
        self.envs.export(repo, target)
    }

    pub fn import(&self, repo: RepoId, source: &Path) -> Result<()> {
        self.envs.import(repo, source)?;
        self.cache.remove(repo);
        Ok(())
    }

    /// Runs `query` on the node active for `repo`.
    pub fn query(&self, repo: RepoId, query: Query) -> Result<QueryResult> {
        if self.router.is_active_here(repo) {
            return self.execute(repo, query);
        }
        let active = self.router.active_server(repo);
        match (active, &self.forwarder) {
            (Some(server), Some(forwarder)) => {
                debug!(repo, server = %server, "forwarding query to active server");
                forwarder.forward(&server, repo, query)
            }
            (active, _) => Err(IndexError::NotActive {
                repo,
                active: active.unwrap_or_else(|| "<none>".to_string()),
            }),
        }
    }

    fn execute(&self, repo: RepoId, query: Query) -> Result<QueryResult> {
        let env = self.envs.env(repo)?;
        match query {
            Query::CommitCount => {
                let count = self.cache.commit_count(repo, || {
                    env.compute_in_readonly_transaction(|txn| {
                        collector::read_int_key(txn, keys::COMMIT_COUNT)
                    })
                })?;
                Ok(QueryResult::Count(count))
            }
            Query::FileCount => {
                let count = self.cache.file_count(repo, || {
                    env.compute_in_readonly_transaction(aggregates::read_file_count)
                })?;
                Ok(QueryResult::Count(count))
            }
            Query::Files => {
                let files = self.cache.files(repo, || {
                    let mut files: Vec<String> = env
                        .compute_in_readonly_transaction(aggregates::read_files)?
                        .into_iter()
                        .collect();
                    files.sort_by(|a, b| compare_path_segments(a, b));
                    Ok(files)
                })?;
                Ok(QueryResult::Files(files.to_vec()))
            }
            Query::Users => {
                let users = self.cache.users(repo, || {
                    Ok(env
                        .compute_in_readonly_transaction(collector::read_users)?
                        .into_iter()
                        .collect())
                })?;
                Ok(QueryResult::Users(users.to_vec()))
            }
            Query::LineIncrements => Ok(QueryResult::LineIncrements(
                env.compute_in_readonly_transaction(aggregates::read_line_stats)?,
            )),
            Query::OverallContributions => Ok(QueryResult::OverallContributions(
                env.compute_in_readonly_transaction(query::overall_contributions)?,
            )),
            Query::TopContributors {
                top,
                kind,
                from,
                to,
            } => Ok(QueryResult::TopContributors(
                env.compute_in_readonly_transaction(|txn| {
                    query::top_contributors(txn, self.identities.as_ref(), top, kind, from, to)
                })?,
            )),
            Query::HistoryPaths { path } => Ok(QueryResult::Paths(
                env.compute_in_readonly_transaction(|txn| {
                    history::history_paths(txn, &path, self.config.max_history_paths)
                })?,
            )),
            Query::Descendants { ancestors } => {
                let descendants =
                    env.compute_in_readonly_transaction(|txn| graph::descendants(txn, &ancestors))?;
                let mut descendants: Vec<CommitId> = descendants.into_iter().collect();
                descendants.sort_unstable();
                Ok(QueryResult::Commits(descendants))
            }
            Query::FixCommits { issue } => {
                let tips: HashSet<CommitId> = self
                    .git(repo)?
                    .commit_refs()?
                    .into_iter()
                    .map(|tip| tip.commit)
                    .collect();
                Ok(QueryResult::Commits(env.compute_in_readonly_transaction(
                    |txn| fixes::fix_commits(txn, issue, &tips),
                )?))
            }
            Query::SortUsersByContribution { user_emails, files } => {
                Ok(QueryResult::UserIds(env.compute_in_readonly_transaction(
                    |txn| {
                        query::sort_users_by_contribution(
                            txn,
                            &user_emails,
                            &files,
                            self.config.max_commit_files,
                        )
                    },
                )?))
            }
        }
    }

    pub fn commit_count(&self, repo: RepoId) -> Result<i32> {
        match self.query(repo, Query::CommitCount)? {
            QueryResult::Count(count) => Ok(count),
            other => Err(unexpected("commit_count", &other)),
        }
    }

    pub fn file_count(&self, repo: RepoId) -> Result<i32> {
        match self.query(repo, Query::FileCount)? {
            QueryResult::Count(count) => Ok(count),
            other => Err(unexpected("file_count", &other)),
        }
    }

    /// Files of the default branch tip, ordered segment by segment.
    pub fn files(&self, repo: RepoId) -> Result<Vec<String>> {
        match self.query(repo, Query::Files)? {
            QueryResult::Files(files) => Ok(files),
            other => Err(unexpected("files", &other)),
        }
    }

    /// Every author and committer identity seen in collected commits.
    pub fn users(&self, repo: RepoId) -> Result<Vec<NameAndEmail>> {
        match self.query(repo, Query::Users)? {
            QueryResult::Users(users) => Ok(users),
            other => Err(unexpected("users", &other)),
        }
    }

    pub fn line_increments(&self, repo: RepoId) -> Result<LineStats> {
        match self.query(repo, Query::LineIncrements)? {
            QueryResult::LineIncrements(stats) => Ok(stats),
            other => Err(unexpected("line_increments", &other)),
        }
    }

    pub fn overall_contributions(&self, repo: RepoId) -> Result<BTreeMap<Day, Contribution>> {
        match self.query(repo, Query::OverallContributions)? {
            QueryResult::OverallContributions(contributions) => Ok(contributions),
            other => Err(unexpected("overall_contributions", &other)),
        }
    }

    pub fn top_contributors(
        &self,
        repo: RepoId,
        top: usize,
        kind: ContributionKind,
        from: Day,
        to: Day,
    ) -> Result<Vec<Contributor>> {
        match self.query(
            repo,
            Query::TopContributors {
                top,
                kind,
                from,
                to,
            },
        )? {
            QueryResult::TopContributors(contributors) => Ok(contributors),
            other => Err(unexpected("top_contributors", &other)),
        }
    }

    pub fn history_paths(&self, repo: RepoId, path: &str) -> Result<BTreeSet<String>> {
        match self.query(
            repo,
            Query::HistoryPaths {
                path: path.to_string(),
            },
        )? {
            QueryResult::Paths(paths) => Ok(paths),
            other => Err(unexpected("history_paths", &other)),
        }
    }

    pub fn descendants(&self, repo: RepoId, ancestors: &[CommitId]) -> Result<Vec<CommitId>> {
        match self.query(
            repo,
            Query::Descendants {
                ancestors: ancestors.to_vec(),
            },
        )? {
            QueryResult::Commits(commits) => Ok(commits),
            other => Err(unexpected("descendants", &other)),
        }
    }

    /// Commits fixing `issue` that are reachable from a current branch or tag.
    pub fn fix_commits(&self, repo: RepoId, issue: u64) -> Result<Vec<CommitId>> {
        match self.query(repo, Query::FixCommits { issue })? {
            QueryResult::Commits(commits) => Ok(commits),
            other => Err(unexpected("fix_commits", &other)),
        }
    }

    pub fn sort_users_by_contribution(
        &self,
        repo: RepoId,
        user_emails: BTreeMap<u64, Vec<EmailAddress>>,
        files: Vec<String>,
    ) -> Result<Vec<u64>> {
        match self.query(repo, Query::SortUsersByContribution { user_emails, files })? {
            QueryResult::UserIds(users) => Ok(users),
            other => Err(unexpected("sort_users_by_contribution", &other)),
        }
    }
}

/// Blocks until no collection runs for the repository. Map and cache locks
/// recover from poisoning since every update to them is a single insert or
/// remove; the collect lock reports it instead.
fn exclusive(handle: Option<&RepoHandle>) -> Result<Option<MutexGuard<'_, ()>>> {
    handle
        .map(|handle| {
            handle
                .collecting
                .lock()
                .map_err(poisoned("repository collect mutex"))
        })
        .transpose()
}

fn unexpected(query: &str, result: &QueryResult) -> IndexError {
    IndexError::Internal(anyhow::anyhow!(
        "unexpected result for {query} query: {result:?}"
    ))
}
