use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use commitinfo_types::{CommitId, ContributionKind, Day};
use tracing::info;

use crate::config::{IndexerConfig, RepoId, RepoSettings};
use crate::engine::CommitInfoEngine;
use crate::git::GitRepository;
use crate::output;
use crate::query::Query;
use crate::utils;

#[derive(Debug, Parser)]
#[command(
    name = "commitinfo-indexer",
    version,
    about = "Incremental commit history indexer"
)]
pub struct Cli {
    /// Directory holding one commit info environment per repository.
    #[arg(long, env = "COMMITINFO_DATA_DIR", default_value = ".commitinfo")]
    pub data_dir: PathBuf,
    /// Numeric identifier of the repository inside the data directory.
    #[arg(long, env = "COMMITINFO_REPO_ID", default_value_t = 1)]
    pub repo_id: RepoId,
    /// Increase logging verbosity (use -vv for trace level).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Collect commits reachable from a ref or commit.
    Collect(CollectArgs),
    /// Print a query result as JSON.
    Query(QueryArgs),
    /// Write a compressed snapshot of the repository's environment.
    Export { target: PathBuf },
    /// Replace the repository's environment with a snapshot.
    Import { source: PathBuf },
    /// Reset the environment if it was written in another format.
    CheckVersion,
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Path to the git repository.
    #[arg(long = "git-dir", default_value = ".")]
    pub git_dir: PathBuf,
    /// Branch whose mainline feeds line statistics and contributions.
    #[arg(long, default_value = "main")]
    pub default_branch: String,
    /// Ref to collect. Defaults to the default branch.
    #[arg(long = "ref")]
    pub ref_name: Option<String>,
    /// Commit to collect instead of the ref's current tip.
    #[arg(long)]
    pub commit: Option<String>,
    /// Maximum number of commits applied per transaction.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Glob limiting paths counted in line statistics and contributions.
    #[arg(long = "analyze")]
    pub code_analysis_patterns: Vec<String>,
    /// Keyword marking an issue as fixed. Replaces the default set when given.
    #[arg(long = "fix-keyword")]
    pub fix_keywords: Vec<String>,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Path to the git repository, needed for fix commit queries.
    #[arg(long = "git-dir", default_value = ".")]
    pub git_dir: PathBuf,
    #[command(subcommand)]
    pub query: QueryCommand,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    CommitCount,
    FileCount,
    Files,
    Users,
    LineIncrements,
    OverallContributions,
    TopContributors {
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// commits, additions or deletions
        #[arg(long, default_value = "commits")]
        kind: ContributionKind,
        /// First day of the range (YYYY-MM-DD).
        #[arg(long)]
        from: NaiveDate,
        /// Last day of the range (YYYY-MM-DD).
        #[arg(long)]
        to: NaiveDate,
    },
    HistoryPaths {
        path: String,
    },
    Descendants {
        #[arg(required = true)]
        ancestors: Vec<CommitId>,
    },
    FixCommits {
        issue: u64,
    },
}

impl QueryCommand {
    fn into_query(self) -> Query {
        match self {
            QueryCommand::CommitCount => Query::CommitCount,
            QueryCommand::FileCount => Query::FileCount,
            QueryCommand::Files => Query::Files,
            QueryCommand::Users => Query::Users,
            QueryCommand::LineIncrements => Query::LineIncrements,
            QueryCommand::OverallContributions => Query::OverallContributions,
            QueryCommand::TopContributors {
                top,
                kind,
                from,
                to,
            } => Query::TopContributors {
                top,
                kind,
                from: Day::from_date(from),
                to: Day::from_date(to),
            },
            QueryCommand::HistoryPaths { path } => Query::HistoryPaths { path },
            QueryCommand::Descendants { ancestors } => Query::Descendants { ancestors },
            QueryCommand::FixCommits { issue } => Query::FixCommits { issue },
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    utils::init_tracing(cli.verbose)?;

    let data_dir = resolve_path(&cli.data_dir)?;
    let repo = cli.repo_id;

    match cli.command {
        Command::Collect(args) => collect(data_dir, repo, args),
        Command::Query(args) => {
            let engine = CommitInfoEngine::standalone(IndexerConfig::new(data_dir));
            let query = args.query.into_query();
            if matches!(query, Query::FixCommits { .. }) {
                let git_dir = resolve_path(&args.git_dir)?;
                engine
                    .register(RepoSettings::new(repo, repo_name(&git_dir), git_dir.clone()))
                    .with_context(|| {
                        format!("failed to open git repository {}", git_dir.display())
                    })?;
            }
            let result = engine.query(repo, query).context("query failed")?;
            output::print_json(&result)
        }
        Command::Export { target } => {
            let engine = CommitInfoEngine::standalone(IndexerConfig::new(data_dir));
            engine
                .export(repo, &target)
                .with_context(|| format!("failed to export to {}", target.display()))?;
            info!(repo, target = %target.display(), "export complete");
            Ok(())
        }
        Command::Import { source } => {
            let engine = CommitInfoEngine::standalone(IndexerConfig::new(data_dir));
            engine
                .import(repo, &source)
                .with_context(|| format!("failed to import {}", source.display()))?;
            info!(repo, source = %source.display(), "import complete");
            Ok(())
        }
        Command::CheckVersion => {
            let engine = CommitInfoEngine::standalone(IndexerConfig::new(data_dir));
            let reset = engine.check_version(repo)?;
            info!(repo, reset, "version check complete");
            Ok(())
        }
    }
}

fn collect(data_dir: PathBuf, repo: RepoId, args: CollectArgs) -> Result<()> {
    let git_dir = resolve_path(&args.git_dir)?;
    let mut config = IndexerConfig::new(data_dir);
    if let Some(batch_size) = args.batch_size {
        config = config.with_collect_batch_size(batch_size);
    }

    let settings = RepoSettings::new(repo, repo_name(&git_dir), git_dir.clone())
        .with_default_branch(args.default_branch)
        .with_fix_keywords(args.fix_keywords)
        .with_code_analysis_patterns(&args.code_analysis_patterns)?;
    let ref_name = args
        .ref_name
        .unwrap_or_else(|| settings.default_branch_ref());

    let engine = CommitInfoEngine::standalone(config);
    engine
        .register(settings)
        .with_context(|| format!("failed to open git repository {}", git_dir.display()))?;
    engine.check_version(repo)?;

    let tip = match args.commit {
        Some(commit) => commit
            .parse::<CommitId>()
            .with_context(|| format!("invalid commit id {commit}"))?,
        None => resolve_ref(engine.git(repo)?.as_ref(), &ref_name)?,
    };

    let outcome = engine
        .collect(repo, tip, &ref_name)
        .with_context(|| format!("failed to collect {ref_name} at {tip}"))?;
    info!(
        repo,
        ref_name = %ref_name,
        commit = %tip,
        commits = outcome.commits_collected,
        checkpoints = outcome.checkpoints.len(),
        "collection complete"
    );
    output::print_json(&outcome)
}

fn resolve_ref(git: &dyn GitRepository, ref_name: &str) -> Result<CommitId> {
    git.commit_refs()?
        .into_iter()
        .find(|tip| tip.name == ref_name)
        .map(|tip| tip.commit)
        .with_context(|| format!("ref {ref_name} not found"))
}

fn repo_name(git_dir: &Path) -> String {
    git_dir
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.trim_end_matches(".git").to_string())
        .unwrap_or_else(|| "repository".to_string())
}

fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
