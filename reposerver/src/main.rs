mod config;
mod git;
mod logging;
mod ownership;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use commitinfo_indexer::CommitInfoEngine;
use config::AppConfig;
use git::{Git, RefWatcher};
use logging::init_logging;
use ownership::OwnershipTable;
use scheduler::{IndexEvent, Scheduler};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "commitinfo-server",
    version,
    about = "Keep commit info indexes current for a set of repositories"
)]
struct Cli {
    #[arg(long)]
    config: PathBuf,
    /// Reconcile every repository once, wait for collection to finish, then exit.
    #[arg(long, default_value_t = false)]
    once: bool,
    #[arg(long, default_value_t = false)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_start = Instant::now();
    let loaded = AppConfig::load(&cli.config).context("failed to load commitinfo-server config");
    init_logging(
        loaded
            .as_ref()
            .map(|cfg| cfg.global.log_format)
            .unwrap_or_default(),
    )?;
    info!(
        stage = "startup",
        event = "startup.begin",
        config_path = %cli.config.display(),
        "commitinfo-server process starting"
    );

    let cfg = match loaded {
        Ok(cfg) => {
            info!(
                stage = "startup",
                event = "config.load.end",
                result = "ok",
                config_path = %cli.config.display(),
                repo_count = cfg.repos.len(),
                duration_ms = load_start.elapsed().as_millis(),
                "configuration loaded"
            );
            cfg
        }
        Err(err) => {
            error!(
                stage = "startup",
                event = "config.load.end",
                result = "fail",
                config_path = %cli.config.display(),
                duration_ms = load_start.elapsed().as_millis(),
                error = %format!("{err:#}"),
                "configuration load failed"
            );
            return Err(err);
        }
    };

    if let Err(err) = cfg.validate_config() {
        error!(
            stage = "startup",
            event = "config.validate.end",
            result = "fail",
            error = %format!("{err:#}"),
            "configuration validation failed"
        );
        return Err(err);
    }

    let git = Git::new(cfg.global.git_bin.clone());
    git.validate_binary_exists()
        .await
        .context("runtime validation failed")?;

    let settings = cfg
        .repos
        .iter()
        .map(|repo| repo.settings())
        .collect::<Result<Vec<_>>>()?;

    if cli.validate_config {
        info!(
            stage = "startup",
            event = "startup.validate_only.exit",
            result = "ok",
            "configuration and runtime validation passed"
        );
        return Ok(());
    }

    let router = Arc::new(OwnershipTable::load(
        cfg.global.server_name.clone(),
        cfg.global.ownership_file.clone(),
    )?);
    let engine = CommitInfoEngine::new(cfg.global.indexer_config(), router.clone());
    for settings in settings {
        let name = settings.name.clone();
        engine
            .register(settings)
            .with_context(|| format!("failed to open repository '{name}'"))?;
    }

    let scheduler = Scheduler::new(Arc::new(engine), cfg.global.max_repo_concurrency)?;
    scheduler.submit(IndexEvent::SystemStarted).await;

    if cli.once {
        info!(
            stage = "startup",
            event = "startup.mode",
            mode = "once",
            "waiting for startup collection"
        );
        scheduler.wait_idle().await;
        return Ok(());
    }

    info!(
        stage = "startup",
        event = "startup.mode",
        mode = "forever",
        server = %cfg.global.server_name,
        repo_count = cfg.repos.len(),
        "watching refs and ownership"
    );

    let watcher = RefWatcher::new(git, &cfg.repos);
    let refs = tokio::spawn(watcher.run(cfg.global.poll_interval, scheduler.clone()));
    let ownership = {
        let router = Arc::clone(&router);
        let scheduler = scheduler.clone();
        let interval = cfg.global.ownership_poll_interval;
        tokio::spawn(async move { router.watch(interval, scheduler).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(stage = "startup", event = "startup.shutdown", "received ctrl-c, shutting down");
    refs.abort();
    ownership.abort();

    Ok(())
}
