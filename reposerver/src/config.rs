use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use commitinfo_indexer::config::{DEFAULT_COLLECT_BATCH_SIZE, DEFAULT_MAX_HISTORY_PATHS};
use commitinfo_indexer::{IndexerConfig, RepoId, RepoSettings};
use glob::Pattern;
use humantime::parse_duration;
use serde::Deserialize;

use crate::logging::LogFormat;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_repo_concurrency: usize,
    pub git_bin: String,
    pub server_name: String,
    /// Absent means this node owns every repository.
    pub ownership_file: Option<PathBuf>,
    pub ownership_poll_interval: Duration,
    pub collect_batch_size: usize,
    pub max_history_paths: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub id: RepoId,
    pub name: String,
    pub git_dir: PathBuf,
    pub default_branch: String,
    pub code_analysis_patterns: Vec<String>,
    pub fix_keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    global: RawGlobalConfig,
    #[serde(rename = "repo", default)]
    repos: Vec<RawRepoConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobalConfig {
    data_dir: Option<PathBuf>,
    poll_interval: Option<String>,
    max_repo_concurrency: Option<usize>,
    git_bin: Option<String>,
    server_name: Option<String>,
    ownership_file: Option<PathBuf>,
    ownership_poll_interval: Option<String>,
    collect_batch_size: Option<usize>,
    max_history_paths: Option<usize>,
    log_format: Option<LogFormat>,
}

#[derive(Debug, Deserialize)]
struct RawRepoConfig {
    id: RepoId,
    name: String,
    git_dir: PathBuf,
    default_branch: Option<String>,
    #[serde(default)]
    code_analysis_patterns: Vec<String>,
    #[serde(default)]
    fix_keywords: Vec<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;

        let parsed: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML {}", path.display()))?;

        Self::from_raw(parsed)
    }

    fn from_raw(raw: FileConfig) -> Result<Self> {
        if raw.repos.is_empty() {
            bail!("config must include at least one [[repo]] entry");
        }

        let poll_interval = parse_duration_string(
            raw.global.poll_interval.as_deref().unwrap_or("30s"),
            "global.poll_interval",
        )?;
        let ownership_poll_interval = parse_duration_string(
            raw.global
                .ownership_poll_interval
                .as_deref()
                .unwrap_or("10s"),
            "global.ownership_poll_interval",
        )?;

        let global = GlobalConfig {
            data_dir: raw
                .global
                .data_dir
                .unwrap_or_else(|| PathBuf::from(".commitinfo")),
            poll_interval,
            max_repo_concurrency: raw.global.max_repo_concurrency.unwrap_or(1).max(1),
            git_bin: raw.global.git_bin.unwrap_or_else(|| "git".to_string()),
            server_name: raw
                .global
                .server_name
                .unwrap_or_else(|| "local".to_string()),
            ownership_file: raw.global.ownership_file,
            ownership_poll_interval,
            collect_batch_size: raw
                .global
                .collect_batch_size
                .unwrap_or(DEFAULT_COLLECT_BATCH_SIZE),
            max_history_paths: raw
                .global
                .max_history_paths
                .unwrap_or(DEFAULT_MAX_HISTORY_PATHS),
            log_format: raw.global.log_format.unwrap_or_default(),
        };

        let repos = raw
            .repos
            .into_iter()
            .map(|repo| RepoConfig {
                id: repo.id,
                name: repo.name,
                git_dir: repo.git_dir,
                default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
                code_analysis_patterns: repo.code_analysis_patterns,
                fix_keywords: repo.fix_keywords,
            })
            .collect();

        Ok(Self { global, repos })
    }

    pub fn validate_config(&self) -> Result<()> {
        if self.repos.is_empty() {
            bail!("config must include at least one [[repo]] entry");
        }
        if self.global.git_bin.trim().is_empty() {
            bail!("global.git_bin must not be empty");
        }
        if self.global.server_name.trim().is_empty() {
            bail!("global.server_name must not be empty");
        }
        if self.global.collect_batch_size == 0 {
            bail!("global.collect_batch_size must be greater than zero");
        }
        if self.global.max_history_paths == 0 {
            bail!("global.max_history_paths must be greater than zero");
        }

        let mut ids = HashSet::new();
        for repo in &self.repos {
            if repo.name.trim().is_empty() {
                bail!("repo {} has an empty name", repo.id);
            }
            if !ids.insert(repo.id) {
                bail!("repo id {} is configured more than once", repo.id);
            }
            if repo.default_branch.trim().is_empty() {
                bail!("repo '{}' default_branch must not be empty", repo.name);
            }
            for pattern in &repo.code_analysis_patterns {
                Pattern::new(pattern).with_context(|| {
                    format!(
                        "repo '{}' has invalid code analysis pattern '{}'",
                        repo.name, pattern
                    )
                })?;
            }
            if repo.fix_keywords.iter().any(|keyword| keyword.trim().is_empty()) {
                bail!("repo '{}' contains an empty fix keyword", repo.name);
            }
        }

        Ok(())
    }
}

impl GlobalConfig {
    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig::new(self.data_dir.clone())
            .with_collect_batch_size(self.collect_batch_size)
            .with_max_history_paths(self.max_history_paths)
            .with_local_server(self.server_name.clone())
    }
}

impl RepoConfig {
    pub fn settings(&self) -> Result<RepoSettings> {
        let settings = RepoSettings::new(self.id, self.name.clone(), self.git_dir.clone())
            .with_default_branch(self.default_branch.clone())
            .with_fix_keywords(self.fix_keywords.clone())
            .with_code_analysis_patterns(&self.code_analysis_patterns)
            .with_context(|| format!("invalid settings for repo '{}'", self.name))?;
        Ok(settings)
    }
}

fn parse_duration_string(value: &str, field: &str) -> Result<Duration> {
    let duration = parse_duration(value)
        .with_context(|| format!("invalid duration for {field}: '{value}'"))?;

    if duration.is_zero() {
        return Err(anyhow!("duration for {field} must be greater than zero"));
    }

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<AppConfig> {
        let parsed: FileConfig = toml::from_str(raw).expect("parse config");
        AppConfig::from_raw(parsed)
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = parse(
            r#"
            [[repo]]
            id = 1
            name = "foo"
            git_dir = "/srv/git/foo.git"
        "#,
        )
        .expect("normalize");

        assert_eq!(cfg.repos.len(), 1);
        assert_eq!(cfg.repos[0].default_branch, "main");
        assert_eq!(cfg.global.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.global.ownership_poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.global.max_repo_concurrency, 1);
        assert_eq!(cfg.global.collect_batch_size, 10_000);
        assert_eq!(cfg.global.log_format, LogFormat::Compact);
        assert!(cfg.global.ownership_file.is_none());
        cfg.validate_config().expect("valid");
    }

    #[test]
    fn parses_full_config() {
        let cfg = parse(
            r#"
            [global]
            data_dir = "/var/lib/commitinfo"
            poll_interval = "1m"
            max_repo_concurrency = 4
            server_name = "node-a"
            ownership_file = "ownership.json"
            collect_batch_size = 500
            log_format = "json"

            [[repo]]
            id = 7
            name = "foo"
            git_dir = "/srv/git/foo.git"
            default_branch = "trunk"
            code_analysis_patterns = ["**/*.rs"]
            fix_keywords = ["fix", "closes"]
        "#,
        )
        .expect("normalize");

        assert_eq!(cfg.global.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.global.max_repo_concurrency, 4);
        assert_eq!(cfg.global.log_format, LogFormat::Json);
        assert_eq!(
            cfg.global.ownership_file.as_deref(),
            Some(Path::new("ownership.json"))
        );

        let indexer = cfg.global.indexer_config();
        assert_eq!(indexer.collect_batch_size, 500);
        assert_eq!(indexer.local_server, "node-a");

        let settings = cfg.repos[0].settings().expect("settings");
        assert_eq!(settings.default_branch_ref(), "refs/heads/trunk");
        assert!(settings.analyzes("src/lib.rs"));
        assert!(!settings.analyzes("README.md"));
    }

    #[test]
    fn rejects_zero_duration() {
        let err = parse(
            r#"
            [global]
            poll_interval = "0s"

            [[repo]]
            id = 1
            name = "foo"
            git_dir = "/srv/git/foo.git"
        "#,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn rejects_duplicate_repo_ids() {
        let cfg = parse(
            r#"
            [[repo]]
            id = 1
            name = "foo"
            git_dir = "/srv/git/foo.git"

            [[repo]]
            id = 1
            name = "bar"
            git_dir = "/srv/git/bar.git"
        "#,
        )
        .expect("normalize");
        let err = cfg.validate_config().expect_err("should fail");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_invalid_analysis_pattern() {
        let cfg = parse(
            r#"
            [[repo]]
            id = 1
            name = "foo"
            git_dir = "/srv/git/foo.git"
            code_analysis_patterns = ["src/[*.rs"]
        "#,
        )
        .expect("normalize");
        let err = cfg.validate_config().expect_err("should fail");
        assert!(format!("{err:#}").contains("invalid code analysis pattern"));
    }

    #[test]
    fn rejects_config_without_repos() {
        let err = parse("[global]\nserver_name = \"a\"\n").expect_err("should fail");
        assert!(err.to_string().contains("at least one [[repo]]"));
    }
}
