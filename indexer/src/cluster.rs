//! Which node serves a repository. Every read and write for a repository goes
//! through its active node; other nodes either forward or refuse.

use crate::config::RepoId;
use crate::error::Result;
use crate::query::{Query, QueryResult};

pub trait ClusterRouter: Send + Sync {
    fn local_server(&self) -> &str;

    /// Node currently authoritative for `repo`, if any is known.
    fn active_server(&self, repo: RepoId) -> Option<String>;

    fn is_active_here(&self, repo: RepoId) -> bool {
        self.active_server(repo)
            .is_some_and(|server| server == self.local_server())
    }
}

/// Single node deployment: this node owns every repository.
#[derive(Debug, Clone)]
pub struct StandaloneRouter {
    server: String,
}

impl StandaloneRouter {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

impl ClusterRouter for StandaloneRouter {
    fn local_server(&self) -> &str {
        &self.server
    }

    fn active_server(&self, _repo: RepoId) -> Option<String> {
        Some(self.server.clone())
    }
}

/// Runs a query on another node.
pub trait QueryForwarder: Send + Sync {
    fn forward(&self, server: &str, repo: RepoId, query: Query) -> Result<QueryResult>;
}
