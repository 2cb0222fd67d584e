pub mod aggregates;
pub mod cache;
pub mod cli;
pub mod cluster;
pub mod codec;
pub mod collector;
pub mod config;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod fixes;
pub mod git;
pub mod graph;
pub mod history;
pub mod output;
pub mod query;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

pub use cli::run;
pub use collector::CollectOutcome;
pub use config::{IndexerConfig, RepoId, RepoSettings};
pub use engine::CommitInfoEngine;
pub use error::{IndexError, Result};
