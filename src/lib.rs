pub mod cache;
pub mod candidates;
pub mod config;
pub mod db;
pub mod engine;
pub mod entity;
pub mod error;
pub mod evaluation;
pub mod graph;
pub mod heuristics;
pub mod matching;
pub mod oracle;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use engine::{FullRunOptions, FullRunSummary, RelationDiscoveryEngine};
pub use error::{ReldiscoError, Result};
