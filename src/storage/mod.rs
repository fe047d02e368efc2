//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - repos(id, url, last_indexed_commit_hash)
//! - repo_contents(repo_id, path, content)

pub mod pool;
pub mod schema;
pub mod sqlite;

pub use pool::{ConnectionPool, ConnectionTarget, PoolConfig, PoolState, PooledConnection};
pub use sqlite::{PileStats, Repository, SearchHit};
