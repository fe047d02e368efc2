//! SQLite connection pool using r2d2
//!
//! Every pile operation borrows exactly one connection from the pool and
//! returns it when the guard is dropped. File-backed databases run in WAL
//! mode; the default target is a private in-memory database on SQLite's
//! `memdb` VFS, which takes real file locks so `busy_timeout` applies.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::Result;

/// Counter for generating unique in-memory database names
static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Timeout for acquiring a connection from the pool
    pub connection_timeout: Duration,
    /// Busy timeout applied to every connection, in milliseconds
    pub busy_timeout_ms: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: num_cpus::get().max(1) as u32,
            connection_timeout: Duration::from_secs(30),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// A private in-memory database shared by all connections of one pool
    Memory,
    /// A path or `file:` URI handed to SQLite as-is
    File(String),
}

impl ConnectionTarget {
    /// Interpret a connection string; empty means a private in-memory store.
    pub fn parse(connection: &str) -> Self {
        let connection = connection.trim();
        if connection.is_empty() {
            ConnectionTarget::Memory
        } else {
            ConnectionTarget::File(connection.to_string())
        }
    }

    fn is_memory(&self) -> bool {
        match self {
            ConnectionTarget::Memory => true,
            ConnectionTarget::File(s) => {
                s.contains(":memory:") || s.contains("mode=memory") || s.contains("vfs=memdb")
            }
        }
    }
}

/// Pragmas for file-backed databases
#[derive(Debug)]
struct FileConnectionInitializer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for FileConnectionInitializer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// Pragmas for in-memory databases
/// WAL needs shared memory on disk, so the journal stays in memory
#[derive(Debug)]
struct MemoryConnectionInitializer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for MemoryConnectionInitializer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};
             PRAGMA journal_mode=MEMORY;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// SQLite connection pool wrapper
pub struct ConnectionPool {
    pool: Pool<SqliteConnectionManager>,
    target: ConnectionTarget,
}

impl ConnectionPool {
    /// Open a pool for the given target.
    ///
    /// Connections are established eagerly, so an unusable target fails here
    /// rather than on first use.
    pub fn open(target: ConnectionTarget, config: &PoolConfig) -> Result<Self> {
        let pool = match &target {
            ConnectionTarget::File(path) if !target.is_memory() => Pool::builder()
                .max_size(config.max_size)
                .connection_timeout(config.connection_timeout)
                .connection_customizer(Box::new(FileConnectionInitializer {
                    busy_timeout_ms: config.busy_timeout_ms,
                }))
                .build(SqliteConnectionManager::file(path))?,
            _ => {
                let uri = match &target {
                    ConnectionTarget::File(uri) => uri.clone(),
                    ConnectionTarget::Memory => {
                        let db_id = MEMORY_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
                        format!(
                            "file:/haystack-mem-{}-{}?vfs=memdb",
                            std::process::id(),
                            db_id
                        )
                    }
                };
                // The database only lives while a connection to it is open,
                // so memory pools never retire connections.
                Pool::builder()
                    .max_size(config.max_size)
                    .min_idle(Some(config.max_size))
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connection_timeout(config.connection_timeout)
                    .connection_customizer(Box::new(MemoryConnectionInitializer {
                        busy_timeout_ms: config.busy_timeout_ms,
                    }))
                    .build(SqliteConnectionManager::file(uri))?
            }
        };

        tracing::debug!(?target, max_size = config.max_size, "Opened connection pool");
        Ok(Self { pool, target })
    }

    /// Borrow a connection; it goes back to the pool when dropped.
    pub fn get(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn max_size(&self) -> u32 {
        self.pool.max_size()
    }

    /// Get the current pool state (for diagnostics)
    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Pool state information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Total number of connections managed by the pool
    pub connections: u32,
    /// Number of idle connections in the pool
    pub idle_connections: u32,
}
