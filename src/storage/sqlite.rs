//! SQLite statements for the pile
//!
//! Every function takes a plain `&Connection`. A `rusqlite::Transaction`
//! derefs to `Connection`, so the ingestion pipeline runs the same
//! statements inside its transaction that readers run outside one.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One indexed repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub url: String,
    /// Commit whose files are currently stored; `None` before the first index
    pub last_indexed_commit_hash: Option<String>,
}

/// A file whose content matched a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub repo_url: String,
    pub path: String,
}

// ========== Ingestion ==========

/// Commit hash recorded for `url`, if the repository is known and indexed
pub fn last_indexed_commit(conn: &Connection, url: &str) -> Result<Option<String>> {
    let hash: Option<Option<String>> = conn
        .query_row(
            "SELECT last_indexed_commit_hash FROM repos WHERE url = ?1 LIMIT 1",
            [url],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash.flatten())
}

/// Insert the repository or move an existing row to `commit`; returns its id
pub fn upsert_repo(conn: &Connection, url: &str, commit: &str) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO repos (url, last_indexed_commit_hash) VALUES (?1, ?2)
        ON CONFLICT (url) DO UPDATE SET last_indexed_commit_hash = excluded.last_indexed_commit_hash
        "#,
        params![url, commit],
    )?;
    let id = conn.query_row("SELECT id FROM repos WHERE url = ?1", [url], |row| row.get(0))?;
    Ok(id)
}

/// Drop every content row of a repository; returns the number removed
pub fn clear_repo_contents(conn: &Connection, repo_id: i64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM repo_contents WHERE repo_id = ?1", [repo_id])?)
}

/// Store one file. Returns the raw rusqlite error so the caller can attach the path.
pub fn insert_content(
    conn: &Connection,
    repo_id: i64,
    path: &str,
    content: &[u8],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO repo_contents (repo_id, path, content) VALUES (?1, ?2, ?3)",
    )?;
    stmt.execute(params![repo_id, path, content])?;
    Ok(())
}

// ========== Catalog ==========

/// All repository URLs in insertion order
pub fn list_repo_urls(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT url FROM repos ORDER BY id")?;
    let urls = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(urls)
}

/// Look up a repository row by URL
pub fn get_repository(conn: &Connection, url: &str) -> Result<Option<Repository>> {
    conn.query_row(
        "SELECT id, url, last_indexed_commit_hash FROM repos WHERE url = ?1",
        [url],
        |row| {
            Ok(Repository {
                id: row.get(0)?,
                url: row.get(1)?,
                last_indexed_commit_hash: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

// ========== Search ==========

/// Files whose content contains `query`, ignoring ASCII case.
///
/// An empty query matches every stored file.
pub fn search_contents(conn: &Connection, query: &str) -> Result<Vec<SearchHit>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT r.url, c.path
        FROM repo_contents c
        JOIN repos r ON r.id = c.repo_id
        WHERE ?1 = '' OR instr(lower(CAST(c.content AS TEXT)), lower(?1)) > 0
        ORDER BY r.id, c.path
        "#,
    )?;

    let hits = stmt
        .query_map([query], |row| {
            Ok(SearchHit {
                repo_url: row.get(0)?,
                path: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(hits)
}

// ========== Stats ==========

/// Get database statistics
pub fn stats(conn: &Connection) -> Result<PileStats> {
    let repos: i64 = conn.query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?;
    let files: i64 = conn.query_row("SELECT COUNT(*) FROM repo_contents", [], |row| row.get(0))?;
    Ok(PileStats {
        repos: repos as usize,
        files: files as usize,
    })
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PileStats {
    pub repos: usize,
    pub files: usize,
}

impl std::fmt::Display for PileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pile Statistics:")?;
        writeln!(f, "  Repositories: {}", self.repos)?;
        writeln!(f, "  Files: {}", self.files)
    }
}
