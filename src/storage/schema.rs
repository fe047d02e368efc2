//! Database schema definitions

/// SQL to create the repos table
pub const CREATE_REPOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repos (
    id INTEGER PRIMARY KEY,
    url TEXT UNIQUE,
    last_indexed_commit_hash TEXT
)
"#;

/// SQL to create the repo_contents table
/// `repo_id` is a logical reference to `repos.id`; no foreign key is enforced
pub const CREATE_REPO_CONTENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repo_contents (
    repo_id INTEGER,
    path TEXT,
    content BLOB
)
"#;

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_REPOS_TABLE, CREATE_REPO_CONTENTS_TABLE]
}

/// Apply the schema to a connection. Safe to run on every open.
pub fn ensure_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    for stmt in all_schema_statements() {
        conn.execute(stmt, [])?;
    }
    Ok(())
}
