//! The pile: ingestion and search over mirrored repositories
//!
//! A [`Pile`] owns the connection pool and the clone staging directory.
//! [`Pile::add_repo`] is the only writer; listing and search are read-only.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::git::{GitBackend, GitCli};
use crate::storage::sqlite;
use crate::storage::{
    ConnectionPool, ConnectionTarget, PileStats, PoolConfig, PoolState, Repository, SearchHit,
    schema,
};
use crate::{Error, Result};

/// History depth requested when cloning
pub const CLONE_DEPTH: u32 = 1;

const STAGING_PREFIX: &str = "haystack-";

/// Options for [`Pile::open`]
#[derive(Clone, Default)]
pub struct PileOptions {
    connection: Option<String>,
    clone_dir: Option<PathBuf>,
    pool: PoolConfig,
    git: Option<Arc<dyn GitBackend>>,
}

impl PileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// SQLite path or `file:` URI. Empty means a private in-memory database.
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Directory that receives one disposable checkout per ingestion.
    /// Created if missing. Defaults to a temporary directory owned by the pile.
    pub fn clone_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.clone_dir = Some(dir.into());
        self
    }

    /// Maximum number of pooled connections (default: number of CPUs)
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool.max_size = size.max(1);
        self
    }

    /// How long to wait for a free connection before failing
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool.connection_timeout = timeout;
        self
    }

    /// Replace the git implementation (defaults to [`GitCli`])
    pub fn git(mut self, git: Arc<dyn GitBackend>) -> Self {
        self.git = Some(git);
        self
    }
}

impl std::fmt::Debug for PileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PileOptions")
            .field("connection", &self.connection)
            .field("clone_dir", &self.clone_dir)
            .field("pool", &self.pool)
            .field("git", &self.git.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Result of a successful [`Pile::add_repo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Head commit matched the stored one; nothing was written
    Unchanged { commit: String },
    /// Contents were replaced with the files of `commit`
    Indexed { commit: String, files: usize },
}

impl IngestOutcome {
    pub fn commit(&self) -> &str {
        match self {
            IngestOutcome::Unchanged { commit } | IngestOutcome::Indexed { commit, .. } => commit,
        }
    }
}

enum CloneRoot {
    /// Temporary directory removed when the pile goes away
    Owned(TempDir),
    /// Caller-provided directory, left in place
    Configured(PathBuf),
}

impl CloneRoot {
    fn path(&self) -> &Path {
        match self {
            CloneRoot::Owned(dir) => dir.path(),
            CloneRoot::Configured(path) => path,
        }
    }
}

/// Marks a URL as being ingested until dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    url: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, url: &str) -> Result<Self> {
        let mut urls = set.lock().unwrap_or_else(|e| e.into_inner());
        if !urls.insert(url.to_string()) {
            return Err(Error::IngestInProgress(url.to_string()));
        }
        Ok(Self {
            set,
            url: url.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.url);
    }
}

/// Store of mirrored repository contents
pub struct Pile {
    pool: ConnectionPool,
    clone_root: CloneRoot,
    git: Arc<dyn GitBackend>,
    in_flight: Mutex<HashSet<String>>,
}

impl Pile {
    /// Open a pile: build the pool, prepare the staging directory, apply the schema.
    pub fn open(options: PileOptions) -> Result<Self> {
        let target = ConnectionTarget::parse(options.connection.as_deref().unwrap_or(""));
        let pool = ConnectionPool::open(target, &options.pool)?;

        let clone_root = match options.clone_dir {
            Some(dir) => {
                fs::create_dir_all(&dir).map_err(|e| {
                    Error::Config(format!("cannot create clone directory {}: {}", dir.display(), e))
                })?;
                if !dir.is_dir() {
                    return Err(Error::Config(format!("{} is not a directory", dir.display())));
                }
                CloneRoot::Configured(dir)
            }
            None => CloneRoot::Owned(tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir()?),
        };

        {
            let conn = pool.get()?;
            schema::ensure_schema(&conn)?;
        }

        tracing::info!(
            connection = ?pool.target(),
            clone_dir = %clone_root.path().display(),
            pool_size = pool.max_size(),
            "Opened pile"
        );

        Ok(Self {
            pool,
            clone_root,
            git: options.git.unwrap_or_else(|| Arc::new(GitCli::default())),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Release the pool and remove the staging directory if the pile created it.
    pub fn close(self) -> Result<()> {
        let Pile {
            pool, clone_root, ..
        } = self;
        drop(pool);
        if let CloneRoot::Owned(dir) = clone_root {
            dir.close()?;
        }
        tracing::debug!("Closed pile");
        Ok(())
    }

    /// Root under which each ingestion gets its own checkout
    pub fn clone_dir(&self) -> &Path {
        self.clone_root.path()
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    // ========== Ingestion ==========

    /// Clone `url` and replace its indexed contents if the head commit moved.
    ///
    /// Everything written for the repository happens in one transaction:
    /// on any error, or when `cancel` fires during the file loop, the store
    /// is left exactly as it was.
    pub fn add_repo(&self, url: &str, cancel: &CancellationToken) -> Result<IngestOutcome> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::InvalidUrl(url.to_string()));
        }
        let _guard = InFlightGuard::acquire(&self.in_flight, url)?;

        let checkout = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.clone_root.path())?;

        tracing::info!("Cloning {} into {}", url, checkout.path().display());
        self.git.clone_repo(url, checkout.path(), CLONE_DEPTH)?;
        let commit = self.git.latest_commit(checkout.path())?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = sqlite::last_indexed_commit(&tx, url)?;
        if previous.as_deref() == Some(commit.as_str()) {
            tx.commit()?;
            tracing::info!(url, commit = %commit, "Head unchanged, nothing to index");
            return Ok(IngestOutcome::Unchanged { commit });
        }

        let repo_id = sqlite::upsert_repo(&tx, url, &commit)?;
        let removed = sqlite::clear_repo_contents(&tx, repo_id)?;
        let files = self.store_files(&tx, repo_id, checkout.path(), cancel)?;
        tx.commit()?;

        tracing::info!(
            url,
            commit = %commit,
            previous = previous.as_deref().unwrap_or(""),
            files,
            removed,
            "Indexed repository"
        );
        Ok(IngestOutcome::Indexed { commit, files })
    }

    fn store_files(
        &self,
        conn: &Connection,
        repo_id: i64,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut stored = 0;
        for entry in self.git.list_files(root)? {
            if cancel.is_cancelled() {
                tracing::warn!(stored, "Ingestion cancelled, rolling back");
                return Err(Error::Cancelled);
            }

            let path = entry?;
            let full_path = root.join(&path);
            let Some(content) = read_tracked_file(&full_path)? else {
                tracing::debug!("Skipping non-file entry {}", path);
                continue;
            };

            sqlite::insert_content(conn, repo_id, &path, &content)
                .map_err(|source| Error::InsertContent {
                    path: path.clone(),
                    source,
                })?;
            stored += 1;
        }
        Ok(stored)
    }

    // ========== Catalog ==========

    /// URLs of every stored repository, in insertion order
    pub fn list_repos(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        sqlite::list_repo_urls(&conn)
    }

    /// Full row for one repository
    pub fn repository(&self, url: &str) -> Result<Option<Repository>> {
        let conn = self.pool.get()?;
        sqlite::get_repository(&conn, url.trim())
    }

    // ========== Search ==========

    /// Every file, across all repositories, whose content contains `query`
    /// (ASCII case-insensitive). An empty query returns every file.
    pub fn search_all_repo_contents(&self, query: &str) -> Result<Vec<SearchHit>> {
        let conn = self.pool.get()?;
        sqlite::search_contents(&conn, query)
    }

    pub fn stats(&self) -> Result<PileStats> {
        let conn = self.pool.get()?;
        sqlite::stats(&conn)
    }
}

/// Content of the regular file a tracked path resolves to.
///
/// Symlinks are followed. Paths that do not end at a regular file
/// (submodule gitlinks, links to directories, dangling links) yield `None`.
fn read_tracked_file(path: &Path) -> Result<Option<Vec<u8>>> {
    let read_err = |source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    };

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound && path.is_symlink() => return Ok(None),
        Err(e) => return Err(read_err(e)),
    };
    if !meta.is_file() {
        return Ok(None);
    }
    fs::read(path).map(Some).map_err(read_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::FileList;

    const URL: &str = "https://example/repo";

    /// Writes a fixed file set into every checkout
    struct StaticGit {
        commit: Mutex<String>,
        files: Vec<(&'static str, &'static str)>,
        /// (link, target) pairs, listed after the files
        links: Vec<(&'static str, &'static str)>,
    }

    impl StaticGit {
        fn new(commit: &str, files: &[(&'static str, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                commit: Mutex::new(commit.to_string()),
                files: files.to_vec(),
                links: Vec::new(),
            })
        }

        fn set_commit(&self, commit: &str) {
            *self.commit.lock().unwrap() = commit.to_string();
        }
    }

    impl GitBackend for StaticGit {
        fn clone_repo(&self, _url: &str, dest: &Path, _depth: u32) -> Result<()> {
            for (path, content) in &self.files {
                let full = dest.join(path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(full, content)?;
            }
            #[cfg(unix)]
            for (link, target) in &self.links {
                std::os::unix::fs::symlink(target, dest.join(link))?;
            }
            Ok(())
        }

        fn latest_commit(&self, _repo_dir: &Path) -> Result<String> {
            Ok(self.commit.lock().unwrap().clone())
        }

        fn list_files(&self, _repo_dir: &Path) -> Result<FileList> {
            let paths: Vec<String> = self
                .files
                .iter()
                .map(|(path, _)| path)
                .chain(self.links.iter().map(|(link, _)| link))
                .map(|path| path.to_string())
                .collect();
            Ok(Box::new(paths.into_iter().map(Ok)))
        }
    }

    fn single_connection_pile(git: Arc<StaticGit>, clone_dir: &Path) -> Pile {
        Pile::open(
            PileOptions::new()
                .pool_size(1)
                .connection_timeout(Duration::from_millis(200))
                .clone_dir(clone_dir)
                .git(git),
        )
        .unwrap()
    }

    #[test]
    fn test_pool_exhaustion_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let clones = dir.path().join("clones");
        let pile = single_connection_pile(StaticGit::new("c1", &[("a.txt", "foo")]), &clones);

        {
            let _held = pile.pool.get().unwrap();
            let err = pile.add_repo(URL, &CancellationToken::new()).unwrap_err();
            assert!(matches!(err, Error::Pool(_)), "{:?}", err);
            assert_eq!(fs::read_dir(&clones).unwrap().count(), 0);
        }

        assert!(pile.list_repos().unwrap().is_empty());
        assert!(pile.repository(URL).unwrap().is_none());
        // The URL is free again once the failed call returned
        assert!(pile.add_repo(URL, &CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_insert_failure_keeps_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let git = StaticGit::new("c1", &[("a.txt", "foo"), ("b.txt", "bar")]);
        let pile = single_connection_pile(git.clone(), dir.path());
        pile.add_repo(URL, &CancellationToken::new()).unwrap();

        pile.pool
            .get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_contents BEFORE INSERT ON repo_contents
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        git.set_commit("c2");

        let err = pile.add_repo(URL, &CancellationToken::new()).unwrap_err();
        assert!(
            matches!(err, Error::InsertContent { ref path, .. } if path == "a.txt"),
            "{:?}",
            err
        );

        let repo = pile.repository(URL).unwrap().unwrap();
        assert_eq!(repo.last_indexed_commit_hash.as_deref(), Some("c1"));
        assert_eq!(pile.search_all_repo_contents("bar").unwrap().len(), 1);
        assert_eq!(pile.stats().unwrap().files, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_is_skipped_during_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(StaticGit {
            commit: Mutex::new("c1".to_string()),
            files: vec![("docs/guide.md", "read me")],
            links: vec![("docs-link", "docs"), ("guide-link", "docs/guide.md")],
        });
        let pile = single_connection_pile(git, dir.path());

        let outcome = pile.add_repo(URL, &CancellationToken::new()).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Indexed {
                commit: "c1".to_string(),
                files: 2
            }
        );

        let mut paths: Vec<String> = pile
            .search_all_repo_contents("read me")
            .unwrap()
            .into_iter()
            .map(|hit| hit.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["docs/guide.md", "guide-link"]);
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let set = Mutex::new(HashSet::new());

        let guard = InFlightGuard::acquire(&set, "https://example/repo").unwrap();
        assert!(matches!(
            InFlightGuard::acquire(&set, "https://example/repo"),
            Err(Error::IngestInProgress(_))
        ));
        assert!(InFlightGuard::acquire(&set, "https://example/other").is_ok());

        drop(guard);
        assert!(InFlightGuard::acquire(&set, "https://example/repo").is_ok());
    }

    #[test]
    fn test_read_tracked_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"foo").unwrap();
        fs::create_dir(dir.path().join("submodule")).unwrap();

        assert_eq!(read_tracked_file(&file).unwrap(), Some(b"foo".to_vec()));
        assert_eq!(read_tracked_file(&dir.path().join("submodule")).unwrap(), None);
        assert!(matches!(
            read_tracked_file(&dir.path().join("missing.txt")),
            Err(Error::ReadFile { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_followed() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"through the link").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        symlink("real.txt", dir.path().join("file-link")).unwrap();
        symlink("docs", dir.path().join("dir-link")).unwrap();
        symlink("does/not/exist", dir.path().join("dangling")).unwrap();

        assert_eq!(
            read_tracked_file(&dir.path().join("file-link")).unwrap(),
            Some(b"through the link".to_vec())
        );
        assert_eq!(read_tracked_file(&dir.path().join("dir-link")).unwrap(), None);
        assert_eq!(read_tracked_file(&dir.path().join("dangling")).unwrap(), None);
    }

    #[test]
    fn test_outcome_commit() {
        let unchanged = IngestOutcome::Unchanged {
            commit: "abc".to_string(),
        };
        let indexed = IngestOutcome::Indexed {
            commit: "def".to_string(),
            files: 2,
        };
        assert_eq!(unchanged.commit(), "abc");
        assert_eq!(indexed.commit(), "def");
    }

    #[test]
    fn test_open_and_close_removes_owned_clone_dir() {
        let pile = Pile::open(PileOptions::new().pool_size(2)).unwrap();
        let clone_dir = pile.clone_dir().to_path_buf();
        assert!(clone_dir.is_dir());
        assert!(pile.list_repos().unwrap().is_empty());

        pile.close().unwrap();
        assert!(!clone_dir.exists());
    }

    #[test]
    fn test_configured_clone_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let clone_dir = dir.path().join("nested").join("clones");

        let pile = Pile::open(PileOptions::new().pool_size(2).clone_dir(&clone_dir)).unwrap();
        assert_eq!(pile.clone_dir(), clone_dir.as_path());
        pile.close().unwrap();

        assert!(clone_dir.is_dir());
    }

    #[test]
    fn test_clone_dir_that_is_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let result = Pile::open(PileOptions::new().pool_size(1).clone_dir(&file));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_url_rejected() {
        let pile = Pile::open(PileOptions::new().pool_size(1)).unwrap();
        let err = pile.add_repo("  ", &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
        pile.close().unwrap();
    }
}
