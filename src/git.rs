//! Git collaborators
//!
//! The pile never talks to git directly; it goes through [`GitBackend`]:
//! - `clone_repo`: shallow clone of a URL into an empty directory
//! - `latest_commit`: hash of the most recent commit in a working tree
//! - `list_files`: lazy, single-pass listing of tracked files
//!
//! [`GitCli`] implements the trait by running the `git` binary.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use crate::{Error, Result};

/// Tracked paths relative to the repository root, produced lazily
pub type FileList = Box<dyn Iterator<Item = Result<String>> + Send>;

/// Operations the ingestion pipeline needs from git
pub trait GitBackend: Send + Sync {
    /// Clone `url` into `dest` with history truncated to `depth` commits
    fn clone_repo(&self, url: &str, dest: &Path, depth: u32) -> Result<()>;

    /// Hash of the most recent commit checked out in `repo_dir`
    fn latest_commit(&self, repo_dir: &Path) -> Result<String>;

    /// Files tracked in `repo_dir`. The iterator ends when the listing is exhausted.
    fn list_files(&self, repo_dir: &Path) -> Result<FileList>;
}

/// [`GitBackend`] backed by the `git` command-line tool
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether the configured binary can be executed at all
    pub fn is_available(&self) -> bool {
        self.command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        // Never block on a credential prompt
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        cmd
    }
}

fn stderr_message(stderr: &[u8]) -> String {
    let msg = String::from_utf8_lossy(stderr).trim().to_string();
    if msg.is_empty() {
        "git exited with an error".to_string()
    } else {
        msg
    }
}

impl GitBackend for GitCli {
    fn clone_repo(&self, url: &str, dest: &Path, depth: u32) -> Result<()> {
        tracing::debug!(url, dest = %dest.display(), depth, "git clone");
        let output = self
            .command()
            .arg("clone")
            .arg("--quiet")
            .arg("--depth")
            .arg(depth.to_string())
            .arg("--")
            .arg(url)
            .arg(dest)
            .output()
            .map_err(|e| Error::Clone {
                url: url.to_string(),
                message: format!("failed to execute git: {}", e),
            })?;

        if !output.status.success() {
            return Err(Error::Clone {
                url: url.to_string(),
                message: stderr_message(&output.stderr),
            });
        }
        Ok(())
    }

    fn latest_commit(&self, repo_dir: &Path) -> Result<String> {
        let output = self
            .command()
            .arg("-C")
            .arg(repo_dir)
            .args(["log", "-1", "--format=%H"])
            .output()
            .map_err(|e| Error::Commit(format!("failed to execute git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Commit(stderr_message(&output.stderr)));
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err(Error::Commit(format!(
                "no commits found in {}",
                repo_dir.display()
            )));
        }
        Ok(hash)
    }

    fn list_files(&self, repo_dir: &Path) -> Result<FileList> {
        let mut child = self
            .command()
            .arg("-C")
            .arg(repo_dir)
            .args(["ls-files", "-z"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ListFiles(format!("failed to execute git: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ListFiles("git stdout was not captured".to_string()))?;

        // Drained concurrently so a chatty stderr cannot stall stdout
        let stderr = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                err.read_to_end(&mut buf).ok();
                buf
            })
        });

        Ok(Box::new(LsFiles {
            child,
            reader: BufReader::new(stdout),
            stderr,
            done: false,
        }))
    }
}

/// Streams NUL-separated paths from a running `git ls-files -z`
struct LsFiles {
    child: Child,
    reader: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    done: bool,
}

impl LsFiles {
    /// Reap the child once stdout is exhausted and surface a non-zero exit
    fn finish(&mut self) -> Option<Result<String>> {
        self.done = true;
        let status = self.child.wait();
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        match status {
            Ok(status) if status.success() => None,
            Ok(_) => Some(Err(Error::ListFiles(stderr_message(&stderr)))),
            Err(e) => Some(Err(Error::ListFiles(e.to_string()))),
        }
    }
}

impl Iterator for LsFiles {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = Vec::new();
        match self.reader.read_until(0, &mut buf) {
            Ok(0) => self.finish(),
            Ok(_) => {
                if buf.last() == Some(&0) {
                    buf.pop();
                }
                match String::from_utf8(buf) {
                    Ok(path) => Some(Ok(path)),
                    Err(e) => {
                        self.done = true;
                        Some(Err(Error::ListFiles(format!(
                            "non UTF-8 path {:?}",
                            String::from_utf8_lossy(e.as_bytes())
                        ))))
                    }
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::ListFiles(e.to_string())))
            }
        }
    }
}

impl Drop for LsFiles {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}
