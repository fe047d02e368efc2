//! In-process git double for pile tests

#![allow(dead_code)]

use haystack::git::FileList;
use haystack::{CancellationToken, Error, GitBackend, Pile, PileOptions, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct FakeRepo {
    pub commit: String,
    pub files: Vec<(String, Vec<u8>)>,
    /// Listed by `list_files` but never written to the checkout
    pub phantom_files: Vec<String>,
    pub fail_commit: bool,
}

impl FakeRepo {
    pub fn new(commit: &str, files: &[(&str, &str)]) -> Self {
        Self {
            commit: commit.to_string(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
                .collect(),
            phantom_files: Vec::new(),
            fail_commit: false,
        }
    }
}

/// Pauses the next clone until the test releases it
struct CloneGate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Serves repositories from memory; unknown URLs fail to clone
#[derive(Default)]
pub struct FakeGit {
    repos: Mutex<HashMap<String, FakeRepo>>,
    checkouts: Mutex<HashMap<PathBuf, String>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    gate: Mutex<Option<CloneGate>>,
    clones: Mutex<usize>,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_repo(&self, url: &str, repo: FakeRepo) {
        self.repos.lock().unwrap().insert(url.to_string(), repo);
    }

    /// Cancel `token` while listing, right after `files` entries were handed out
    pub fn cancel_after(&self, files: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((files, token));
    }

    /// Block the next clone. Returns (entered, release) channels.
    pub fn gate_next_clone(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        *self.gate.lock().unwrap() = Some(CloneGate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }

    pub fn clone_count(&self) -> usize {
        *self.clones.lock().unwrap()
    }

    fn repo_for(&self, dir: &Path) -> Result<FakeRepo> {
        let url = self
            .checkouts
            .lock()
            .unwrap()
            .get(dir)
            .cloned()
            .ok_or_else(|| Error::Commit(format!("{} is not a checkout", dir.display())))?;
        self.repos
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| Error::Commit(format!("{} vanished", url)))
    }
}

impl GitBackend for FakeGit {
    fn clone_repo(&self, url: &str, dest: &Path, _depth: u32) -> Result<()> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).ok();
            gate.release.recv().ok();
        }
        *self.clones.lock().unwrap() += 1;

        let repo = self
            .repos
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Clone {
                url: url.to_string(),
                message: "repository not found".to_string(),
            })?;

        for (path, content) in &repo.files {
            let full = dest.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, content)?;
        }
        self.checkouts
            .lock()
            .unwrap()
            .insert(dest.to_path_buf(), url.to_string());
        Ok(())
    }

    fn latest_commit(&self, repo_dir: &Path) -> Result<String> {
        let repo = self.repo_for(repo_dir)?;
        if repo.fail_commit {
            return Err(Error::Commit("bad object HEAD".to_string()));
        }
        Ok(repo.commit)
    }

    fn list_files(&self, repo_dir: &Path) -> Result<FileList> {
        let repo = self.repo_for(repo_dir)?;
        let paths: Vec<String> = repo
            .files
            .into_iter()
            .map(|(p, _)| p)
            .chain(repo.phantom_files)
            .collect();

        let cancel = self.cancel_after.lock().unwrap().take();
        Ok(Box::new(paths.into_iter().enumerate().map(move |(i, path)| {
            if let Some((after, token)) = &cancel {
                if i == *after {
                    token.cancel();
                }
            }
            Ok(path)
        })))
    }
}

pub fn open_pile(git: &Arc<FakeGit>) -> Pile {
    Pile::open(PileOptions::new().pool_size(2).git(git.clone())).unwrap()
}

pub fn paths(pile: &Pile, query: &str) -> Vec<String> {
    pile.search_all_repo_contents(query)
        .unwrap()
        .into_iter()
        .map(|hit| hit.path)
        .collect()
}
