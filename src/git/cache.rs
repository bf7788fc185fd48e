//! Repository cache.
//!
//! One canonical shallow clone per repository URL lives under
//! `<dir>/repos/<repo-dir>`. Workers never touch it directly: [`RepoCache::get`]
//! hands out a private copy under `<dir>/namespaces/<namespace>/`, and the
//! whole namespace is dropped with [`RepoCache::purge`] once the dispatch
//! cycle that created it is done.
//!
//! Canonical clones are only mutated by [`RepoCache::fill`], which holds the
//! write lock for the whole call. Copies take the read lock, so no copy ever
//! observes a half-finished fetch.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{GitError, fetch_shallow, init};
use crate::metrics::Metrics;
use crate::types::PackageUri;

/// Hex digits of the URL hash in a clone's directory name.
const URL_HASH_LEN: usize = 8;

/// Errors from the repository cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("repository not cached: {0}")]
    NotCached(String),

    #[error("unusable repository path: {0}")]
    InvalidRepo(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("fetch of {repo} failed: {source}")]
    Fetch {
        repo: String,
        #[source]
        source: GitError,
    },

    #[error("copy failed: {0}")]
    Copy(#[from] fs_extra::error::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}

/// Canonical clones plus disposable per-caller copies.
#[derive(Debug)]
pub struct RepoCache {
    dir: PathBuf,
    /// Repository URL to the refs fetched for it.
    repos: RwLock<HashMap<String, Vec<String>>>,
    metrics: Metrics,
}

impl RepoCache {
    pub fn new(dir: impl Into<PathBuf>, metrics: Metrics) -> Self {
        RepoCache {
            dir: dir.into(),
            repos: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Initialises and shallow-fetches every repository in `uris`, running at
    /// most `limit` fetches at once.
    ///
    /// Refs accumulate: a repository keeps every ref it was ever filled with.
    /// Repositories are fetched again on every call. All fetches are attempted,
    /// including after a repository whose URL cannot be mapped to a directory,
    /// and the first error is returned. Only successful fetches are counted.
    #[instrument(skip_all, fields(repos = tracing::field::Empty))]
    pub async fn fill(
        &self,
        token: &CancellationToken,
        limit: usize,
        uris: &[PackageUri],
    ) -> Result<(), CacheError> {
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let mut repos = self.repos.write().await;

        let mut wanted: Vec<String> = Vec::new();
        for uri in uris {
            let refs = repos.entry(uri.repo.clone()).or_default();
            if !refs.contains(&uri.git_ref) {
                refs.push(uri.git_ref.clone());
            }
            if !wanted.contains(&uri.repo) {
                wanted.push(uri.repo.clone());
            }
        }
        tracing::Span::current().record("repos", wanted.len());

        let permits = Arc::new(Semaphore::new(limit.max(1)));
        let mut fetches = JoinSet::new();
        let mut first_error = None;

        for repo in wanted {
            let path = match repo_dir(&repo) {
                Ok(rel) => self.dir.join("repos").join(rel),
                Err(e) => {
                    warn!(repo, error = %e, "skipping repository");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let refs = repos.get(&repo).cloned().unwrap_or_default();
            let permits = Arc::clone(&permits);
            let token = token.clone();
            let metrics = self.metrics.clone();

            fetches.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|_| CacheError::Cancelled)?;
                tokio::select! {
                    _ = token.cancelled() => Err(CacheError::Cancelled),
                    result = ensure(&path, &repo, &refs) => {
                        if result.is_ok() {
                            metrics.git_fetch(&repo);
                        }
                        result
                    }
                }
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let result = joined.map_err(CacheError::from).and_then(|r| r);
            if let Err(e) = result {
                warn!(error = %e, "repository fetch failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Copies the canonical clone of `repo` into a fresh directory inside
    /// `namespace` and returns its path.
    pub async fn get(&self, namespace: &str, repo: &str) -> Result<PathBuf, CacheError> {
        let repos = self.repos.read().await;
        if !repos.contains_key(repo) {
            return Err(CacheError::NotCached(repo.to_string()));
        }

        let rel = repo_dir(repo)?;
        let src = self.dir.join("repos").join(&rel);
        if !src.join(".git").exists() {
            return Err(CacheError::NotCached(repo.to_string()));
        }

        let dst = self
            .namespace_dir(namespace)?
            .join(&rel)
            .join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dst).await?;

        let target = dst.clone();
        tokio::task::spawn_blocking(move || {
            let options = fs_extra::dir::CopyOptions::new().content_only(true);
            fs_extra::dir::copy(&src, &target, &options)
        })
        .await??;

        debug!(repo, path = %dst.display(), "repository copied");
        Ok(dst)
    }

    /// Removes every copy made in `namespace`.
    pub async fn purge(&self, namespace: &str) -> Result<(), CacheError> {
        let _repos = self.repos.read().await;
        let path = self.namespace_dir(namespace)?;

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, CacheError> {
        let mut components = Path::new(namespace).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dir.join("namespaces").join(namespace)),
            _ => Err(CacheError::InvalidNamespace(namespace.to_string())),
        }
    }
}

async fn ensure(path: &Path, repo: &str, refs: &[String]) -> Result<(), CacheError> {
    let fetch_err = |source: GitError| CacheError::Fetch {
        repo: repo.to_string(),
        source,
    };

    if path.join(".git").exists() {
        debug!(repo, "updating repository");
        return fetch_shallow(path, refs).await.map_err(fetch_err);
    }

    if path.exists() {
        tokio::fs::remove_dir_all(path).await?;
    }
    info!(repo, "cloning repository");
    let cloned = match init(path, repo).await {
        Ok(()) => fetch_shallow(path, refs).await,
        Err(e) => Err(e),
    };

    // A clone that never fetched is not usable; drop it so `get` reports it
    // as not cached.
    if let Err(e) = cloned {
        let _ = tokio::fs::remove_dir_all(path).await;
        return Err(fetch_err(e));
    }
    Ok(())
}

/// Maps a repository URL to a relative directory: scheme dropped, characters
/// outside `[A-Za-z0-9._-]` replaced per path segment, and the last segment
/// suffixed with a short hash of the full URL so that URLs differing only in
/// scheme or replaced characters do not share a clone.
pub(crate) fn repo_dir(url: &str) -> Result<PathBuf, CacheError> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);

    let mut segments: Vec<String> = Vec::new();
    for segment in rest.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(CacheError::InvalidRepo(url.to_string()));
        }
        segments.push(
            segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
        );
    }

    let Some(last) = segments.last_mut() else {
        return Err(CacheError::InvalidRepo(url.to_string()));
    };
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    last.push('-');
    last.push_str(&digest[..URL_HASH_LEN]);

    Ok(segments.iter().collect())
}
