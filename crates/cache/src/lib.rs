mod download;
mod partial;
mod reader;
mod repo;

pub use download::{
    BackgroundDownloadError, DownloadError, DownloadManager, DownloadOutcome, GetFileError,
    StartDownloadError, USER_AGENT,
};
pub use partial::PartialFileReader;
pub use reader::FileReader;
pub use repo::{
    AddRepoError, FetchDatabaseError, GetDbFileError, ProxyRepoError, RepoCache,
};

use pacmirror_repository::{RepoRouter, RouteMatch};
use reqwest::header::HeaderMap;
use std::{path::PathBuf, sync::Arc, time::SystemTime};
use tokio::{fs::File, sync::oneshot};

/// The cache as one object: routing, the deduplicating download manager,
/// and the repository registry behind a single handle the HTTP layer
/// talks to. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct Cache {
    router: Arc<RepoRouter>,
    manager: Arc<DownloadManager>,
    repos: Arc<RepoCache>,
}

impl Cache {
    pub fn new(cache_dir: impl Into<PathBuf>, router: RepoRouter) -> Self {
        let cache_dir = cache_dir.into();
        let router = Arc::new(router);
        let manager = DownloadManager::new(&cache_dir);
        let repos =
            Arc::new(RepoCache::new(cache_dir, Arc::clone(&router), Arc::clone(&manager)));
        Cache { router, manager, repos }
    }

    /// Route a request path to its repository, if any is configured.
    pub fn route(&self, path: &str) -> Option<RouteMatch> {
        self.router.match_path(path)
    }

    /// Serve a cache-relative path: cached file, joined in-flight
    /// download, or a fresh download from the repository's mirrors.
    pub async fn get_file(
        &self,
        path: &str,
        notify: Option<oneshot::Sender<DownloadOutcome>>,
        allow_remote: bool,
    ) -> Result<FileReader, GetFileError> {
        let matched = self
            .router
            .match_path(path)
            .ok_or_else(|| GetFileError::RouteNotFound { path: path.to_string() })?;
        self.manager.get_file(path, &matched.upstream_urls, notify, allow_remote).await
    }

    /// Download a cache-relative path and wait for the outcome.
    pub async fn background_download(&self, path: &str) -> Result<(), BackgroundDownloadError> {
        let matched = self
            .router
            .match_path(path)
            .ok_or_else(|| BackgroundDownloadError::RouteNotFound { path: path.to_string() })?;
        self.manager.background_download(path, &matched.upstream_urls).await
    }

    /// Register a repository and fetch its database.
    pub async fn add_repo(&self, prefix: &str) -> Result<(), AddRepoError> {
        self.repos.add_repo(prefix).await
    }

    /// Refresh all registered databases in the background; `notify`
    /// receives the last error (or `Ok`) exactly once.
    pub fn update_databases(
        &self,
        notify: Option<oneshot::Sender<Result<(), FetchDatabaseError>>>,
    ) {
        self.repos.update_databases(notify)
    }

    /// The cached database of a registered repository and its refresh
    /// time.
    pub async fn get_db_file(&self, prefix: &str) -> Result<(File, SystemTime), GetDbFileError> {
        self.repos.get_db_file(prefix).await
    }

    /// Stream a database request straight from the first responsive
    /// upstream, bypassing the cache.
    pub async fn proxy_repo(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<reqwest::Response, ProxyRepoError> {
        self.repos.proxy_repo(path, headers).await
    }
}
