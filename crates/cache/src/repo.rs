use crate::{DownloadError, DownloadManager, GetFileError, USER_AGENT};
use derive_more::{Display, Error};
use miette::Diagnostic;
use pacmirror_packet::Packet;
use pacmirror_repository::RepoRouter;
use reqwest::{header, StatusCode};
use std::{
    collections::HashSet,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tokio::{fs::File, sync::oneshot};

/// Error when fetching a repository database into the cache.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum FetchDatabaseError {
    #[display("No repository is configured for {path}")]
    #[diagnostic(code(pacmirror_cache::route_not_found))]
    RouteNotFound { path: String },

    #[diagnostic(transparent)]
    Fetch(#[error(source)] GetFileError),

    #[diagnostic(transparent)]
    Download(#[error(source)] DownloadError),
}

/// Error type of [`RepoCache::add_repo`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum AddRepoError {
    #[display("Repository {prefix} is already registered")]
    #[diagnostic(code(pacmirror_cache::already_registered))]
    AlreadyRegistered { prefix: String },

    #[diagnostic(transparent)]
    Fetch(#[error(source)] FetchDatabaseError),
}

/// Error type of [`RepoCache::get_db_file`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum GetDbFileError {
    #[display("No cached database for {path}")]
    #[diagnostic(code(pacmirror_cache::db_not_found))]
    NotFound { path: String },

    #[display("Failed to open cached database {path:?}: {error}")]
    #[diagnostic(code(pacmirror_cache::db_open))]
    Open {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Error type of [`RepoCache::proxy_repo`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum ProxyRepoError {
    #[display("No repository is configured for {path}")]
    #[diagnostic(code(pacmirror_cache::route_not_found))]
    RouteNotFound { path: String },

    #[display("No configured upstream answered for {path}")]
    #[diagnostic(code(pacmirror_cache::no_upstream))]
    NoUpstreamAvailable { path: String },
}

/// Tracks the repositories whose databases live in the cache and keeps
/// their cached packages fresh.
pub struct RepoCache {
    cache_dir: PathBuf,
    router: Arc<RepoRouter>,
    manager: Arc<DownloadManager>,
    /// Registered repository prefixes. Independent of the download
    /// manager's state lock and never held across an await.
    repos: Mutex<HashSet<String>>,
}

impl RepoCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        router: Arc<RepoRouter>,
        manager: Arc<DownloadManager>,
    ) -> Self {
        RepoCache {
            cache_dir: cache_dir.into(),
            router,
            manager,
            repos: Mutex::new(HashSet::new()),
        }
    }

    /// Register a repository and fetch its database. Registering the same
    /// prefix twice reports [`AddRepoError::AlreadyRegistered`].
    pub async fn add_repo(&self, prefix: &str) -> Result<(), AddRepoError> {
        if self.repos.lock().expect("repo registry lock").contains(prefix) {
            return Err(AddRepoError::AlreadyRegistered { prefix: prefix.to_string() });
        }

        tracing::info!(target: "pacmirror::repo", prefix = %prefix, "fetching repository database");
        self.fetch_database(prefix).await.map_err(AddRepoError::Fetch)?;
        self.repos.lock().expect("repo registry lock").insert(prefix.to_string());
        tracing::info!(target: "pacmirror::repo", prefix = %prefix, "repository now available");
        Ok(())
    }

    /// Download the database of a repository into the cache, overwriting
    /// the previous one, and wait until it is fully on disk.
    async fn fetch_database(&self, prefix: &str) -> Result<(), FetchDatabaseError> {
        let matched = self
            .router
            .match_path(prefix)
            .ok_or_else(|| FetchDatabaseError::RouteNotFound { path: prefix.to_string() })?;
        let db_path = matched.format.database_path(&matched.prefix);
        let db_route = self
            .router
            .match_path(&db_path)
            .ok_or_else(|| FetchDatabaseError::RouteNotFound { path: db_path.clone() })?;

        let (sender, receiver) = oneshot::channel();
        let reader = self
            .manager
            .get_file(&db_path, &db_route.upstream_urls, Some(sender), true)
            .await
            .map_err(FetchDatabaseError::Fetch)?;
        // Only the file on disk is needed here.
        let downloading = reader.is_downloading();
        drop(reader);

        if downloading {
            match receiver.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(FetchDatabaseError::Download(error)),
                Err(_) => {
                    return Err(FetchDatabaseError::Download(DownloadError::Interrupted {
                        path: db_path,
                    }))
                }
            }
        }
        Ok(())
    }

    /// Refresh every registered database in the background. The last
    /// error observed (or `Ok`) is delivered to `notify` exactly once.
    /// Each successfully refreshed repository gets its cached packages
    /// updated concurrently.
    pub fn update_databases(
        self: &Arc<Self>,
        notify: Option<oneshot::Sender<Result<(), FetchDatabaseError>>>,
    ) {
        let to_update: Vec<String> =
            self.repos.lock().expect("repo registry lock").iter().cloned().collect();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_error = None;
            for prefix in to_update {
                tracing::info!(target: "pacmirror::repo", prefix = %prefix, "refreshing repository database");
                match this.fetch_database(&prefix).await {
                    Ok(()) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move { this.update_packets(&prefix).await });
                    }
                    Err(error) => {
                        tracing::warn!(target: "pacmirror::repo", prefix = %prefix, %error, "database refresh failed");
                        last_error = Some(error);
                    }
                }
            }
            match &last_error {
                None => tracing::info!(target: "pacmirror::repo", "all databases refreshed"),
                Some(_) => tracing::warn!(target: "pacmirror::repo", "database refresh finished with errors"),
            }
            if let Some(notify) = notify {
                let _ = notify.send(match last_error {
                    None => Ok(()),
                    Some(error) => Err(error),
                });
            }
        });
    }

    /// Re-download every cached packet of `prefix` that the freshly
    /// fetched database supersedes. Best effort: failures are logged and
    /// swallowed.
    pub async fn update_packets(&self, prefix: &str) {
        let Some(matched) = self.router.match_path(prefix) else {
            return;
        };
        let db_path = matched.format.database_path(&matched.prefix);
        let database = match tokio::fs::read(self.cache_dir.join(&db_path)).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(target: "pacmirror::repo", prefix = %prefix, %error, "cannot read cached database");
                return;
            }
        };

        let local = self.manager.packet_set(&matched.prefix).await;
        let mut outdated: Vec<String> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let parsed = matched.format.parse_database(&database, &mut |packet: Packet| {
            let superseded = local
                .find_other_versions(&packet)
                .into_iter()
                .any(|other| other.version < packet.version);
            if superseded && seen.insert((packet.name.clone(), packet.arch.clone())) {
                outdated.push(format!("{}/{}", matched.prefix, packet.filename()));
            }
        });
        if let Err(error) = parsed {
            tracing::warn!(target: "pacmirror::repo", prefix = %prefix, %error, "failed to parse database");
            return;
        }

        for path in outdated {
            let Some(route) = self.router.match_path(&path) else {
                continue;
            };
            if let Err(error) = self.manager.background_download(&path, &route.upstream_urls).await
            {
                tracing::warn!(target: "pacmirror::repo", path = %path, %error, "packet upgrade failed");
            }
        }
        tracing::info!(target: "pacmirror::repo", prefix = %prefix, "cached packages are up to date");
    }

    /// The cached database of a registered repository, together with the
    /// time it was last refreshed.
    pub async fn get_db_file(&self, prefix: &str) -> Result<(File, SystemTime), GetDbFileError> {
        if !self.repos.lock().expect("repo registry lock").contains(prefix) {
            return Err(GetDbFileError::NotFound { path: prefix.to_string() });
        }
        let matched = self
            .router
            .match_path(prefix)
            .ok_or_else(|| GetDbFileError::NotFound { path: prefix.to_string() })?;
        let db_path = self.cache_dir.join(matched.format.database_path(&matched.prefix));

        let file = File::open(&db_path)
            .await
            .map_err(|error| GetDbFileError::Open { path: db_path.clone(), error })?;
        let modified = file
            .metadata()
            .await
            .and_then(|metadata| metadata.modified())
            .map_err(|error| GetDbFileError::Open { path: db_path, error })?;
        Ok((file, modified))
    }

    /// Forward a database request straight to the first upstream that
    /// answers 200 or 304, without touching the cache. Stale database
    /// responses are acceptable upstream of the cache but never cached.
    pub async fn proxy_repo(
        &self,
        path: &str,
        headers: &header::HeaderMap,
    ) -> Result<reqwest::Response, ProxyRepoError> {
        let matched = self
            .router
            .match_path(path)
            .ok_or_else(|| ProxyRepoError::RouteNotFound { path: path.to_string() })?;

        for url in &matched.upstream_urls {
            let mut forwarded = headers.clone();
            forwarded.remove(header::HOST);
            forwarded.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));

            let response = match self
                .manager
                .http_client()
                .get(url)
                .headers(forwarded)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(target: "pacmirror::repo", url = %url, %error, "upstream refused the connection");
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::OK || status == StatusCode::NOT_MODIFIED {
                return Ok(response);
            }
            tracing::debug!(target: "pacmirror::repo", url = %url, %status, "upstream did not answer 200 or 304");
        }

        Err(ProxyRepoError::NoUpstreamAvailable { path: path.to_string() })
    }
}
