use crate::{FileReader, PartialFileReader};
use derive_more::{Display, Error};
use futures_util::StreamExt;
use miette::Diagnostic;
use pacmirror_packet::{Packet, PacketSet};
use reqwest::{header, StatusCode};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{oneshot, watch, Mutex},
};

/// User agent sent on every upstream request.
pub const USER_AGENT: &str = concat!("pacmirror/", env!("CARGO_PKG_VERSION"));

/// Terminal outcome of a download, fanned out to every completion channel
/// registered for it. Each channel receives exactly one value.
pub type DownloadOutcome = Result<(), DownloadError>;

/// Error that ends an already admitted download.
#[derive(Debug, Display, Error, Diagnostic, Clone)]
#[non_exhaustive]
pub enum DownloadError {
    #[display("Download of {path} ended after {written} of {expected} bytes")]
    #[diagnostic(code(pacmirror_cache::truncated_download))]
    TruncatedDownload { path: String, written: u64, expected: u64 },

    #[display("Upstream failed while downloading {path}: {message}")]
    #[diagnostic(code(pacmirror_cache::upstream))]
    Upstream { path: String, message: String },

    #[display("Failed to store {path}: {message}")]
    #[diagnostic(code(pacmirror_cache::storage))]
    Storage { path: String, message: String },

    #[display("Failed to move {path} into place: {message}")]
    #[diagnostic(code(pacmirror_cache::rename))]
    Rename { path: String, message: String },

    #[display("Download of {path} was interrupted")]
    #[diagnostic(code(pacmirror_cache::interrupted))]
    Interrupted { path: String },
}

/// Error when admitting a new download.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum StartDownloadError {
    #[display("No configured upstream could provide {path}")]
    #[diagnostic(code(pacmirror_cache::no_upstream))]
    NoUpstreamAvailable { path: String },

    #[display("Failed to create partial file for {path}: {error}")]
    #[diagnostic(code(pacmirror_cache::temp_create))]
    CreateTempFile {
        path: String,
        #[error(source)]
        error: io::Error,
    },
}

/// Error type of [`DownloadManager::get_file`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum GetFileError {
    #[display("No repository is configured for {path}")]
    #[diagnostic(code(pacmirror_cache::route_not_found))]
    RouteNotFound { path: String },

    #[display("{path} is not in the local cache")]
    #[diagnostic(code(pacmirror_cache::not_cached))]
    NotCached { path: String },

    #[display("Failed to open {path:?}: {error}")]
    #[diagnostic(code(pacmirror_cache::open))]
    Open {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },

    #[diagnostic(transparent)]
    Start(#[error(source)] StartDownloadError),
}

/// Error type of [`DownloadManager::background_download`].
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum BackgroundDownloadError {
    #[display("{path} is already being downloaded")]
    #[diagnostic(code(pacmirror_cache::already_downloading))]
    AlreadyDownloading { path: String },

    #[display("{path} is already in the cache")]
    #[diagnostic(code(pacmirror_cache::already_cached))]
    AlreadyCached { path: String },

    #[display("No repository is configured for {path}")]
    #[diagnostic(code(pacmirror_cache::route_not_found))]
    RouteNotFound { path: String },

    #[diagnostic(transparent)]
    Start(#[error(source)] StartDownloadError),

    #[diagnostic(transparent)]
    Download(#[error(source)] DownloadError),
}

/// Everything the copier task and the readers of one download share.
struct DownloadShared {
    /// Cache-relative path of the finished file, which also keys the
    /// ongoing-downloads map.
    path: String,
    /// Directory part of the request path; selects the packet set the
    /// finished packet is published into.
    repo_dir: String,
    /// Identity of the packet being fetched, `None` for database files.
    packet: Option<Packet>,
    part_path: PathBuf,
    target_path: PathBuf,
    /// Declared size from the upstream `Content-Length`.
    size: u64,
    /// Bytes flushed to the partial file so far. Written by the copier
    /// only, after the corresponding write completed.
    written: watch::Sender<u64>,
}

impl DownloadShared {
    /// A fresh view onto the partial file for one more reader.
    async fn reader(&self) -> io::Result<PartialFileReader> {
        let file = File::open(&self.part_path).await?;
        Ok(PartialFileReader::new(file, self.size, self.written.subscribe()))
    }
}

struct OngoingDownload {
    shared: Arc<DownloadShared>,
    waiters: Vec<oneshot::Sender<DownloadOutcome>>,
}

#[derive(Default)]
struct CacheState {
    /// Finished packets known to be on disk, one set per repository
    /// directory.
    packets: HashMap<String, PacketSet>,
    /// At most one entry per target path.
    downloads: HashMap<String, OngoingDownload>,
}

/// Deduplicating download manager over one cache directory.
///
/// Package files land flat in the cache directory, database files at their
/// repo-relative subpath; in-flight downloads write to a `.part` sibling
/// that is renamed into place on completion.
pub struct DownloadManager {
    cache_dir: PathBuf,
    client: reqwest::Client,
    /// Guards the packet sets and the ongoing-downloads map as a unit, so
    /// finalization (rename + eviction + publish) is atomic to observers.
    state: Mutex<CacheState>,
    /// Serializes admission of background downloads; always taken before
    /// the state lock, never after.
    background_admission: Mutex<()>,
}

impl DownloadManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(DownloadManager {
            cache_dir: cache_dir.into(),
            client: reqwest::Client::new(),
            state: Mutex::new(CacheState::default()),
            background_admission: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Snapshot of the finished packets recorded for one repository
    /// directory.
    pub async fn packet_set(&self, repo_dir: &str) -> PacketSet {
        self.state.lock().await.packets.get(repo_dir).cloned().unwrap_or_default()
    }

    /// Resolve `path` to a readable handle: the cached file if the packet
    /// is known, a partial view onto an ongoing download, or a freshly
    /// started download (only when `allow_remote` permits).
    ///
    /// When the returned reader is [`FileReader::Downloading`], `notify`
    /// has been registered and will receive the final outcome exactly
    /// once. On a cache hit, and on `Err`, `notify` is dropped unused.
    pub async fn get_file(
        self: &Arc<Self>,
        path: &str,
        upstreams: &[String],
        notify: Option<oneshot::Sender<DownloadOutcome>>,
        allow_remote: bool,
    ) -> Result<FileReader, GetFileError> {
        let (repo_dir, filename) = split_path(path);
        let mut state = self.state.lock().await;

        let cached =
            state.packets.get(repo_dir).and_then(|set| set.by_filename(filename)).is_some();
        if cached {
            let target = self.cache_dir.join(filename);
            let file = File::open(&target)
                .await
                .map_err(|error| GetFileError::Open { path: target, error })?;
            return Ok(FileReader::Cached(file));
        }

        if let Some(ongoing) = state.downloads.get_mut(path) {
            let reader = ongoing.shared.reader().await.map_err(|error| GetFileError::Open {
                path: ongoing.shared.part_path.clone(),
                error,
            })?;
            if let Some(notify) = notify {
                ongoing.waiters.push(notify);
            }
            return Ok(FileReader::Downloading(reader));
        }

        if !allow_remote {
            return Err(GetFileError::NotCached { path: path.to_string() });
        }

        let shared = self
            .start_download(&mut state, path, upstreams, notify)
            .await
            .map_err(GetFileError::Start)?;
        let reader = shared
            .reader()
            .await
            .map_err(|error| GetFileError::Open { path: shared.part_path.clone(), error })?;
        Ok(FileReader::Downloading(reader))
    }

    /// Download `path` into the cache and wait for the outcome.
    ///
    /// Admission is serialized so concurrent callers cannot both pass the
    /// not-already-downloading check; many foreground [`get_file`]
    /// downloads can still run alongside.
    ///
    /// [`get_file`]: DownloadManager::get_file
    pub async fn background_download(
        self: &Arc<Self>,
        path: &str,
        upstreams: &[String],
    ) -> Result<(), BackgroundDownloadError> {
        let _admission = self.background_admission.lock().await;

        let receiver = {
            let mut state = self.state.lock().await;
            if state.downloads.contains_key(path) {
                return Err(BackgroundDownloadError::AlreadyDownloading {
                    path: path.to_string(),
                });
            }
            let (repo_dir, filename) = split_path(path);
            let cached =
                state.packets.get(repo_dir).and_then(|set| set.by_filename(filename)).is_some();
            if cached {
                return Err(BackgroundDownloadError::AlreadyCached { path: path.to_string() });
            }

            let (sender, receiver) = oneshot::channel();
            self.start_download(&mut state, path, upstreams, Some(sender))
                .await
                .map_err(BackgroundDownloadError::Start)?;
            receiver
        };

        match receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(BackgroundDownloadError::Download(error)),
            Err(_) => Err(BackgroundDownloadError::Download(DownloadError::Interrupted {
                path: path.to_string(),
            })),
        }
    }

    /// Try each upstream in order and admit the first one that answers 200
    /// with a declared length. Called with the state lock held, which is
    /// what makes "at most one download per target" hold.
    async fn start_download(
        self: &Arc<Self>,
        state: &mut CacheState,
        path: &str,
        upstreams: &[String],
        notify: Option<oneshot::Sender<DownloadOutcome>>,
    ) -> Result<Arc<DownloadShared>, StartDownloadError> {
        let (repo_dir, filename) = split_path(path);
        let packet = filename.parse::<Packet>().ok();
        let target_path = match packet {
            Some(_) => self.cache_dir.join(filename),
            None => self.cache_dir.join(path),
        };
        let part_path = target_path.with_file_name(format!("{filename}.part"));

        for url in upstreams {
            let response = match self
                .client
                .get(url)
                .header(header::USER_AGENT, USER_AGENT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(target: "pacmirror::download", url = %url, %error, "upstream refused the connection");
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                tracing::debug!(target: "pacmirror::download", url = %url, status = %response.status(), "upstream did not answer 200");
                continue;
            }
            let Some(size) = response.content_length() else {
                tracing::debug!(target: "pacmirror::download", url = %url, "upstream did not declare a content length");
                continue;
            };

            if let Some(parent) = part_path.parent() {
                fs::create_dir_all(parent).await.map_err(|error| {
                    StartDownloadError::CreateTempFile { path: path.to_string(), error }
                })?;
            }
            let file = File::create(&part_path).await.map_err(|error| {
                StartDownloadError::CreateTempFile { path: path.to_string(), error }
            })?;

            let (written, _) = watch::channel(0);
            let shared = Arc::new(DownloadShared {
                path: path.to_string(),
                repo_dir: repo_dir.to_string(),
                packet,
                part_path,
                target_path,
                size,
                written,
            });
            state.downloads.insert(
                path.to_string(),
                OngoingDownload {
                    shared: Arc::clone(&shared),
                    waiters: notify.into_iter().collect(),
                },
            );

            tracing::info!(target: "pacmirror::download", path = %path, url = %url, size, "downloading from upstream");
            tokio::spawn(Arc::clone(self).run_copier(Arc::clone(&shared), response, file));
            return Ok(shared);
        }

        Err(StartDownloadError::NoUpstreamAvailable { path: path.to_string() })
    }

    async fn run_copier(self: Arc<Self>, shared: Arc<DownloadShared>, response: reqwest::Response, mut file: File) {
        let copied = copy_body(&shared, response, &mut file).await;
        drop(file);
        self.finish(shared, copied).await;
    }

    /// Sole delivery site for download outcomes: removes the partial file
    /// on failure, renames / evicts / publishes on success, and sends the
    /// outcome to every registered waiter exactly once.
    async fn finish(&self, shared: Arc<DownloadShared>, copied: Result<(), DownloadError>) {
        let mut state = self.state.lock().await;

        let outcome = match copied {
            Err(error) => {
                self.discard_part(&shared).await;
                tracing::warn!(target: "pacmirror::download", path = %shared.path, %error, "download failed");
                Err(error)
            }
            Ok(()) => match fs::rename(&shared.part_path, &shared.target_path).await {
                Err(error) => {
                    self.discard_part(&shared).await;
                    tracing::warn!(target: "pacmirror::download", path = %shared.path, %error, "failed to move finished download into place");
                    Err(DownloadError::Rename {
                        path: shared.path.clone(),
                        message: error.to_string(),
                    })
                }
                Ok(()) => {
                    if let Some(packet) = &shared.packet {
                        let set = state.packets.entry(shared.repo_dir.clone()).or_default();
                        let superseded: Vec<String> = set
                            .find_other_versions(packet)
                            .into_iter()
                            .filter(|other| other.version < packet.version)
                            .map(Packet::filename)
                            .collect();
                        for filename in superseded {
                            if let Err(error) = fs::remove_file(self.cache_dir.join(&filename)).await {
                                tracing::warn!(target: "pacmirror::download", %filename, %error, "failed to remove superseded packet");
                            } else {
                                tracing::info!(target: "pacmirror::download", %filename, "removed superseded packet");
                            }
                            set.delete(&filename);
                        }
                        set.insert(packet.clone());
                    }
                    tracing::info!(target: "pacmirror::download", path = %shared.path, "now available in the cache");
                    Ok(())
                }
            },
        };

        if let Some(entry) = state.downloads.remove(&shared.path) {
            for waiter in entry.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn discard_part(&self, shared: &DownloadShared) {
        if let Err(error) = fs::remove_file(&shared.part_path).await {
            tracing::warn!(target: "pacmirror::download", path = %shared.path, %error, "failed to remove partial file");
        }
    }
}

/// Stream the response body into the partial file, publishing progress
/// after every completed write. The published counter never exceeds the
/// declared size.
async fn copy_body(
    shared: &DownloadShared,
    response: reqwest::Response,
    file: &mut File,
) -> Result<(), DownloadError> {
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::debug!(target: "pacmirror::download", path = %shared.path, %error, "response body ended abnormally");
                // A body cut short before the declared size is a
                // truncation, whatever the transport called it.
                return Err(if written < shared.size {
                    DownloadError::TruncatedDownload {
                        path: shared.path.clone(),
                        written,
                        expected: shared.size,
                    }
                } else {
                    DownloadError::Upstream {
                        path: shared.path.clone(),
                        message: error.to_string(),
                    }
                });
            }
        };
        file.write_all(&chunk).await.map_err(|error| DownloadError::Storage {
            path: shared.path.clone(),
            message: error.to_string(),
        })?;
        written += chunk.len() as u64;
        if written > shared.size {
            return Err(DownloadError::TruncatedDownload {
                path: shared.path.clone(),
                written,
                expected: shared.size,
            });
        }
        shared.written.send_replace(written);
    }
    file.flush().await.map_err(|error| DownloadError::Storage {
        path: shared.path.clone(),
        message: error.to_string(),
    })?;

    if written < shared.size {
        return Err(DownloadError::TruncatedDownload {
            path: shared.path.clone(),
            written,
            expected: shared.size,
        });
    }
    Ok(())
}

/// Split a cache-relative request path into its directory part and its
/// filename.
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((repo_dir, filename)) => (repo_dir, filename),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::split_path;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_path_takes_the_last_segment() {
        assert_eq!(
            split_path("core/os/x86_64/linux-6.1.1-1-x86_64.pkg.tar.zst"),
            ("core/os/x86_64", "linux-6.1.1-1-x86_64.pkg.tar.zst")
        );
        assert_eq!(split_path("core.db"), ("", "core.db"));
    }
}
