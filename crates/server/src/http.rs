use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use miette::{Context, IntoDiagnostic};
use pacmirror_cache::{Cache, GetDbFileError, GetFileError, StartDownloadError};
use pacmirror_config::{FormatKind, Settings};
use pacmirror_repository::{PacmanFormat, RepoEntry, RepoFormat, RepoRouter, RouteMatch};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::io::ReaderStream;

/// Build the cache from the settings and serve it over HTTP until the
/// process is stopped.
pub async fn serve(settings: Settings) -> miette::Result<()> {
    std::fs::create_dir_all(&settings.cache_dir)
        .into_diagnostic()
        .wrap_err("create the cache directory")?;

    let entries = settings
        .repos
        .iter()
        .map(|repo| RepoEntry {
            prefix: repo.prefix.trim_matches('/').to_string(),
            format: match repo.format {
                FormatKind::Pacman => Arc::new(PacmanFormat) as Arc<dyn RepoFormat>,
            },
            mirrors: repo.mirrors.clone(),
        })
        .collect();
    let cache = Cache::new(&settings.cache_dir, RepoRouter::new(entries));

    // Fetch the configured databases up front; the server starts even
    // when a mirror is down.
    for repo in &settings.repos {
        let prefix = repo.prefix.trim_matches('/');
        if let Err(error) = cache.add_repo(prefix).await {
            tracing::warn!(target: "pacmirror::server", prefix = %prefix, %error, "initial database fetch failed");
        }
    }

    if settings.refresh_interval_secs > 0 {
        spawn_periodic_refresh(cache.clone(), Duration::from_secs(settings.refresh_interval_secs));
    }

    let app = Router::new().route("/*path", get(serve_path)).with_state(cache);
    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .into_diagnostic()
        .wrap_err("bind the listen address")?;
    tracing::info!(target: "pacmirror::server", addr = %settings.listen_addr, "listening");
    axum::serve(listener, app).await.into_diagnostic().wrap_err("serve HTTP")?;
    Ok(())
}

fn spawn_periodic_refresh(cache: Cache, period: Duration) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await;
        loop {
            timer.tick().await;
            let (sender, receiver) = oneshot::channel();
            cache.update_databases(Some(sender));
            if let Ok(Err(error)) = receiver.await {
                tracing::warn!(target: "pacmirror::server", %error, "periodic database refresh failed");
            }
        }
    });
}

async fn serve_path(
    State(cache): State<Cache>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(route) = cache.route(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if route.format.is_database(&route.remainder) {
        serve_database(cache, &path, route, headers).await
    } else {
        serve_packet(cache, &path).await
    }
}

/// The canonical database of a registered repository is served from the
/// cache; any other database-like file is proxied straight through. The
/// first request for an unknown repository registers it in the
/// background.
async fn serve_database(cache: Cache, path: &str, route: RouteMatch, headers: HeaderMap) -> Response {
    if path == route.format.database_path(&route.prefix) {
        match cache.get_db_file(&route.prefix).await {
            Ok((file, modified)) => {
                let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
                if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                    response.headers_mut().insert(header::LAST_MODIFIED, value);
                }
                return response;
            }
            Err(GetDbFileError::NotFound { .. }) => {
                let cache = cache.clone();
                let prefix = route.prefix.clone();
                tokio::spawn(async move {
                    if let Err(error) = cache.add_repo(&prefix).await {
                        tracing::debug!(target: "pacmirror::server", prefix = %prefix, %error, "repository registration failed");
                    }
                });
            }
            Err(error) => {
                tracing::warn!(target: "pacmirror::server", path = %path, %error, "cannot serve cached database");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    match cache.proxy_repo(path, &headers).await {
        Ok(upstream) => {
            let status = upstream.status();
            let upstream_headers = upstream.headers().clone();
            let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
            *response.status_mut() = status;
            *response.headers_mut() = upstream_headers;
            response
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_packet(cache: Cache, path: &str) -> Response {
    match cache.get_file(path, None, true).await {
        Ok(reader) => Body::from_stream(ReaderStream::new(reader)).into_response(),
        Err(GetFileError::RouteNotFound { .. } | GetFileError::NotCached { .. }) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(GetFileError::Start(StartDownloadError::NoUpstreamAvailable { .. })) => {
            StatusCode::BAD_GATEWAY.into_response()
        }
        Err(error) => {
            tracing::warn!(target: "pacmirror::server", path = %path, %error, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
