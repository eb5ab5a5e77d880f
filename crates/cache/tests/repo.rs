pub use _utils::*;

use pacmirror_cache::{AddRepoError, Cache, GetDbFileError, GetFileError, ProxyRepoError};
use pacmirror_repository::{PacmanFormat, RepoEntry, RepoRouter};
use pretty_assertions::assert_eq;
use reqwest::header::HeaderMap;
use std::{fs, sync::Arc};
use tokio::{io::AsyncReadExt, sync::oneshot};

const PREFIX: &str = "core/os/x86_64";
const PKG_OLD: &str = "linux-6.1.1-1-x86_64.pkg.tar.zst";
const PKG_NEW: &str = "linux-6.2.0-1-x86_64.pkg.tar.zst";

fn cache_for(dir: &std::path::Path, mirror: &str) -> Cache {
    let router = RepoRouter::new(vec![RepoEntry {
        prefix: PREFIX.to_string(),
        format: Arc::new(PacmanFormat),
        mirrors: vec![format!("{mirror}/{PREFIX}")],
    }]);
    Cache::new(dir, router)
}

#[tokio::test]
async fn add_repo_fetches_the_database_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let db = database(&[PKG_NEW]);
    server
        .mock("GET", "/core/os/x86_64/core.db")
        .with_status(200)
        .with_body(&db)
        .create_async()
        .await;

    let cache = cache_for(dir.path(), &server.url());
    cache.add_repo(PREFIX).await.unwrap();
    assert_eq!(fs::read(dir.path().join("core/os/x86_64/core.db")).unwrap(), db);

    let again = cache.add_repo(PREFIX).await;
    assert!(matches!(again, Err(AddRepoError::AlreadyRegistered { .. })));
}

#[tokio::test]
async fn get_db_file_serves_the_cached_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let db = database(&[PKG_NEW]);
    server
        .mock("GET", "/core/os/x86_64/core.db")
        .with_status(200)
        .with_body(&db)
        .create_async()
        .await;

    let cache = cache_for(dir.path(), &server.url());

    let missing = cache.get_db_file(PREFIX).await;
    assert!(matches!(missing, Err(GetDbFileError::NotFound { .. })));

    cache.add_repo(PREFIX).await.unwrap();
    let (mut reader, modified) = cache.get_db_file(PREFIX).await.unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    assert_eq!(content, db);
    assert!(modified.elapsed().unwrap().as_secs() < 60);
}

#[tokio::test]
async fn database_refresh_upgrades_superseded_packages() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let db = database(&[PKG_NEW]);
    server
        .mock("GET", "/core/os/x86_64/core.db")
        .with_status(200)
        .with_body(&db)
        .expect_at_least(2)
        .create_async()
        .await;
    server
        .mock("GET", format!("/{PREFIX}/{PKG_OLD}").as_str())
        .with_status(200)
        .with_body("old")
        .create_async()
        .await;
    server
        .mock("GET", format!("/{PREFIX}/{PKG_NEW}").as_str())
        .with_status(200)
        .with_body("new")
        .create_async()
        .await;

    let cache = cache_for(dir.path(), &server.url());
    cache.add_repo(PREFIX).await.unwrap();

    // Cache the outdated version as a client request would.
    let (sender, receiver) = oneshot::channel();
    let reader = cache.get_file(&format!("{PREFIX}/{PKG_OLD}"), Some(sender), true).await.unwrap();
    drop(reader);
    receiver.await.unwrap().unwrap();
    assert!(dir.path().join(PKG_OLD).exists());

    let (sender, receiver) = oneshot::channel();
    cache.update_databases(Some(sender));
    receiver.await.unwrap().unwrap();

    let new_path = dir.path().join(PKG_NEW);
    let old_path = dir.path().join(PKG_OLD);
    wait_until("the superseded packet to be replaced", || {
        new_path.exists() && !old_path.exists()
    })
    .await;
    assert_eq!(fs::read(&new_path).unwrap(), b"new");
}

#[tokio::test]
async fn proxy_repo_streams_the_first_good_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/core/os/x86_64/core.db")
        .with_status(200)
        .with_header("x-upstream", "yes")
        .with_body("DBDATA")
        .create_async()
        .await;

    let cache = cache_for(dir.path(), &server.url());
    let response =
        cache.proxy_repo("core/os/x86_64/core.db", &HeaderMap::new()).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"DBDATA");

    // Nothing was written into the cache by proxying.
    assert!(!dir.path().join("core/os/x86_64/core.db").exists());

    let unrouted = cache.proxy_repo("community/os/x86_64/community.db", &HeaderMap::new()).await;
    assert!(matches!(unrouted, Err(ProxyRepoError::RouteNotFound { .. })));
}

#[tokio::test]
async fn requests_outside_every_repo_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_for(dir.path(), "http://unused.example");

    let result = cache.get_file("community/os/x86_64/foo-1.0-1-any.pkg.tar.zst", None, true).await;
    assert!(matches!(result, Err(GetFileError::RouteNotFound { .. })));
}
