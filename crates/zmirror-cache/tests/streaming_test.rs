//! Integration tests: publish atomicity and cancellation mid-transfer.
//!
//! These need an origin that streams its body slowly or stalls after the
//! first chunk, so a tiny axum server plays upstream.

use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, extract::State, routing::get, Router};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use zmirror_cache::{ArtifactCache, ArtifactId, CacheOutcome};

const RELEASE: &str = "zig-linux-x86_64-0.13.0.tar.xz";
const RELEASE_ROUTE: &str = "/download/0.13.0/zig-linux-x86_64-0.13.0.tar.xz";
const CHUNK: usize = 16 * 1024;
const CHUNKS: usize = 32;

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn chunk_bytes(i: usize) -> Vec<u8> {
    vec![(i % 251) as u8; CHUNK]
}

fn full_body() -> Vec<u8> {
    (0..CHUNKS).flat_map(chunk_bytes).collect()
}

/// Serves the artifact in CHUNKS pieces with a pause before each one.
fn slow_body() -> Body {
    let stream = futures::stream::iter(0..CHUNKS).then(|i| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, Infallible>(Bytes::from(chunk_bytes(i)))
    });
    Body::from_stream(stream)
}

fn scratch_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn readers_never_observe_a_partial_file() {
    let base = spawn_upstream(Router::new().route(RELEASE_ROUTE, get(|| async { slow_body() }))).await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ArtifactCache::new(dir.path(), &base, Client::new()));
    let id = ArtifactId::parse(RELEASE).unwrap();
    let final_path = cache.path_for(&id);
    let expected = full_body();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = done.clone();
        let final_path = final_path.clone();
        let expected = expected.clone();
        tokio::spawn(async move {
            let mut observed = 0usize;
            while !done.load(Ordering::SeqCst) {
                if let Ok(content) = tokio::fs::read(&final_path).await {
                    assert_eq!(content.len(), expected.len(), "partial file observed");
                    assert!(content == expected, "content differs from upstream");
                    observed += 1;
                }
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let outcome = cache.ensure_cached(&id).await.unwrap();
    done.store(true, Ordering::SeqCst);
    reader.await.unwrap();

    assert_eq!(
        outcome.as_str(),
        "fetched",
        "first request must perform the download"
    );
    if let CacheOutcome::Fetched { bytes, .. } = outcome {
        assert_eq!(bytes, expected.len() as u64);
    }
    assert_eq!(std::fs::read(&final_path).unwrap(), expected);
    assert!(scratch_files(dir.path()).is_empty());
}

#[derive(Clone, Default)]
struct StallOnce {
    hits: Arc<AtomicUsize>,
}

/// First request: one chunk, then the body never ends. Later requests: the
/// whole artifact.
async fn stall_once(State(state): State<StallOnce>) -> Body {
    if state.hits.fetch_add(1, Ordering::SeqCst) == 0 {
        let stream = futures::stream::once(async { Ok::<_, Infallible>(Bytes::from(chunk_bytes(0))) })
            .chain(futures::stream::pending());
        Body::from_stream(stream)
    } else {
        Body::from(full_body())
    }
}

#[tokio::test]
async fn cancelled_fetch_cleans_up_and_can_be_retried() {
    let upstream = StallOnce::default();
    let base = spawn_upstream(
        Router::new()
            .route(RELEASE_ROUTE, get(stall_once))
            .with_state(upstream.clone()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ArtifactCache::new(dir.path(), &base, Client::new()));
    let id = ArtifactId::parse(RELEASE).unwrap();

    let task = {
        let cache = cache.clone();
        let id = id.clone();
        tokio::spawn(async move { cache.ensure_cached(&id).await })
    };

    // The scratch file exists once the first chunk is on its way
    let scratch_dir = dir.path().to_path_buf();
    wait_until(|| scratch_files(&scratch_dir).len() == 1).await;
    assert_eq!(cache.in_flight(), 1);
    assert!(!cache.contains(&id).await);

    task.abort();
    let join = task.await;
    assert!(join.unwrap_err().is_cancelled());

    assert!(scratch_files(dir.path()).is_empty(), "scratch file removed");
    assert_eq!(cache.in_flight(), 0, "slot released");
    assert!(!cache.contains(&id).await, "nothing published");

    // A fresh request starts a new download instead of deadlocking
    let outcome = tokio::time::timeout(Duration::from_secs(5), cache.ensure_cached(&id))
        .await
        .expect("retry must not hang")
        .unwrap();
    assert!(matches!(outcome, CacheOutcome::Fetched { .. }));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(cache.path_for(&id)).unwrap(), full_body());
}

#[tokio::test]
async fn waiter_proceeds_after_holder_is_cancelled() {
    let upstream = StallOnce::default();
    let base = spawn_upstream(
        Router::new()
            .route(RELEASE_ROUTE, get(stall_once))
            .with_state(upstream.clone()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ArtifactCache::new(dir.path(), &base, Client::new()));
    let id = ArtifactId::parse(RELEASE).unwrap();

    let holder = {
        let cache = cache.clone();
        let id = id.clone();
        tokio::spawn(async move { cache.ensure_cached(&id).await })
    };
    let scratch_dir = dir.path().to_path_buf();
    wait_until(|| scratch_files(&scratch_dir).len() == 1).await;

    // Queue a second request behind the stalled one
    let waiter = {
        let cache = cache.clone();
        let id = id.clone();
        tokio::spawn(async move { cache.ensure_cached(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    holder.abort();
    let _ = holder.await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter must not deadlock")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, CacheOutcome::Fetched { .. }));
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
}
