//! End-to-end scenarios driven against a real TCP listener and a fake
//! upstream mirror (`httpmock`). Each test spins up its own
//! `AppContext`/listener in an isolated temp directory so scenarios never
//! share cache state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use httpmock::prelude::*;

use cpcache::auth;
use cpcache::config::Config;
use cpcache::content_length::ContentLengthCache;
use cpcache::mirror::MirrorSelector;
use cpcache::request::{self, AppContext};
use cpcache::serializer;
use cpcache::store::Store;

fn unique_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!("cpcache-test-{}-{}-{}", std::process::id(), label, n));
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn test_ctx(cache_dir: &Path, wanted_dir: &Path, mirrors: Vec<String>, secret: &[u8]) -> AppContext {
    let mut config = Config::default();
    config.cache_directory = cache_dir.to_path_buf();
    config.wanted_packages_directory = wanted_dir.to_path_buf();
    config.mirrors_predefined = mirrors;
    config.recv_packages_key = secret.to_vec();

    let store = Store::open(cache_dir).unwrap();
    let content_length_cache = ContentLengthCache::open(&store).unwrap();
    let mirror_selector = Arc::new(MirrorSelector::new(&config, &store).unwrap());

    AppContext {
        config: Arc::new(config),
        content_length_cache,
        mirror_selector,
        serializer: serializer::spawn(),
        client: reqwest::Client::new(),
    }
}

async fn spawn_server(ctx: AppContext) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let ctx = ctx.clone();
            tokio::spawn(request::handle_connection(socket, ctx));
        }
    });
    addr
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn cold_fetch_populates_cache_and_content_length() {
    let cache_dir = unique_dir("s1-cache");
    let wanted_dir = unique_dir("s1-wanted");
    let body = vec![0x41u8; 1000];

    let mock_server = MockServer::start_async().await;
    let mock = mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg");
            then.status(200)
                .header("Content-Length", "1000")
                .body(body.clone());
        })
        .await;

    let ctx = test_ctx(&cache_dir, &wanted_dir, vec![mock_server.base_url()], b"secret");
    let addr = spawn_server(ctx.clone()).await;

    let resp = reqwest::get(format!("http://{}/A.pkg", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let received = resp.bytes().await.unwrap();
    assert_eq!(&received[..], &body[..]);

    assert_eq!(mock.hits_async().await, 1);

    let local_path = cache_dir.join("pkg").join("A.pkg");
    assert_eq!(std::fs::metadata(&local_path).unwrap().len(), 1000);
    assert_eq!(
        ctx.content_length_cache.get("A.pkg"),
        cpcache::content_length::LookupResult::Found(1000)
    );
}

#[tokio::test]
async fn concurrent_cold_fetch_hits_upstream_once() {
    let cache_dir = unique_dir("s2-cache");
    let wanted_dir = unique_dir("s2-wanted");
    let body = vec![0x41u8; 200];

    let mock_server = MockServer::start_async().await;
    let mock = mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg");
            then.status(200)
                .header("Content-Length", "200")
                .delay(Duration::from_millis(200))
                .body(body.clone());
        })
        .await;

    let ctx = test_ctx(&cache_dir, &wanted_dir, vec![mock_server.base_url()], b"secret");
    let addr = spawn_server(ctx).await;

    let url = format!("http://{}/A.pkg", addr);
    let (a, b, c) = tokio::join!(
        reqwest::get(url.clone()),
        reqwest::get(url.clone()),
        reqwest::get(url.clone()),
    );

    for resp in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert_eq!(resp.status(), 200);
        let received = resp.bytes().await.unwrap();
        assert_eq!(&received[..], &body[..]);
    }

    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn resume_after_crash_sends_range_request() {
    let cache_dir = unique_dir("s3-cache");
    let wanted_dir = unique_dir("s3-wanted");
    let tail = vec![0x41u8; 500];

    let mock_server = MockServer::start_async().await;
    let mock = mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg").header("Range", "bytes=500-");
            then.status(200)
                .header("Content-Range", "bytes 500-999/1000")
                .body(tail.clone());
        })
        .await;

    // Seed state as if the proxy crashed after writing the first 500 bytes:
    // the content-length is already known, but nothing is tracked as
    // in-flight, matching a freshly-restarted Serializer with no memory of
    // the prior attempt.
    {
        let store = Store::open(&cache_dir).unwrap();
        let cl = ContentLengthCache::open(&store).unwrap();
        cl.add("A.pkg", 1000).unwrap();
    }
    let pkg_dir = cache_dir.join("pkg");
    std::fs::create_dir_all(&pkg_dir).unwrap();
    std::fs::write(pkg_dir.join("A.pkg"), vec![0x41u8; 500]).unwrap();

    let ctx = test_ctx(&cache_dir, &wanted_dir, vec![mock_server.base_url()], b"secret");
    let addr = spawn_server(ctx).await;

    let resp = reqwest::get(format!("http://{}/A.pkg", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let received = resp.bytes().await.unwrap();
    assert_eq!(received.len(), 1000);
    assert_eq!(&received[..500], &vec![0x41u8; 500][..]);
    assert_eq!(&received[500..], &tail[..]);

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(
        std::fs::metadata(pkg_dir.join("A.pkg")).unwrap().len(),
        1000
    );
}

#[tokio::test]
async fn range_on_cached_file_uses_200_with_content_range() {
    let cache_dir = unique_dir("s4-cache");
    let wanted_dir = unique_dir("s4-wanted");
    let body = vec![0x41u8; 1000];

    let mock_server = MockServer::start_async().await;
    mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg");
            then.status(200)
                .header("Content-Length", "1000")
                .body(body.clone());
        })
        .await;

    let ctx = test_ctx(&cache_dir, &wanted_dir, vec![mock_server.base_url()], b"secret");
    let addr = spawn_server(ctx).await;

    // Populate the cache first (scenario 1's precondition).
    let first = reqwest::get(format!("http://{}/A.pkg", addr)).await.unwrap();
    assert_eq!(first.status(), 200);
    let _ = first.bytes().await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/A.pkg", addr))
        .header("Range", "bytes=250-")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200, "range semantics use 200, not 206");
    let content_range = resp
        .headers()
        .get("Content-Range")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_range, "bytes 250-999/1000");
    assert_eq!(resp.content_length(), Some(750));

    let received = resp.bytes().await.unwrap();
    assert_eq!(received.len(), 750);
    assert_eq!(&received[..], &body[250..]);
}

#[tokio::test]
async fn database_file_redirects_to_first_mirror() {
    let cache_dir = unique_dir("s5-cache");
    let wanted_dir = unique_dir("s5-wanted");

    let mock_server = MockServer::start_async().await;
    let mirror_base = mock_server.base_url();

    let ctx = test_ctx(&cache_dir, &wanted_dir, vec![mirror_base.clone()], b"secret");
    let addr = spawn_server(ctx).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let resp = client
        .get(format!("http://{}/core.db", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 301);
    let location = resp.headers().get("Location").unwrap().to_str().unwrap();
    assert_eq!(location, format!("{}/core.db", mirror_base));
    assert_eq!(resp.content_length(), Some(0));
}

#[tokio::test]
async fn mirror_failover_falls_through_to_second_mirror() {
    let cache_dir = unique_dir("s6-cache");
    let wanted_dir = unique_dir("s6-wanted");
    let body = vec![0x41u8; 1000];

    let bad = MockServer::start_async().await;
    let bad_mock = bad
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg");
            then.status(500);
        })
        .await;

    let good = MockServer::start_async().await;
    let good_mock = good
        .mock_async(|when, then| {
            when.method(GET).path("/A.pkg");
            then.status(200)
                .header("Content-Length", "1000")
                .body(body.clone());
        })
        .await;

    let ctx = test_ctx(
        &cache_dir,
        &wanted_dir,
        vec![bad.base_url(), good.base_url()],
        b"secret",
    );
    let addr = spawn_server(ctx).await;

    let resp = reqwest::get(format!("http://{}/A.pkg", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let received = resp.bytes().await.unwrap();
    assert_eq!(&received[..], &body[..]);

    assert_eq!(bad_mock.hits_async().await, 1);
    assert_eq!(good_mock.hits_async().await, 1);
}

#[tokio::test]
async fn signed_post_writes_wanted_package_file() {
    let cache_dir = unique_dir("s7-cache");
    let wanted_dir = unique_dir("s7-wanted");
    let secret = b"shared-secret";

    let ctx = test_ctx(&cache_dir, &wanted_dir, Vec::new(), secret);
    let addr = spawn_server(ctx).await;

    let client = reqwest::Client::new();
    let body = b"hello".to_vec();
    let ts = now_unix();
    let tag = auth::compute_tag(secret, &body, ts);

    let resp = client
        .post(format!("http://{}/host1", addr))
        .header("Authorization", tag.clone())
        .header("Timestamp", ts.to_string())
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let written = std::fs::read(wanted_dir.join("host1")).unwrap();
    assert_eq!(written, body);

    let resp = client
        .post(format!("http://{}/host1", addr))
        .header("Authorization", tag.clone())
        .header("Timestamp", (ts - 120).to_string())
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403, "stale timestamp must be rejected");

    let mut flipped_tag = tag.clone();
    let first = flipped_tag.remove(0);
    flipped_tag.insert(0, if first == '0' { '1' } else { '0' });

    let resp = client
        .post(format!("http://{}/host1", addr))
        .header("Authorization", flipped_tag)
        .header("Timestamp", ts.to_string())
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403, "flipped HMAC byte must be rejected");
}
