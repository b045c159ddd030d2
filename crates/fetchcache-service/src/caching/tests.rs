use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::{CacheConfig, Config};
use crate::fetcher::{FetchRequest, Fetcher};
use crate::test::TestFetcher;

use super::*;

fn config(cache_dir: Option<&Path>) -> Config {
    Config {
        cache_dir: cache_dir.map(Path::to_path_buf),
        ..Default::default()
    }
}

fn with_default(mut config: Config, cache_config: CacheConfig) -> Config {
    config.caches.default = cache_config;
    config
}

/// Records the callbacks invoked for each named caller, in order.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn callbacks(&self, name: &'static str) -> Callbacks {
        let complete = Arc::clone(&self.0);
        let failure = Arc::clone(&self.0);
        let retry = Arc::clone(&self.0);
        Callbacks::new()
            .on_complete(move |data| {
                let data = String::from_utf8_lossy(&data).into_owned();
                complete.lock().unwrap().push(format!("{name}: ok {data}"));
            })
            .on_failure(move |err, fatal| {
                failure
                    .lock()
                    .unwrap()
                    .push(format!("{name}: failed {err} fatal={fatal}"));
            })
            .on_retry(move |err| {
                retry.lock().unwrap().push(format!("{name}: retry {err}"));
            })
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[test]
fn test_cache_dir_created() {
    let basedir = fetchcache_test::tempdir();
    let cachedir = basedir.path().join("cache");

    let caches = Caches::from_config(&config(Some(&cachedir)), TestFetcher::new()).unwrap();
    assert!(fs::metadata(&cachedir).unwrap().is_dir());

    caches.default_cache().unwrap();
    assert!(cachedir.join("default").is_dir());
    assert!(cachedir.join("default").join("tmp").is_dir());
}

#[test]
fn test_stale_tmp_files_cleared() {
    let basedir = fetchcache_test::tempdir();
    let tmpdir = basedir.path().join("default").join("tmp");
    fs::create_dir_all(&tmpdir).unwrap();
    fs::write(tmpdir.join("tmpleftover"), b"partial").unwrap();

    let caches = Caches::from_config(&config(Some(basedir.path())), TestFetcher::new()).unwrap();
    caches.default_cache().unwrap();

    assert!(tmpdir.is_dir());
    assert!(!tmpdir.join("tmpleftover").exists());
}

#[tokio::test]
async fn test_concurrent_requests_are_coalesced() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let url = "https://example.com/a.png";
    fetcher.gate(url);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cacher = cacher.clone();
            tokio::spawn(async move {
                cacher
                    .get_or_fetch(FetchRequest::new(url), Queue::Fast)
                    .await
            })
        })
        .collect();

    fetchcache_test::wait_until(|| fetcher.calls(url) == 1).await;
    fetcher.open(url);

    for handle in handles {
        let data = handle.await.unwrap().unwrap();
        assert_eq!(data, Bytes::from(format!("content of {url}")));
    }
    assert_eq!(fetcher.calls(url), 1);
    assert_eq!(cacher.task_count(), 0);

    // served from the cache from now on
    let data = cacher.get_or_fetch(FetchRequest::new(url), Queue::Slow).await.unwrap();
    assert_eq!(data, Bytes::from(format!("content of {url}")));
    assert_eq!(fetcher.calls(url), 1);
}

#[tokio::test]
async fn test_pending_slow_task_is_promoted() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    // occupy the slow lane
    fetcher.gate("blocker");
    let blocker = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("blocker")).await }
    });
    fetchcache_test::wait_until(|| fetcher.calls("blocker") == 1).await;

    let slow = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("target")).await }
    });
    fetchcache_test::wait_until(|| cacher.task_count() == 2).await;
    assert_eq!(fetcher.calls("target"), 0);

    let fast = cacher
        .get_or_fetch(FetchRequest::new("target"), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&fast[..], b"content of target");
    assert_eq!(&slow.await.unwrap().unwrap()[..], b"content of target");
    assert_eq!(fetcher.calls("target"), 1);

    // the slow lane is still busy with the blocker
    assert_eq!(fetcher.calls("blocker"), 1);
    assert!(!blocker.is_finished());

    fetcher.open("blocker");
    assert_eq!(&blocker.await.unwrap().unwrap()[..], b"content of blocker");
}

#[tokio::test]
async fn test_move_to_fast_queue() {
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    let key = CacheKey::new("target").unwrap();

    assert!(!cacher.move_to_fast_queue(&key));

    fetcher.gate("blocker");
    let blocker = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("blocker")).await }
    });
    fetchcache_test::wait_until(|| fetcher.calls("blocker") == 1).await;

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("target"), Queue::Slow, recorder.callbacks("a"));
    assert_eq!(fetcher.calls("target"), 0);

    assert!(cacher.move_to_fast_queue(&key));
    fetchcache_test::wait_until(|| recorder.events().len() == 1).await;
    assert_eq!(recorder.events(), vec!["a: ok content of target".to_owned()]);
    assert!(!cacher.move_to_fast_queue(&key));

    fetcher.open("blocker");
    blocker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_move_to_slow_queue() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let mut config = config(None);
    config.queues.fast_concurrency = std::num::NonZeroUsize::new(1);
    let caches = Caches::from_config(&config, fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    let key = CacheKey::new("target").unwrap();

    assert!(!cacher.move_to_slow_queue(&key));

    // occupy the only slot of the fast lane
    fetcher.gate("blocker");
    let blocker = tokio::spawn({
        let cacher = cacher.clone();
        async move {
            cacher
                .get_or_fetch(FetchRequest::new("blocker"), Queue::Fast)
                .await
        }
    });
    fetchcache_test::wait_until(|| fetcher.calls("blocker") == 1).await;
    assert!(!cacher.move_to_slow_queue(&CacheKey::new("blocker").unwrap()));

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("target"), Queue::Fast, recorder.callbacks("a"));
    assert_eq!(fetcher.calls("target"), 0);

    // the idle slow lane picks it up right away
    assert!(cacher.move_to_slow_queue(&key));
    fetchcache_test::wait_until(|| recorder.events().len() == 1).await;
    assert_eq!(recorder.events(), vec!["a: ok content of target".to_owned()]);
    assert!(!cacher.move_to_slow_queue(&key));
    assert!(!blocker.is_finished());

    fetcher.open("blocker");
    blocker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_running_slow_task_is_not_migrated() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    let key = CacheKey::new("target").unwrap();

    fetcher.gate("target");
    let slow = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("target")).await }
    });
    fetchcache_test::wait_until(|| fetcher.calls("target") == 1).await;

    assert!(!cacher.move_to_fast_queue(&key));

    let fast = tokio::spawn({
        let cacher = cacher.clone();
        async move {
            cacher
                .get_or_fetch(FetchRequest::new("target"), Queue::Fast)
                .await
        }
    });
    tokio::task::yield_now().await;
    assert_eq!(cacher.task_count(), 1);

    fetcher.open("target");
    assert_eq!(&slow.await.unwrap().unwrap()[..], b"content of target");
    assert_eq!(&fast.await.unwrap().unwrap()[..], b"content of target");
    assert_eq!(fetcher.calls("target"), 1);
}

#[tokio::test]
async fn test_expired_entries() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let key = CacheKey::new("old").unwrap();
    let past = SystemTime::now() - Duration::from_secs(1);
    cacher
        .add_raw_with(Bytes::from_static(b"old"), &key, Default::default(), Some(past))
        .await
        .unwrap();

    let path = basedir.path().join("default").join(key.cache_path());
    assert!(!cacher.have(&key));
    assert_eq!(cacher.cached(&key).await, None);
    assert!(path.is_file());

    cacher.flush_older_than(Duration::from_secs(3600));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_size_eviction() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let config = with_default(
        config(Some(basedir.path())),
        CacheConfig {
            max_disk_size_mb: 1,
            ..Default::default()
        },
    );
    let caches = Caches::from_config(&config, TestFetcher::new()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let keys: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|k| CacheKey::new(k).unwrap())
        .collect();
    for key in &keys {
        cacher
            .add_raw(Bytes::from(vec![0u8; 400 * 1024]), key)
            .await
            .unwrap();
    }

    assert!(!cacher.have(&keys[0]));
    assert!(cacher.have(&keys[1]));
    assert!(cacher.have(&keys[2]));

    let disk = cacher.disk().unwrap();
    assert!(disk.total_size() <= 1024 * 1024);
    assert!(!basedir.path().join("default").join(keys[0].cache_path()).exists());
}

#[tokio::test]
async fn test_add_raw_round_trip() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let fetcher = TestFetcher::new();
    let key = CacheKey::new("avatar-1").unwrap();
    {
        let caches =
            Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
        let cacher = caches.default_cache().unwrap();

        cacher
            .add_raw(Bytes::from_static(b"\x89PNG"), &key)
            .await
            .unwrap();
        assert!(cacher.have(&key));

        let data = cacher
            .get_or_fetch(FetchRequest::for_key("avatar-1"), Queue::Fast)
            .await
            .unwrap();
        assert_eq!(&data[..], b"\x89PNG");
    }

    // a fresh process only has the disk tier
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    assert!(cacher.have(&key));
    assert_eq!(cacher.cached(&key).await.as_deref(), Some(&b"\x89PNG"[..]));
    assert_eq!(fetcher.total_calls(), 0);

    let missing = cacher
        .get_or_fetch(FetchRequest::for_key("avatar-2"), Queue::Fast)
        .await;
    assert_eq!(missing, Err(CacheError::NotFound));
}

#[tokio::test]
async fn test_fatal_errors_are_not_retried() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let config = with_default(
        config(None),
        CacheConfig {
            max_attempts: 3,
            ..Default::default()
        },
    );
    let caches = Caches::from_config(&config, fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    fetcher.respond("url", Err(CacheError::PermissionDenied("403".into())));
    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("url"), Queue::Fast, recorder.callbacks("a"));

    fetchcache_test::wait_until(|| !recorder.events().is_empty()).await;
    assert_eq!(
        recorder.events(),
        vec!["a: failed permission denied: 403 fatal=true".to_owned()]
    );
    assert_eq!(fetcher.calls("url"), 1);
    assert_eq!(cacher.task_count(), 0);
}

#[tokio::test]
async fn test_transient_errors_invoke_retry_callbacks() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    fetcher.gate("url");
    fetcher.respond("url", Err(CacheError::DownloadError("503".into())));

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("url"), Queue::Fast, recorder.callbacks("a"));
    cacher.get_or_fetch_with(FetchRequest::new("url"), Queue::Slow, recorder.callbacks("b"));
    fetchcache_test::wait_until(|| fetcher.calls("url") == 1).await;
    fetcher.open("url");

    fetchcache_test::wait_until(|| recorder.events().len() == 4).await;
    assert_eq!(
        recorder.events(),
        vec![
            "a: retry download failed: 503".to_owned(),
            "b: retry download failed: 503".to_owned(),
            "a: failed download failed: 503 fatal=false".to_owned(),
            "b: failed download failed: 503 fatal=false".to_owned(),
        ]
    );
    assert_eq!(fetcher.calls("url"), 1);

    // nothing was cached, the next request fetches again
    let data = cacher
        .get_or_fetch(FetchRequest::new("url"), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&data[..], b"content of url");
    assert_eq!(fetcher.calls("url"), 2);
}

#[tokio::test]
async fn test_bounded_retries() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let config = with_default(
        config(None),
        CacheConfig {
            max_attempts: 3,
            ..Default::default()
        },
    );
    let caches = Caches::from_config(&config, fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    fetcher.respond("flaky", Err(CacheError::DownloadError("503".into())));
    fetcher.respond("flaky", Err(CacheError::Timeout(Duration::from_secs(1))));
    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("flaky"), Queue::Fast, recorder.callbacks("a"));

    fetchcache_test::wait_until(|| recorder.events().len() == 3).await;
    assert_eq!(
        recorder.events(),
        vec![
            "a: retry download failed: 503".to_owned(),
            "a: retry download timed out after 1s".to_owned(),
            "a: ok content of flaky".to_owned(),
        ]
    );
    assert_eq!(fetcher.calls("flaky"), 3);

    for _ in 0..3 {
        fetcher.respond("down", Err(CacheError::DownloadError("502".into())));
    }
    let result = cacher
        .get_or_fetch(FetchRequest::new("down"), Queue::Fast)
        .await;
    assert_eq!(result, Err(CacheError::DownloadError("502".into())));
    assert_eq!(fetcher.calls("down"), 3);
}

#[tokio::test]
async fn test_secondary_attributes() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), TestFetcher::new()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let key = CacheKey::new("profile").unwrap();
    let attrs = SecondaryAttrs::from([("user".to_owned(), "A".to_owned())]);
    cacher
        .add_raw_with(Bytes::from_static(b"secret"), &key, attrs, None)
        .await
        .unwrap();

    let as_b = FetchRequest::for_key("profile").with_secondary("user", "B");
    assert_eq!(
        cacher.get_or_fetch(as_b, Queue::Fast).await,
        Err(CacheError::NotFound)
    );

    let as_a = FetchRequest::for_key("profile").with_secondary("user", "A");
    let data = cacher.get_or_fetch(as_a, Queue::Fast).await.unwrap();
    assert_eq!(&data[..], b"secret");

    let disk = cacher.disk().unwrap();
    assert_eq!(disk.secondary_value(&key, "user").as_deref(), Some("A"));
}

#[tokio::test]
async fn test_fetched_resources_carry_secondary_attributes() {
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let request = FetchRequest::new("https://example.com/me")
        .with_cache_key("me")
        .with_secondary("user", "A");
    cacher.get_or_fetch(request, Queue::Fast).await.unwrap();

    let key = CacheKey::new("me").unwrap();
    let disk = cacher.disk().unwrap();
    assert!(disk.has(&key, &SecondaryAttrs::from([("user".to_owned(), "A".to_owned())])));
    assert!(!disk.has(&key, &SecondaryAttrs::from([("user".to_owned(), "B".to_owned())])));
}

#[tokio::test]
async fn test_cancel_pending_task() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    fetcher.gate("blocker");
    let blocker = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("blocker")).await }
    });
    fetchcache_test::wait_until(|| fetcher.calls("blocker") == 1).await;

    let waiting = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("target")).await }
    });
    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new("other"), Queue::Slow, recorder.callbacks("a"));
    fetchcache_test::wait_until(|| cacher.task_count() == 3).await;

    assert!(cacher.cancel(&CacheKey::new("target").unwrap()));
    assert!(cacher.cancel(&CacheKey::new("other").unwrap()));
    assert_eq!(waiting.await.unwrap(), Err(CacheError::Cancelled));

    // running tasks can not be cancelled
    assert!(!cacher.cancel(&CacheKey::new("blocker").unwrap()));

    fetcher.open("blocker");
    blocker.await.unwrap().unwrap();
    assert_eq!(fetcher.calls("target"), 0);
    assert_eq!(fetcher.calls("other"), 0);
    assert!(recorder.events().is_empty());
    assert_eq!(cacher.task_count(), 0);
}

#[tokio::test]
async fn test_key_only_requests_never_start_a_fetch() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    fetcher.gate("blocker");
    let blocker = tokio::spawn({
        let cacher = cacher.clone();
        async move { cacher.slow_get_or_fetch(FetchRequest::new("blocker")).await }
    });
    fetchcache_test::wait_until(|| fetcher.calls("blocker") == 1).await;

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::for_key("k"), Queue::Slow, recorder.callbacks("a"));
    fetchcache_test::wait_until(|| recorder.events().len() == 1).await;
    assert_eq!(recorder.events(), vec!["a: failed not found fatal=true".to_owned()]);
    assert_eq!(
        cacher.get_remote(FetchRequest::for_key("k"), Queue::Slow).await,
        Err(CacheError::NotFound)
    );
    assert_eq!(cacher.task_count(), 1);

    let url = "https://example.com/a";
    let request = FetchRequest::new(url).with_cache_key("k");
    let data = cacher.get_or_fetch(request, Queue::Fast).await.unwrap();
    assert_eq!(data, Bytes::from(format!("content of {url}")));
    assert_eq!(fetcher.calls(url), 1);

    fetcher.open("blocker");
    blocker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_key_only_requests_wait_for_running_fetch() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let url = "https://example.com/a";
    fetcher.gate(url);
    let fetching = tokio::spawn({
        let cacher = cacher.clone();
        async move {
            cacher
                .get_or_fetch(FetchRequest::new(url).with_cache_key("k"), Queue::Fast)
                .await
        }
    });
    fetchcache_test::wait_until(|| fetcher.calls(url) == 1).await;

    let waiting = tokio::spawn({
        let cacher = cacher.clone();
        async move {
            cacher
                .get_or_fetch(FetchRequest::for_key("k"), Queue::Slow)
                .await
        }
    });
    tokio::task::yield_now().await;
    assert!(!waiting.is_finished());

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::for_key("k"), Queue::Slow, recorder.callbacks("a"));
    tokio::task::yield_now().await;
    assert!(recorder.events().is_empty());

    fetcher.open(url);
    let expected = Bytes::from(format!("content of {url}"));
    assert_eq!(fetching.await.unwrap().unwrap(), expected);
    assert_eq!(waiting.await.unwrap().unwrap(), expected);
    fetchcache_test::wait_until(|| recorder.events().len() == 1).await;
    assert_eq!(recorder.events(), vec![format!("a: ok content of {url}")]);
    assert_eq!(fetcher.calls(url), 1);
}

#[tokio::test]
async fn test_invalid_requests() {
    let caches = Caches::from_config(&config(None), TestFetcher::new()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let result = cacher.get_or_fetch(FetchRequest::new(""), Queue::Fast).await;
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    let recorder = Recorder::default();
    cacher.get_or_fetch_with(FetchRequest::new(""), Queue::Fast, recorder.callbacks("a"));
    assert_eq!(
        recorder.events(),
        vec!["a: failed invalid argument: request has neither url nor cache key fatal=true".to_owned()]
    );
}

#[tokio::test]
async fn test_request_headers_are_part_of_the_key() {
    let fetcher = TestFetcher::new();
    let caches = Caches::from_config(&config(None), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    let url = "https://example.com/private.png";

    for token in ["A", "B", "A"] {
        let request = FetchRequest::new(url).with_header("Authorization", token);
        cacher.get_or_fetch(request, Queue::Fast).await.unwrap();
    }
    assert_eq!(fetcher.calls(url), 2);

    // header names are case insensitive
    let request = FetchRequest::new(url).with_header("authorization", "B");
    cacher.get_or_fetch(request, Queue::Fast).await.unwrap();
    assert_eq!(fetcher.calls(url), 2);
}

#[tokio::test]
async fn test_get_remote_skips_the_tiers() {
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();
    let url = "https://example.com/feed.json";
    let key = CacheKey::for_url(url, &Default::default()).unwrap();

    cacher
        .add_raw(Bytes::from_static(b"stale"), &key)
        .await
        .unwrap();
    let data = cacher
        .get_remote(FetchRequest::new(url), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&data[..], b"content of https://example.com/feed.json");
    assert_eq!(fetcher.calls(url), 1);

    // the fresh resource replaced the stale one
    let data = cacher
        .get_or_fetch(FetchRequest::new(url), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&data[..], b"content of https://example.com/feed.json");
    assert_eq!(fetcher.calls(url), 1);
}

#[tokio::test]
async fn test_disk_write_errors_are_swallowed() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let cacher = caches.default_cache().unwrap();

    // replace the instance directory with a file, so nothing can be written below it
    let instance_dir = basedir.path().join("default");
    fs::remove_dir_all(&instance_dir).unwrap();
    fs::write(&instance_dir, b"in the way").unwrap();

    let data = cacher
        .get_or_fetch(FetchRequest::new("url"), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&data[..], b"content of url");

    // still served from memory
    let data = cacher
        .get_or_fetch(FetchRequest::new("url"), Queue::Fast)
        .await
        .unwrap();
    assert_eq!(&data[..], b"content of url");
    assert_eq!(fetcher.calls("url"), 1);
    assert!(cacher.disk().unwrap().is_empty());
}

struct Panicking;

impl Fetcher for Panicking {
    fn fetch<'a>(&'a self, _request: &'a FetchRequest) -> BoxFuture<'a, Result<Bytes, CacheError>> {
        Box::pin(async { panic!("the transport broke") })
    }
}

#[tokio::test]
async fn test_panicking_fetch_fails_waiters() {
    let caches = Caches::from_config(&config(None), Arc::new(Panicking)).unwrap();
    let cacher = caches.default_cache().unwrap();

    let result = cacher.get_or_fetch(FetchRequest::new("url"), Queue::Fast).await;
    assert_eq!(result, Err(CacheError::InternalError));
    assert_eq!(cacher.task_count(), 0);
}

struct Number;

impl Decode for Number {
    type Item = u64;
    type Error = std::num::ParseIntError;

    fn decode(&self, data: Bytes) -> Result<u64, Self::Error> {
        std::str::from_utf8(&data).unwrap_or_default().trim().parse()
    }
}

#[tokio::test]
async fn test_decode_failures_drop_the_raw_entry() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let numbers = caches.decoded("numbers", Number).unwrap();
    let key = CacheKey::new("answer").unwrap();

    fetcher.respond("answer", Ok(Bytes::from_static(b"forty-two")));
    let result = numbers
        .get_or_fetch(FetchRequest::new("answer"), Queue::Fast)
        .await;
    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert!(!numbers.cacher().have(&key));

    fetcher.respond("answer", Ok(Bytes::from_static(b"42")));
    for _ in 0..2 {
        let answer = numbers
            .get_or_fetch(FetchRequest::new("answer"), Queue::Fast)
            .await
            .unwrap();
        assert_eq!(answer, 42);
    }
    assert_eq!(fetcher.calls("answer"), 2);
    assert!(numbers.cacher().have(&key));
}

#[tokio::test]
async fn test_decoded_items_respect_secondary_attributes() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let numbers = caches.decoded("numbers", Number).unwrap();

    let url = "https://example.com/count";
    fetcher.respond(url, Ok(Bytes::from_static(b"1")));
    fetcher.respond(url, Ok(Bytes::from_static(b"2")));
    let request = FetchRequest::new(url).with_cache_key("count");

    let as_a = request.clone().with_secondary("user", "A");
    assert_eq!(numbers.get_or_fetch(as_a.clone(), Queue::Fast).await, Ok(1));
    assert_eq!(numbers.get_or_fetch(as_a, Queue::Fast).await, Ok(1));
    assert_eq!(fetcher.calls(url), 1);

    let as_b = request.with_secondary("user", "B");
    assert_eq!(numbers.get_or_fetch(as_b.clone(), Queue::Fast).await, Ok(2));
    assert_eq!(numbers.get_or_fetch(as_b, Queue::Fast).await, Ok(2));
    assert_eq!(fetcher.calls(url), 2);
}

#[tokio::test]
async fn test_decoded_items_follow_their_raw_entry() {
    fetchcache_test::setup();
    let fetcher = TestFetcher::new();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), fetcher.clone()).unwrap();
    let numbers = caches.decoded("numbers", Number).unwrap();
    let key = CacheKey::new("answer").unwrap();

    fetcher.respond("answer", Ok(Bytes::from_static(b"42")));
    fetcher.respond("answer", Ok(Bytes::from_static(b"43")));
    fetcher.respond("answer", Ok(Bytes::from_static(b"44")));

    let request = FetchRequest::new("answer");
    assert_eq!(numbers.get_or_fetch(request.clone(), Queue::Fast).await, Ok(42));

    numbers.cacher().remove(&key);
    assert!(!numbers.cacher().have(&key));
    assert_eq!(numbers.get_or_fetch(request, Queue::Fast).await, Ok(43));
    assert_eq!(fetcher.calls("answer"), 2);

    let expiring = FetchRequest::new("answer")
        .with_expiry(SystemTime::now() + Duration::from_millis(200));
    numbers.cacher().remove(&key);
    assert_eq!(numbers.get_or_fetch(expiring.clone(), Queue::Fast).await, Ok(44));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!numbers.cacher().have(&key));

    let result = numbers.get_or_fetch(expiring, Queue::Fast).await;
    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert_eq!(fetcher.calls("answer"), 4);
}

#[tokio::test]
async fn test_named_instances_are_isolated() {
    let basedir = fetchcache_test::tempdir();
    let mut config = config(Some(basedir.path()));
    config.caches.named.insert(
        "thumbnails".to_owned(),
        CacheConfig {
            max_disk_size_mb: 0,
            max_age: None,
            ..Default::default()
        },
    );
    let caches = Caches::from_config(&config, TestFetcher::new()).unwrap();

    let thumbnails = caches.get("thumbnails").unwrap();
    let avatars = caches.get("avatars").unwrap();
    let key = CacheKey::new("shared-key").unwrap();

    thumbnails
        .add_raw(Bytes::from_static(b"thumb"), &key)
        .await
        .unwrap();
    assert!(thumbnails.have(&key));
    assert!(!avatars.have(&key));
    assert!(caches.get("thumbnails").unwrap().have(&key));

    assert_eq!(thumbnails.disk().unwrap().config().max_age, None);
    assert_eq!(
        avatars.disk().unwrap().config(),
        &CacheConfig::default()
    );
    assert!(basedir.path().join("thumbnails").join("index.json").is_file());
    assert!(basedir.path().join("avatars").is_dir());

    assert!(matches!(
        caches.get("../escape"),
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(caches.get(""), Err(CacheError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_cleanup_all_instances() {
    fetchcache_test::setup();
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), TestFetcher::new()).unwrap();
    let past = SystemTime::now() - Duration::from_secs(1);

    let mut paths = vec![];
    for name in ["one", "two"] {
        let cacher = caches.get(name).unwrap();
        let key = CacheKey::new("gone").unwrap();
        cacher
            .add_raw_with(Bytes::from_static(b"x"), &key, Default::default(), Some(past))
            .await
            .unwrap();
        paths.push(basedir.path().join(name).join(key.cache_path()));
    }
    assert!(paths.iter().all(|p| p.is_file()));

    let names = caches.known_names().unwrap();
    assert_eq!(names, vec!["default", "one", "two"]);

    caches.cleanup().unwrap();
    assert!(paths.iter().all(|p| !p.exists()));
}

#[tokio::test]
async fn test_remove_and_remove_all_except() {
    let basedir = fetchcache_test::tempdir();
    let caches = Caches::from_config(&config(Some(basedir.path())), TestFetcher::new()).unwrap();
    let cacher = caches.default_cache().unwrap();

    let keys: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|k| CacheKey::new(k).unwrap())
        .collect();
    for key in &keys {
        cacher.add_raw(Bytes::from_static(b"x"), key).await.unwrap();
    }

    cacher.remove(&keys[0]);
    assert!(!cacher.have(&keys[0]));

    cacher.remove_all_except(&keys[2..]);
    assert!(!cacher.have(&keys[1]));
    assert!(cacher.have(&keys[2]));
    assert_eq!(cacher.disk().unwrap().len(), 1);
}
