//! End-to-end tests exercising CacheStorage and Cache together

use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;

use fetchcache::cache::Cache;
use fetchcache::quota::NoopQuota;
use fetchcache::{
    BatchOperation, BytesSource, CacheStorage, CacheStorageConfig, Error, FetchRequest,
    FetchResponse, Headers, PutOperation,
};

async fn put_body(cache: &Cache, url: &str, payload: &'static [u8]) {
    cache
        .put(
            FetchRequest::get(url),
            FetchResponse::ok(url, Headers::new()),
            Some(Box::new(BytesSource::new(Bytes::from_static(payload)))),
        )
        .await
        .unwrap();
}

async fn match_body(storage: &CacheStorage, name: &str, url: &str) -> Bytes {
    storage
        .match_cache(name, &FetchRequest::get(url))
        .await
        .unwrap()
        .body
        .unwrap()
        .read_to_end()
        .await
        .unwrap()
}

#[tokio::test]
async fn put_match_replace_scenario() {
    // Create cache "v1", put GET /a.txt with body "hello" -> match returns
    // status 200 and "hello"; re-put with "world" -> match returns "world"
    // and keys() still reports one entry.
    let storage = CacheStorage::in_memory("http://example.com");
    let cache = storage.open_cache("v1").await.unwrap();

    put_body(&cache, "http://example.com/a.txt", b"hello").await;

    let result = cache
        .match_request(&FetchRequest::get("http://example.com/a.txt"))
        .await
        .unwrap();
    assert_eq!(result.response.status, 200);
    let body = result.body.unwrap();
    assert_eq!(body.len(), 5);
    assert_eq!(body.read_to_end().await.unwrap().as_ref(), b"hello");

    put_body(&cache, "http://example.com/a.txt", b"world").await;

    let body = match_body(&storage, "v1", "http://example.com/a.txt").await;
    assert_eq!(body.as_ref(), b"world");

    let keys = cache.keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].url, "http://example.com/a.txt");
}

#[tokio::test]
async fn delete_cache_scenario() {
    // deleteCache("v1") on ["v1","v2"] -> enumerate returns ["v2"], and a
    // later openCache("v1") yields a brand-new empty cache.
    let storage = CacheStorage::in_memory("http://example.com");

    let v1 = storage.open_cache("v1").await.unwrap();
    storage.open_cache("v2").await.unwrap();
    put_body(&v1, "http://example.com/a", b"old contents").await;
    drop(v1);

    storage.delete_cache("v1").await.unwrap();
    assert_eq!(storage.enumerate_caches().await.unwrap(), vec!["v2"]);

    let fresh = storage.open_cache("v1").await.unwrap();
    assert!(fresh.keys().await.unwrap().is_empty());
    assert_eq!(
        storage.enumerate_caches().await.unwrap(),
        vec!["v2", "v1"]
    );
}

#[tokio::test]
async fn delete_then_match_not_found() {
    let storage = CacheStorage::in_memory("http://example.com");
    let cache = storage.open_cache("v1").await.unwrap();
    put_body(&cache, "http://example.com/r", b"payload").await;

    cache
        .batch(BatchOperation::Delete(FetchRequest::get(
            "http://example.com/r",
        )))
        .await
        .unwrap();

    assert_matches!(
        cache
            .match_request(&FetchRequest::get("http://example.com/r"))
            .await,
        Err(Error::NotFound)
    );
}

#[tokio::test]
async fn vary_enforcement_across_storage() {
    let storage = CacheStorage::in_memory("http://example.com");
    let cache = storage.open_cache("v1").await.unwrap();

    let mut stored = FetchRequest::get("http://example.com/page");
    stored.headers.insert("Accept-Language", "en");
    let mut response_headers = Headers::new();
    response_headers.insert("Vary", "Accept-Language");
    cache
        .put(
            stored,
            FetchResponse::ok("http://example.com/page", response_headers),
            Some(Box::new(BytesSource::new(Bytes::from_static(b"english")))),
        )
        .await
        .unwrap();

    let mut same = FetchRequest::get("http://example.com/page");
    same.headers.insert("Accept-Language", "en");
    assert!(storage.match_cache("v1", &same).await.is_ok());

    let mut other = FetchRequest::get("http://example.com/page");
    other.headers.insert("Accept-Language", "de");
    assert_matches!(
        storage.match_cache("v1", &other).await,
        Err(Error::NotFound)
    );
}

#[tokio::test]
async fn match_all_caches_latches_single_hit() {
    let storage = CacheStorage::in_memory("http://example.com");
    for name in ["a", "b", "c", "d"] {
        storage.open_cache(name).await.unwrap();
    }

    let c = storage.open_cache("c").await.unwrap();
    put_body(&c, "http://example.com/only-in-c", b"the one").await;

    let result = storage
        .match_all_caches(&FetchRequest::get("http://example.com/only-in-c"))
        .await
        .unwrap();
    assert_eq!(
        result.body.unwrap().read_to_end().await.unwrap().as_ref(),
        b"the one"
    );

    // Zero matches across all caches reports NotFound after every branch.
    assert_matches!(
        storage
            .match_all_caches(&FetchRequest::get("http://example.com/nowhere"))
            .await,
        Err(Error::NotFound)
    );
}

#[tokio::test]
async fn scheduler_fifo_observed_through_cache_ops() {
    // A put submitted before a match on the same cache must be visible to
    // that match, even when both are submitted back-to-back without awaiting
    // the first.
    let storage = CacheStorage::in_memory("http://example.com");
    let cache = storage.open_cache("v1").await.unwrap();

    let put = cache.put(
        FetchRequest::get("http://example.com/seq"),
        FetchResponse::ok("http://example.com/seq", Headers::new()),
        Some(Box::new(BytesSource::new(Bytes::from_static(b"first")))),
    );
    let get_request = FetchRequest::get("http://example.com/seq");
    let get = cache.match_request(&get_request);

    let (put_result, get_result) = futures::join!(put, get);
    put_result.unwrap();
    let result = get_result.unwrap();
    assert_eq!(
        result.body.unwrap().read_to_end().await.unwrap().as_ref(),
        b"first"
    );
}

#[tokio::test]
async fn index_round_trip_with_disk_backends() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheStorageConfig {
        origin: "http://example.com".to_string(),
        root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    {
        let storage = CacheStorage::new(config.clone(), Arc::new(NoopQuota));
        let v1 = storage.open_cache("v1").await.unwrap();
        put_body(&v1, "http://example.com/a.txt", b"hello disk").await;
        storage.open_cache("v2").await.unwrap();
        drop(v1);
        storage.close_all_caches().await.unwrap();
    }

    // Simulated restart: same root, fresh storage.
    let storage = CacheStorage::new(config, Arc::new(NoopQuota));
    assert_eq!(storage.enumerate_caches().await.unwrap(), vec!["v1", "v2"]);

    let body = match_body(&storage, "v1", "http://example.com/a.txt").await;
    assert_eq!(body.as_ref(), b"hello disk");
}

#[tokio::test]
async fn batch_of_puts_spans_multiple_urls() {
    let storage = CacheStorage::in_memory("http://example.com");
    let cache = storage.open_cache("v1").await.unwrap();

    let puts = (0..5)
        .map(|i| {
            let url = format!("http://example.com/{i}");
            PutOperation {
                request: FetchRequest::get(&url),
                response: FetchResponse::ok(&url, Headers::new()),
                body: Some(Box::new(BytesSource::new(Bytes::from(vec![i as u8; 16])))),
            }
        })
        .collect();
    cache.batch(BatchOperation::Puts(puts)).await.unwrap();

    let mut urls: Vec<String> = cache
        .keys()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.url)
        .collect();
    urls.sort();
    assert_eq!(urls.len(), 5);
    assert_eq!(urls[0], "http://example.com/0");
}

#[tokio::test]
async fn operations_queue_behind_lazy_init() {
    // Issue several operations before init completes; all must resolve in
    // submission order against a consistently initialized state.
    let dir = tempfile::tempdir().unwrap();
    let config = CacheStorageConfig {
        origin: "http://example.com".to_string(),
        root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    {
        let storage = CacheStorage::new(config.clone(), Arc::new(NoopQuota));
        storage.open_cache("pre-existing").await.unwrap();
        storage.close_all_caches().await.unwrap();
    }

    let storage = CacheStorage::new(config, Arc::new(NoopQuota));
    let (has, names, open) = futures::join!(
        storage.has_cache("pre-existing"),
        storage.enumerate_caches(),
        storage.open_cache("second"),
    );
    assert!(has.unwrap());
    assert_eq!(names.unwrap(), vec!["pre-existing"]);
    open.unwrap();
    assert_eq!(
        storage.enumerate_caches().await.unwrap(),
        vec!["pre-existing", "second"]
    );
}

#[tokio::test]
async fn distinct_caches_operate_concurrently() {
    let storage = CacheStorage::in_memory("http://example.com");
    let a = storage.open_cache("a").await.unwrap();
    let b = storage.open_cache("b").await.unwrap();

    let (ra, rb) = futures::join!(
        async {
            put_body(&a, "http://example.com/x", b"in a").await;
            a.keys().await
        },
        async {
            put_body(&b, "http://example.com/y", b"in b").await;
            b.keys().await
        },
    );
    assert_eq!(ra.unwrap().len(), 1);
    assert_eq!(rb.unwrap().len(), 1);
}
