//! Cache fill from upstream binary caches.
//!
//! [`CacheService::ensure`] returns the local path of an entry, downloading
//! it first if needed:
//!
//! 1. Hit: the canonical file exists, return it without taking any lock.
//! 2. Miss: take the fetch permit for the key (see [`super::guard`]) and
//!    re-check, so a request that queued behind a concurrent fetch of the same
//!    key is answered from the file that fetch published.
//! 3. Try each upstream in configured order.  The first success status wins;
//!    its body is streamed into a scratch file and renamed into place.  A
//!    non-success status moves on to the next upstream.  A transport error or
//!    a local write error stops the iteration and is returned as is.
//!
//! The whole iteration runs under a deadline.  Dropping the returned future
//! cancels the upstream request and removes the scratch file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::guard::FetchGuard;
use super::key::ContentHash;
use super::store::CacheStore;
use crate::metrics::{AttemptOutcome, Metrics, MetricsRegistry, UpstreamLabels};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure talking to an upstream (connect, timeout,
    /// truncated body).
    #[error("request to upstream {origin} failed")]
    Upstream {
        origin: String,
        #[source]
        source: reqwest::Error,
    },
    /// Failure staging or publishing a response from `origin`.
    #[error("failed to store response from upstream {origin}")]
    Io {
        origin: String,
        #[source]
        source: std::io::Error,
    },
    /// The local store could not be inspected.
    #[error("local store error")]
    Store(#[source] std::io::Error),
    #[error("fetch did not complete within {after:?}")]
    Deadline { after: Duration },
}

// ---------------------------------------------------------------------------
// CacheService
// ---------------------------------------------------------------------------

/// The cache engine: store layout, fetch guard and upstream client.
///
/// Constructed once at startup and shared by every request handler.
#[derive(Clone)]
pub struct CacheService {
    store: CacheStore,
    guard: FetchGuard,
    http_client: reqwest::Client,
    upstreams: Arc<[String]>,
    fetch_timeout: Duration,
    metrics: MetricsRegistry,
}

impl CacheService {
    pub fn new(
        store: CacheStore,
        upstreams: Vec<String>,
        http_client: reqwest::Client,
        fetch_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            guard: FetchGuard::new(),
            http_client,
            upstreams: upstreams.into(),
            fetch_timeout,
            metrics,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn guard(&self) -> &FetchGuard {
        &self.guard
    }

    /// Make sure `hash` is in the local store.
    ///
    /// Returns `Ok(Some(path))` when the entry is available, `Ok(None)` when
    /// no upstream has it.
    #[instrument(skip(self, hash), fields(key = %hash, category = %hash.category()))]
    pub async fn ensure(&self, hash: &ContentHash) -> Result<Option<PathBuf>, FetchError> {
        let path = self.store.locate(hash);
        let labels = Metrics::category(hash.category());

        if CacheStore::exists(&path).await.map_err(FetchError::Store)? {
            self.metrics.metrics.cache_hits.get_or_create(&labels).inc();
            return Ok(Some(path));
        }
        self.metrics.metrics.cache_misses.get_or_create(&labels).inc();

        let permit = self.guard.acquire(hash).await;

        if CacheStore::exists(&path).await.map_err(FetchError::Store)? {
            self.metrics.metrics.coalesced_waits.inc();
            debug!(
                waited_ms = permit.waited().as_millis() as u64,
                "entry published by a concurrent fetch"
            );
            return Ok(Some(path));
        }

        info!(
            waited_ms = permit.waited().as_millis() as u64,
            upstreams = self.upstreams.len(),
            "not cached locally, querying upstreams"
        );

        let started = Instant::now();
        let result = tokio::time::timeout(self.fetch_timeout, self.fetch(hash, &path))
            .await
            .unwrap_or(Err(FetchError::Deadline {
                after: self.fetch_timeout,
            }));
        self.metrics
            .metrics
            .fetch_duration_seconds
            .get_or_create(&labels)
            .observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(Some(_)) => {}
            Ok(None) => info!("no upstream has this entry"),
            Err(e) => {
                self.metrics.metrics.fetch_errors.get_or_create(&labels).inc();
                warn!(error = %e, "fetch aborted");
            }
        }

        drop(permit);
        result
    }

    /// Iterate the upstreams for `hash`, publishing the first success at
    /// `dest`.
    async fn fetch(&self, hash: &ContentHash, dest: &Path) -> Result<Option<PathBuf>, FetchError> {
        for origin in self.upstreams.iter() {
            let url = format!("{origin}/{}", hash.upstream_path());
            info!(%origin, %url, "querying upstream");

            let resp = match self.http_client.get(&url).send().await {
                Ok(resp) => resp,
                Err(source) => {
                    self.record_attempt(origin, AttemptOutcome::Error);
                    return Err(FetchError::Upstream {
                        origin: origin.clone(),
                        source,
                    });
                }
            };

            let status = resp.status();
            if !status.is_success() {
                debug!(%origin, %status, "upstream does not have entry");
                self.record_attempt(origin, AttemptOutcome::Miss);
                continue;
            }

            let bytes = match self.download(origin, resp, dest).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.record_attempt(origin, AttemptOutcome::Error);
                    return Err(e);
                }
            };

            self.record_attempt(origin, AttemptOutcome::Hit);
            self.metrics.metrics.fetched_bytes.inc_by(bytes);
            info!(%origin, bytes, path = %dest.display(), "stored upstream response");
            return Ok(Some(dest.to_path_buf()));
        }
        Ok(None)
    }

    /// Stream `resp` into a scratch file and publish it at `dest`.
    async fn download(
        &self,
        origin: &str,
        resp: reqwest::Response,
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let io_err = |source: std::io::Error| FetchError::Io {
            origin: origin.to_string(),
            source,
        };

        let mut scratch = self.store.scratch().await.map_err(io_err)?;
        debug!(scratch = %scratch.path().display(), "staging upstream response");

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| FetchError::Upstream {
                origin: origin.to_string(),
                source,
            })?;
            scratch.write_all(&chunk).await.map_err(io_err)?;
        }

        let written = scratch.written();
        scratch.publish(dest).await.map_err(io_err)?;
        Ok(written)
    }

    fn record_attempt(&self, origin: &str, outcome: AttemptOutcome) {
        self.metrics
            .metrics
            .upstream_attempts
            .get_or_create(&UpstreamLabels {
                origin: origin.to_string(),
                outcome,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Category;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NARINFO_HASH: &str = "0a1b2c3d4e5f6g7h8i9j0k1l2m3n4o5p";
    const NAR_FILE: &str = "1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz";

    fn narinfo(hash: &str) -> ContentHash {
        ContentHash::parse_narinfo(&format!("{hash}.narinfo")).unwrap()
    }

    fn service(root: &Path, upstreams: Vec<String>, fetch_timeout: Duration) -> CacheService {
        CacheService::new(
            CacheStore::open(root).unwrap(),
            upstreams,
            reqwest::Client::new(),
            fetch_timeout,
            MetricsRegistry::new(),
        )
    }

    fn scratch_is_empty(svc: &CacheService) -> bool {
        std::fs::read_dir(svc.store().scratch_dir()).unwrap().count() == 0
    }

    #[tokio::test]
    async fn miss_on_every_upstream_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&a)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&b)
            .await;

        let svc = service(tmp.path(), vec![a.uri(), b.uri()], Duration::from_secs(5));
        let key = narinfo(NARINFO_HASH);

        assert!(svc.ensure(&key).await.unwrap().is_none());
        assert!(!svc.store().locate(&key).exists());
        assert!(scratch_is_empty(&svc));
    }

    #[tokio::test]
    async fn no_upstreams_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), Vec::new(), Duration::from_secs(5));
        assert!(svc.ensure(&narinfo(NARINFO_HASH)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn falls_back_to_next_upstream_on_non_success() {
        let tmp = tempfile::tempdir().unwrap();
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{NARINFO_HASH}.narinfo")))
            .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
            .expect(1)
            .mount(&first)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{NARINFO_HASH}.narinfo")))
            .respond_with(ResponseTemplate::new(200).set_body_string("StorePath: /nix/store/b"))
            .expect(1)
            .mount(&second)
            .await;

        let svc = service(
            tmp.path(),
            vec![first.uri(), second.uri()],
            Duration::from_secs(5),
        );
        let key = narinfo(NARINFO_HASH);

        let local = svc.ensure(&key).await.unwrap().unwrap();
        assert_eq!(local, svc.store().locate(&key));
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "StorePath: /nix/store/b");
        assert!(scratch_is_empty(&svc));
    }

    #[tokio::test]
    async fn first_success_stops_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("from first"))
            .expect(1)
            .mount(&first)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("from second"))
            .expect(0)
            .mount(&second)
            .await;

        let svc = service(
            tmp.path(),
            vec![first.uri(), second.uri()],
            Duration::from_secs(5),
        );
        let local = svc.ensure(&narinfo(NARINFO_HASH)).await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(local).unwrap(), "from first");
    }

    #[tokio::test]
    async fn repeat_request_is_served_locally() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/nar/{NAR_FILE}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&upstream)
            .await;

        let svc = service(tmp.path(), vec![upstream.uri()], Duration::from_secs(5));
        let key = ContentHash::parse_nar(NAR_FILE).unwrap();

        let first = svc.ensure(&key).await.unwrap().unwrap();
        let second = svc.ensure(&key).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), vec![7u8; 4096]);
        assert!(first.starts_with(svc.store().category_dir(key.category())));
    }

    #[tokio::test]
    async fn transport_error_aborts_without_trying_later_upstreams() {
        let tmp = tempfile::tempdir().unwrap();
        // Bind and drop a listener to get a port nobody is serving.
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("unreachable"))
            .expect(0)
            .mount(&second)
            .await;

        let svc = service(
            tmp.path(),
            vec![dead.clone(), second.uri()],
            Duration::from_secs(5),
        );
        let key = narinfo(NARINFO_HASH);

        match svc.ensure(&key).await {
            Err(FetchError::Upstream { origin, .. }) => assert_eq!(origin, dead),
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert!(!svc.store().locate(&key).exists());
    }

    #[tokio::test]
    async fn publish_failure_aborts_without_trying_later_upstreams() {
        let tmp = tempfile::tempdir().unwrap();
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("StorePath: /nix/store/a"))
            .expect(1)
            .mount(&first)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("StorePath: /nix/store/b"))
            .expect(0)
            .mount(&second)
            .await;

        let svc = service(
            tmp.path(),
            vec![first.uri(), second.uri()],
            Duration::from_secs(5),
        );
        // The rename into the category directory has nowhere to land.
        std::fs::remove_dir(svc.store().category_dir(Category::Narinfo)).unwrap();
        let key = narinfo(NARINFO_HASH);

        match svc.ensure(&key).await {
            Err(FetchError::Io { origin, .. }) => assert_eq!(origin, first.uri()),
            other => panic!("expected io error, got {other:?}"),
        }
        assert!(scratch_is_empty(&svc));
    }

    #[tokio::test]
    async fn truncated_body_aborts_and_cleans_scratch() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let tmp = tempfile::tempdir().unwrap();
        // Promise more bytes than are sent, then hang up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let short = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf).await;
            conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4096\r\n\r\npartial")
                .await
                .unwrap();
            conn.shutdown().await.unwrap();
        });
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("complete"))
            .expect(0)
            .mount(&second)
            .await;

        let svc = service(
            tmp.path(),
            vec![short.clone(), second.uri()],
            Duration::from_secs(5),
        );
        let key = ContentHash::parse_nar(NAR_FILE).unwrap();

        match svc.ensure(&key).await {
            Err(FetchError::Upstream { origin, .. }) => assert_eq!(origin, short),
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert!(!svc.store().locate(&key).exists());
        assert!(scratch_is_empty(&svc));
    }

    #[tokio::test]
    async fn deadline_aborts_slow_upstream_and_cleans_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&upstream)
            .await;

        let svc = service(tmp.path(), vec![upstream.uri()], Duration::from_millis(200));
        let key = narinfo(NARINFO_HASH);

        let err = svc.ensure(&key).await.unwrap_err();
        assert!(matches!(err, FetchError::Deadline { .. }));
        assert!(!svc.store().locate(&key).exists());
        assert!(scratch_is_empty(&svc));
        assert_eq!(svc.guard().inflight_keys(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_upstream_call() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{NARINFO_HASH}.narinfo")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("StorePath: /nix/store/shared")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let svc = service(tmp.path(), vec![upstream.uri()], Duration::from_secs(5));
        let key = narinfo(NARINFO_HASH);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                let key = key.clone();
                tokio::spawn(async move { svc.ensure(&key).await })
            })
            .collect();

        for task in tasks {
            let local = task.await.unwrap().unwrap().unwrap();
            assert_eq!(
                std::fs::read_to_string(local).unwrap(),
                "StorePath: /nix/store/shared"
            );
        }
        let published = std::fs::read_dir(svc.store().category_dir(key.category())).unwrap();
        assert_eq!(published.count(), 1);
        assert!(scratch_is_empty(&svc));
    }

    #[tokio::test]
    async fn unrelated_keys_fetch_concurrently() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .set_delay(Duration::from_millis(400)),
            )
            .expect(2)
            .mount(&upstream)
            .await;

        let svc = service(tmp.path(), vec![upstream.uri()], Duration::from_secs(5));
        let a = narinfo(&"a".repeat(32));
        let b = narinfo(&"b".repeat(32));

        let started = Instant::now();
        let (ra, rb) = tokio::join!(svc.ensure(&a), svc.ensure(&b));
        assert!(ra.unwrap().is_some());
        assert!(rb.unwrap().is_some());
        assert!(started.elapsed() < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn freeze_holds_fetches_until_released() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("after thaw"))
            .mount(&upstream)
            .await;

        let svc = service(tmp.path(), vec![upstream.uri()], Duration::from_secs(5));
        let key = narinfo(NARINFO_HASH);

        let frozen = svc.guard().freeze().await;
        let task = {
            let svc = svc.clone();
            let key = key.clone();
            tokio::spawn(async move { svc.ensure(&key).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        assert!(!svc.store().locate(&key).exists());

        drop(frozen);
        let local = task.await.unwrap().unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(local).unwrap(), "after thaw");
    }

    #[tokio::test]
    async fn hit_path_ignores_freeze() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), Vec::new(), Duration::from_secs(5));
        let key = narinfo(NARINFO_HASH);
        std::fs::write(svc.store().locate(&key), b"cached").unwrap();

        let _frozen = svc.guard().freeze().await;
        let local = tokio::time::timeout(Duration::from_millis(200), svc.ensure(&key))
            .await
            .expect("hit must not wait on the gate")
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"cached");
    }
}
