// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::config::DiscoverySettings;
use crate::discovery::AddressRecord;
use crate::discovery::protocol::{
    DEREGISTER_PATH, DeregisterResponse, HEALTH_PATH, INSTANCES_PATH, InstancesResponse,
    JSON_CONTENT_TYPE, NameRequest, REGISTER_PATH, RESOLVE_PATH, RegisterRequest,
};
use crate::endpoint::Endpoint;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("discovery service at {socket} unavailable after {attempts} attempt(s): {last_error}")]
    ServiceUnavailable {
        socket: PathBuf,
        attempts: u32,
        last_error: String,
    },
    #[error("no instance registered as {0:?}")]
    UnknownService(String),
    #[error("discovery request cancelled")]
    Cancelled,
    #[error("unexpected discovery response: {0}")]
    Protocol(String),
}

/// Exponential backoff between attempts, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no backoff.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct CachedEndpoint {
    endpoint: Endpoint,
    fetched_at: Instant,
}

/// Client side of the discovery service. Clones share the resolution cache.
#[derive(Clone)]
pub struct DiscoveryClient {
    socket: PathBuf,
    retry: RetryPolicy,
    request_timeout: Duration,
    ttl: Duration,
    cache: Option<Arc<Mutex<LruCache<String, CachedEndpoint>>>>,
    cancel: Option<CancellationToken>,
}

/// Outcome of a single round trip.
enum Attempt {
    Done(StatusCode, Bytes),
    Transient(String),
}

impl DiscoveryClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self::from_settings(&DiscoverySettings {
            socket: socket.into(),
            ..DiscoverySettings::default()
        })
    }

    pub fn from_settings(settings: &DiscoverySettings) -> Self {
        let retry = RetryPolicy {
            attempts: settings.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.retry_max_backoff_ms),
        };
        Self {
            socket: settings.socket.clone(),
            retry,
            request_timeout: settings.request_timeout(),
            ttl: settings.cache_ttl(),
            cache: None,
            cancel: None,
        }
        .with_cache(settings.cache_capacity, settings.cache_ttl())
    }

    /// A zero capacity or TTL disables caching.
    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.ttl = ttl;
        self.cache = NonZeroUsize::new(capacity)
            .filter(|_| !ttl.is_zero())
            .map(|cap| Arc::new(Mutex::new(LruCache::new(cap))));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Abort pending calls and retries once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Publish `name` at `endpoint`, replacing any previous record.
    pub async fn announce(
        &self,
        name: &str,
        endpoint: &Endpoint,
    ) -> Result<AddressRecord, DiscoveryError> {
        self.invalidate(name);
        let request = RegisterRequest {
            name: name.to_string(),
            endpoint: endpoint.clone(),
        };
        let (status, body) = self
            .call(Method::POST, REGISTER_PATH, Some(&request))
            .await?;
        expect_ok(status, &body)?;
        decode(&body)
    }

    /// Endpoint for `name`, served from the cache while fresh.
    pub async fn resolve(&self, name: &str) -> Result<Endpoint, DiscoveryError> {
        if let Some(endpoint) = self.cached(name) {
            debug!("[{name}] resolved from cache");
            return Ok(endpoint);
        }
        let record = self.lookup(name).await?;
        if let Some(cache) = &self.cache
            && let Ok(mut cache) = cache.lock()
        {
            cache.put(
                name.to_string(),
                CachedEndpoint {
                    endpoint: record.endpoint.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(record.endpoint)
    }

    /// Full record for `name`, always asking the service.
    pub async fn lookup(&self, name: &str) -> Result<AddressRecord, DiscoveryError> {
        let request = NameRequest {
            name: name.to_string(),
        };
        let (status, body) = self
            .call(Method::POST, RESOLVE_PATH, Some(&request))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(DiscoveryError::UnknownService(name.to_string()));
        }
        expect_ok(status, &body)?;
        decode(&body)
    }

    /// Returns whether a record was removed.
    pub async fn deregister(&self, name: &str) -> Result<bool, DiscoveryError> {
        self.invalidate(name);
        let request = NameRequest {
            name: name.to_string(),
        };
        let (status, body) = self
            .call(Method::POST, DEREGISTER_PATH, Some(&request))
            .await?;
        expect_ok(status, &body)?;
        Ok(decode::<DeregisterResponse>(&body)?.removed)
    }

    pub async fn instances(&self) -> Result<Vec<AddressRecord>, DiscoveryError> {
        let (status, body) = self
            .call::<()>(Method::GET, INSTANCES_PATH, None)
            .await?;
        expect_ok(status, &body)?;
        Ok(decode::<InstancesResponse>(&body)?.instances)
    }

    pub async fn ping(&self) -> Result<(), DiscoveryError> {
        let (status, body) = self.call::<()>(Method::GET, HEALTH_PATH, None).await?;
        expect_ok(status, &body)
    }

    fn cached(&self, name: &str) -> Option<Endpoint> {
        let mut cache = self.cache.as_ref()?.lock().ok()?;
        let entry = cache.get(name)?;
        if entry.fetched_at.elapsed() < self.ttl {
            return Some(entry.endpoint.clone());
        }
        cache.pop(name);
        None
    }

    fn invalidate(&self, name: &str) {
        if let Some(cache) = &self.cache
            && let Ok(mut cache) = cache.lock()
        {
            cache.pop(name);
        }
    }

    async fn call<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, Bytes), DiscoveryError> {
        let payload = match body {
            Some(body) => Some(
                serde_json::to_vec(body).map_err(|e| DiscoveryError::Protocol(e.to_string()))?,
            ),
            None => None,
        };

        let mut last_error = String::new();
        for attempt in 0..self.retry.attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt - 1);
                debug!("retrying {path} in {delay:?} ({last_error})");
                self.cancellable(tokio::time::sleep(delay)).await?;
            }
            let round_trip = tokio::time::timeout(
                self.request_timeout,
                self.send_once(method.clone(), path, payload.clone()),
            );
            match self.cancellable(round_trip).await? {
                Ok(Attempt::Done(status, _)) if status.is_server_error() => {
                    last_error = format!("server answered {status}");
                }
                Ok(Attempt::Done(status, bytes)) => return Ok((status, bytes)),
                Ok(Attempt::Transient(e)) => last_error = e,
                Err(_) => last_error = format!("timed out after {:?}", self.request_timeout),
            }
        }

        warn!(
            "discovery service at {} unavailable: {last_error}",
            self.socket.display()
        );
        Err(DiscoveryError::ServiceUnavailable {
            socket: self.socket.clone(),
            attempts: self.retry.attempts,
            last_error,
        })
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, DiscoveryError> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(DiscoveryError::Cancelled),
                out = fut => Ok(out),
            },
            None => Ok(fut.await),
        }
    }

    async fn send_once(&self, method: Method, path: &str, payload: Option<Vec<u8>>) -> Attempt {
        let stream = match UnixStream::connect(&self.socket).await {
            Ok(stream) => stream,
            Err(e) => return Attempt::Transient(format!("connect: {e}")),
        };
        let handshake = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await;
        let (mut sender, conn) = match handshake {
            Ok(parts) => parts,
            Err(e) => return Attempt::Transient(format!("handshake: {e}")),
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("discovery connection closed: {e}");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "ctlplane-discovery");
        if payload.is_some() {
            builder = builder.header(CONTENT_TYPE, JSON_CONTENT_TYPE);
        }
        let request = match builder.body(Full::new(Bytes::from(payload.unwrap_or_default()))) {
            Ok(request) => request,
            Err(e) => return Attempt::Transient(format!("building request: {e}")),
        };

        let response = match sender.send_request(request).await {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(format!("request: {e}")),
        };
        let status = response.status();
        match response.into_body().collect().await {
            Ok(body) => Attempt::Done(status, body.to_bytes()),
            Err(e) => Attempt::Transient(format!("reading response: {e}")),
        }
    }
}

fn expect_ok(status: StatusCode, body: &Bytes) -> Result<(), DiscoveryError> {
    if status.is_success() {
        return Ok(());
    }
    Err(DiscoveryError::Protocol(format!(
        "{status}: {}",
        String::from_utf8_lossy(body)
    )))
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, DiscoveryError> {
    serde_json::from_slice(body).map_err(|e| DiscoveryError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{AddressBook, DiscoveryServer};

    struct Fixture {
        _dir: tempfile::TempDir,
        socket: PathBuf,
        book: Arc<AddressBook>,
        cancel: CancellationToken,
    }

    impl Fixture {
        async fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let socket = dir.path().join("discovery.sock");
            let book = Arc::new(AddressBook::new());
            let server = DiscoveryServer::bind(&socket, book.clone()).unwrap();
            let cancel = CancellationToken::new();
            tokio::spawn(server.serve(cancel.clone()));
            Self {
                _dir: dir,
                socket,
                book,
                cancel,
            }
        }

        fn client(&self) -> DiscoveryClient {
            DiscoveryClient::new(&self.socket).with_retry(fast_retry())
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_announce_then_resolve() {
        let fx = Fixture::start().await;
        let client = fx.client();
        let endpoint = ep("tcp://127.0.0.1:7001");
        let record = client.announce("A", &endpoint).await.unwrap();
        assert_eq!(record.instance_name, "A");
        assert_eq!(client.resolve("A").await.unwrap(), endpoint);
        assert_eq!(client.lookup("A").await.unwrap().endpoint, endpoint);
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_not_retried() {
        let fx = Fixture::start().await;
        let client = fx.client();
        assert_eq!(
            client.resolve("nobody").await,
            Err(DiscoveryError::UnknownService("nobody".into()))
        );
    }

    #[tokio::test]
    async fn test_deregister_then_resolve_fails() {
        let fx = Fixture::start().await;
        let client = fx.client();
        client.announce("A", &ep("/tmp/a.sock")).await.unwrap();
        client.resolve("A").await.unwrap();
        assert!(client.deregister("A").await.unwrap());
        assert!(!client.deregister("A").await.unwrap());
        // The cached entry was dropped along with the record.
        assert!(matches!(
            client.resolve("A").await,
            Err(DiscoveryError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_reannounce_invalidates_cache() {
        let fx = Fixture::start().await;
        let client = fx.client();
        client.announce("A", &ep("tcp://127.0.0.1:1")).await.unwrap();
        assert_eq!(client.resolve("A").await.unwrap(), ep("tcp://127.0.0.1:1"));
        client.announce("A", &ep("tcp://127.0.0.1:2")).await.unwrap();
        assert_eq!(client.resolve("A").await.unwrap(), ep("tcp://127.0.0.1:2"));
    }

    #[tokio::test]
    async fn test_cache_served_until_ttl() {
        let fx = Fixture::start().await;
        let client = fx.client().with_cache(16, Duration::from_millis(100));
        client.announce("A", &ep("tcp://127.0.0.1:1")).await.unwrap();
        client.resolve("A").await.unwrap();

        // Changed behind the client's back.
        fx.book.register("A", ep("tcp://127.0.0.1:2"));
        assert_eq!(client.resolve("A").await.unwrap(), ep("tcp://127.0.0.1:1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.resolve("A").await.unwrap(), ep("tcp://127.0.0.1:2"));
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let fx = Fixture::start().await;
        let client = fx.client().with_cache(2, Duration::from_secs(60));
        for (name, port) in [("a", 1), ("b", 2), ("c", 3)] {
            client
                .announce(name, &ep(&format!("tcp://127.0.0.1:{port}")))
                .await
                .unwrap();
            client.resolve(name).await.unwrap();
        }
        // "a" was evicted, so the changed record is observed.
        fx.book.register("a", ep("tcp://127.0.0.1:10"));
        fx.book.register("c", ep("tcp://127.0.0.1:30"));
        assert_eq!(client.resolve("a").await.unwrap(), ep("tcp://127.0.0.1:10"));
        assert_eq!(client.resolve("c").await.unwrap(), ep("tcp://127.0.0.1:3"));
    }

    #[tokio::test]
    async fn test_instances_and_ping() {
        let fx = Fixture::start().await;
        let client = fx.client();
        client.ping().await.unwrap();
        client.announce("b", &ep("tcp://127.0.0.1:2")).await.unwrap();
        client.announce("a", &ep("tcp://127.0.0.1:1")).await.unwrap();
        let names: Vec<String> = client
            .instances()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instance_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unavailable_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            DiscoveryClient::new(dir.path().join("missing.sock")).with_retry(fast_retry());
        match client.resolve("A").await {
            Err(DiscoveryError::ServiceUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ServiceUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let client = DiscoveryClient::new(dir.path().join("missing.sock"))
            .with_retry(RetryPolicy {
                attempts: 100,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(1),
            })
            .with_cancellation(token.clone());
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = Instant::now();
        assert_eq!(client.ping().await, Err(DiscoveryError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_service_is_reached_by_retry() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("late.sock");
        let client = DiscoveryClient::new(&socket).with_retry(RetryPolicy {
            attempts: 20,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
        });
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let server_socket = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let server =
                DiscoveryServer::bind(&server_socket, Arc::new(AddressBook::new())).unwrap();
            server.serve(server_cancel).await.unwrap();
        });
        client.ping().await.unwrap();
        cancel.cancel();
    }
}
