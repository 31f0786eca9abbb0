//! Scripted network and storage for exercising the agent without a server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use dlmp_net::{Fetcher, NetError, Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, StatusCode};
use tokio::sync::watch;

use crate::store::{CacheEntry, CacheKey, CacheStore, MemoryCacheStore, StoreError};

/// A [`Fetcher`] answering from a routing table.
///
/// Unknown URLs get a 404. While offline every fetch fails. While paused,
/// fetches are recorded and then held until [`ScriptedFetcher::resume`].
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    paused: watch::Sender<bool>,
}

impl ScriptedFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            paused,
        }
    }

    /// Answer `url` with `status` and `body` from now on.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        lock(&self.routes).insert(url.to_string(), (status, body.into()));
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every subsequent fetch until resumed.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release held fetches.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// How many fetches of `url` were started.
    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).iter().filter(|u| u.as_str() == url).count()
    }

    /// Total number of fetches started.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        lock(&self.calls).push(request.url.to_string());

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let (status, body) = lock(&self.routes)
            .get(request.url.as_str())
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found")));

        Ok(Response::new(request.url.clone(), status, HeaderMap::new(), body))
    }
}

/// A [`MemoryCacheStore`] whose writes or deletes can be switched to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryCacheStore,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent `put`.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Reject every subsequent `delete`.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn open(&self, namespace: &str) -> Result<(), StoreError> {
        self.inner.open(namespace).await
    }

    async fn put(
        &self,
        namespace: &str,
        key: CacheKey,
        response: &Response,
    ) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded(format!("{namespace} is full")));
        }
        self.inner.put(namespace, key, response).await
    }

    async fn match_key(
        &self,
        namespace: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.match_key(namespace, key).await
    }

    async fn delete(&self, namespace: &str) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{namespace} is locked")));
        }
        self.inner.delete(namespace).await
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.inner.namespaces().await
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError> {
        self.inner.keys(namespace).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    #[tokio::test]
    async fn test_routes_and_404() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("http://localhost:3000/a", 200, "a");

        let hit = fetcher
            .fetch(&Request::get(Url::parse("http://localhost:3000/a").unwrap()))
            .await
            .unwrap();
        assert_eq!(hit.text().unwrap(), "a");

        let miss = fetcher
            .fetch(&Request::get(Url::parse("http://localhost:3000/b").unwrap()))
            .await
            .unwrap();
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_fails() {
        let fetcher = ScriptedFetcher::new();
        fetcher.set_offline(true);
        let result = fetcher
            .fetch(&Request::get(Url::parse("http://localhost:3000/a").unwrap()))
            .await;
        assert!(matches!(result, Err(NetError::Offline)));
    }

    #[tokio::test]
    async fn test_pause_holds_fetches() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.pause();

        let f = fetcher.clone();
        let handle = tokio::spawn(async move {
            f.fetch(&Request::get(Url::parse("http://localhost:3000/a").unwrap()))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(fetcher.calls("http://localhost:3000/a"), 1);

        fetcher.resume();
        assert!(handle.await.unwrap().is_ok());
    }
}
