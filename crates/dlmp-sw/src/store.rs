//! Versioned cache storage.
//!
//! A store holds named namespaces, one per agent version. Each namespace maps
//! a request identity to an immutable response snapshot; writing the same key
//! again replaces the previous snapshot wholesale.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dlmp_net::{Fetcher, NetError, Request, Response, ResponseSource};
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::AgentError;

/// Errors raised by a cache store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Normalised request identity: method plus absolute URL (query kept, fragment dropped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Build a key from a method and URL.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key of a request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key of a GET for this URL.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub url: Url,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Insertion time (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response.
    pub fn from_response(key: CacheKey, response: &Response) -> Self {
        Self {
            key,
            url: response.url.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Replay the snapshot as a response.
    pub fn to_response(&self) -> Response {
        Response {
            url: self.url.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }
}

/// Key → response store partitioned into named namespaces.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the namespace if it does not exist.
    async fn open(&self, namespace: &str) -> Result<(), StoreError>;

    /// Write an entry, creating the namespace if needed. Last write wins.
    async fn put(
        &self,
        namespace: &str,
        key: CacheKey,
        response: &Response,
    ) -> Result<(), StoreError>;

    /// Look up an entry in one namespace only.
    async fn match_key(
        &self,
        namespace: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Delete a namespace and everything in it.
    async fn delete(&self, namespace: &str) -> Result<bool, StoreError>;

    /// Names of all namespaces.
    async fn namespaces(&self) -> Result<Vec<String>, StoreError>;

    /// Keys held by a namespace (empty if it does not exist).
    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError>;
}

/// A single namespace.
#[derive(Debug, Default)]
struct Namespace {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Namespace {
    fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// In-process cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a namespace exists.
    pub async fn has(&self, namespace: &str) -> bool {
        self.namespaces.read().await.contains_key(namespace)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, namespace: &str) -> Result<(), StoreError> {
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn put(
        &self,
        namespace: &str,
        key: CacheKey,
        response: &Response,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry::from_response(key, response);
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .put(entry);
        Ok(())
    }

    async fn match_key(
        &self,
        namespace: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.match_key(key))
            .cloned())
    }

    async fn delete(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.namespaces.write().await.remove(namespace).is_some())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.namespaces.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map(Namespace::keys)
            .unwrap_or_default())
    }
}

/// Fetch every URL, then write all responses into `namespace`.
///
/// Nothing is written unless every fetch succeeds with a 2xx status.
pub(crate) async fn fetch_and_store(
    store: &dyn CacheStore,
    network: &dyn Fetcher,
    namespace: &str,
    urls: &[Url],
) -> Result<usize, AgentError> {
    let fetched: Vec<(Request, Response)> = try_join_all(urls.iter().map(|url| async move {
        let request = Request::get(url.clone());
        let response = network.fetch(&request).await?;
        if !response.ok() {
            return Err(AgentError::Network(NetError::RequestFailed(format!(
                "{url} answered {}",
                response.status
            ))));
        }
        Ok::<_, AgentError>((request, response))
    }))
    .await?;

    store.open(namespace).await?;
    for (request, response) in &fetched {
        store
            .put(namespace, CacheKey::for_request(request), response)
            .await?;
    }
    debug!(namespace = %namespace, count = fetched.len(), "Stored fetched responses");
    Ok(fetched.len())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str, body: &'static str) -> Response {
        Response::new(
            Url::parse(url).unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn test_key_strips_fragment_keeps_query() {
        let url = Url::parse("https://example.com/a?page=2#top").unwrap();
        let key = CacheKey::get(&url);
        assert_eq!(key.url, "https://example.com/a?page=2");
        assert_eq!(key.method, "GET");
        assert_eq!(key.to_string(), "GET https://example.com/a?page=2");
    }

    #[test]
    fn test_key_distinguishes_query() {
        let a = CacheKey::get(&Url::parse("https://example.com/a?x=1").unwrap());
        let b = CacheKey::get(&Url::parse("https://example.com/a?x=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_replays_as_cache_response() {
        let original = response("https://example.com/app.js", "console.log(1)");
        let entry = CacheEntry::from_response(CacheKey::get(&original.url), &original);
        let replayed = entry.to_response();
        assert_eq!(replayed.source, ResponseSource::Cache);
        assert_eq!(replayed.body, original.body);
        assert_eq!(replayed.status, StatusCode::OK);
        assert!(entry.cached_at > 0);
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let store = MemoryCacheStore::new();
        let res = response("https://example.com/style.css", "body{}");
        let key = CacheKey::get(&res.url);

        store.put("v1", key.clone(), &res).await.unwrap();

        let hit = store.match_key("v1", &key).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"body{}"));
        assert!(store
            .match_key("v1", &CacheKey::get(&Url::parse("https://example.com/other.css").unwrap()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryCacheStore::new();
        let res = response("https://example.com/a.js", "a");
        let key = CacheKey::get(&res.url);

        store.put("v1", key.clone(), &res).await.unwrap();
        assert!(store.match_key("v2", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryCacheStore::new();
        let first = response("https://example.com/a.js", "first");
        let second = response("https://example.com/a.js", "second");
        let key = CacheKey::get(&first.url);

        store.put("v1", key.clone(), &first).await.unwrap();
        store.put("v1", key.clone(), &second).await.unwrap();

        let hit = store.match_key("v1", &key).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"second"));
        assert_eq!(store.keys("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_delete_enumerate() {
        let store = MemoryCacheStore::new();
        assert!(!store.has("v1").await);

        store.open("v2").await.unwrap();
        store.open("v1").await.unwrap();
        assert!(store.has("v1").await);
        assert_eq!(store.namespaces().await.unwrap(), vec!["v1", "v2"]);

        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert_eq!(store.namespaces().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_keys_of_missing_namespace() {
        let store = MemoryCacheStore::new();
        assert!(store.keys("nope").await.unwrap().is_empty());
    }
}
