//! Caching strategies.
//!
//! - **Network-first** for API traffic: the network answers; the current
//!   namespace is only read when the network fails.
//! - **Cache-first** for static assets: a hit is returned immediately and
//!   refreshed in the background; a miss goes to the network and is written.
//!
//! When neither source can answer, a synthetic response is produced: the
//! offline document for navigations, 408 for API calls, 503 for assets.
//!
//! Writes are dropped once the owning version is no longer active, so a
//! superseded version never recreates a namespace the new one collected.

use std::sync::Arc;

use bytes::Bytes;
use dlmp_net::{Fetcher, Request, Response, ResponseSource};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::classify::RequestClass;
use crate::event::ExtendableEvent;
use crate::lifecycle::AgentState;
use crate::store::{CacheKey, CacheStore, StoreError};
use crate::AgentError;

const NETWORK_ERROR_BODY: &str = "Network error";
const NETWORK_ERROR_TEXT: &str = "Network timeout";
const OFFLINE_ASSET_BODY: &str = "Resource not available offline";
const OFFLINE_ASSET_TEXT: &str = "Service Unavailable";

/// Served when a navigation fails and the offline page itself was never cached.
const BUILTIN_OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body><h1>You are offline</h1><p>This page is not available without a network connection.</p></body></html>\n";

/// Applies a caching strategy to classified requests.
pub struct PolicyEngine {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    namespace: String,
    offline_page: Url,
    state: watch::Receiver<AgentState>,
}

impl PolicyEngine {
    /// Create an engine writing to `namespace` while `state` reads `Active`.
    pub fn new(
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
        namespace: impl Into<String>,
        offline_page: Url,
        state: watch::Receiver<AgentState>,
    ) -> Self {
        Self {
            store,
            network,
            namespace: namespace.into(),
            offline_page,
            state,
        }
    }

    /// The namespace reads and writes target.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Dispatch to the strategy of `class`.
    pub async fn handle(
        &self,
        request: &Request,
        class: RequestClass,
        event: &ExtendableEvent,
    ) -> Response {
        if class.is_network_first() {
            self.network_first(request, class, event).await
        } else {
            self.cache_first(request, event).await
        }
    }

    /// Network first, falling back to the current namespace.
    pub async fn network_first(
        &self,
        request: &Request,
        class: RequestClass,
        event: &ExtendableEvent,
    ) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => {
                if class.persists() && response.ok() {
                    self.write_behind(request, &response, event);
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                if let Some(cached) = self.lookup(request).await {
                    return cached;
                }
                self.offline_fallback(
                    request,
                    StatusCode::REQUEST_TIMEOUT,
                    NETWORK_ERROR_TEXT,
                    NETWORK_ERROR_BODY,
                )
                .await
            }
        }
    }

    /// Cache first with background revalidation.
    pub async fn cache_first(&self, request: &Request, event: &ExtendableEvent) -> Response {
        if let Some(cached) = self.lookup(request).await {
            self.revalidate(request, event);
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    let key = CacheKey::for_request(request);
                    let store = self.store.as_ref();
                    if let Err(e) =
                        put_if_active(store, &self.state, &self.namespace, key, &response).await
                    {
                        warn!(url = %request.url, error = %e, "Cache write failed");
                    }
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Static resource unavailable");
                self.offline_fallback(
                    request,
                    StatusCode::SERVICE_UNAVAILABLE,
                    OFFLINE_ASSET_TEXT,
                    OFFLINE_ASSET_BODY,
                )
                .await
            }
        }
    }

    /// Response for a request nothing else could answer.
    pub async fn offline_fallback(
        &self,
        request: &Request,
        status: StatusCode,
        status_text: &str,
        body: &'static str,
    ) -> Response {
        if request.destination.is_document() {
            return self.offline_document(&request.url).await;
        }
        Response::synthetic(request.url.clone(), status, status_text, body)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
    }

    async fn offline_document(&self, requested: &Url) -> Response {
        let key = CacheKey::get(&self.offline_page);
        match self.store.match_key(&self.namespace, &key).await {
            Ok(Some(entry)) => entry.to_response().with_source(ResponseSource::Fallback),
            Ok(None) => {
                warn!(page = %self.offline_page, "Offline page missing from cache");
                builtin_offline_document(requested)
            }
            Err(e) => {
                warn!(page = %self.offline_page, error = %e, "Offline page lookup failed");
                builtin_offline_document(requested)
            }
        }
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let key = CacheKey::for_request(request);
        match self.store.match_key(&self.namespace, &key).await {
            Ok(entry) => entry.map(|e| e.to_response()),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    fn write_behind(&self, request: &Request, response: &Response, event: &ExtendableEvent) {
        let store = Arc::clone(&self.store);
        let state = self.state.clone();
        let namespace = self.namespace.clone();
        let key = CacheKey::for_request(request);
        let response = response.clone();
        event.wait_until(format!("cache-write {key}"), async move {
            put_if_active(store.as_ref(), &state, &namespace, key, &response).await
        });
    }

    fn revalidate(&self, request: &Request, event: &ExtendableEvent) {
        let store = Arc::clone(&self.store);
        let network = Arc::clone(&self.network);
        let state = self.state.clone();
        let namespace = self.namespace.clone();
        let request = request.clone();
        event.wait_until(format!("revalidate {}", request.url), async move {
            let response = network.fetch(&request).await?;
            if response.ok() {
                let key = CacheKey::for_request(&request);
                put_if_active(store.as_ref(), &state, &namespace, key, &response).await?;
                debug!(url = %request.url, "Background refresh done");
            }
            Ok::<(), AgentError>(())
        });
    }
}

async fn put_if_active(
    store: &dyn CacheStore,
    state: &watch::Receiver<AgentState>,
    namespace: &str,
    key: CacheKey,
    response: &Response,
) -> Result<(), StoreError> {
    let current = *state.borrow();
    if current != AgentState::Active {
        debug!(key = %key, state = ?current, "Version no longer active, write dropped");
        return Ok(());
    }
    store.put(namespace, key, response).await
}

fn builtin_offline_document(url: &Url) -> Response {
    Response::synthetic(
        url.clone(),
        StatusCode::SERVICE_UNAVAILABLE,
        OFFLINE_ASSET_TEXT,
        Bytes::from_static(BUILTIN_OFFLINE_DOCUMENT.as_bytes()),
    )
    .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
}
