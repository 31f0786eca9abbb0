//! # DLMP Net
//!
//! HTTP networking and request interception for the DLMP offline agent.
//!
//! ## Design Goals
//!
//! 1. **One network seam**: everything that reaches the network goes through [`Fetcher`]
//! 2. **Request interception**: the host's loader exposes a hook point an agent registers against
//! 3. **Snapshot responses**: bodies are fully buffered so a response can be cached and replayed
//!
//! A network failure is an `Err`; an HTTP error status is still an `Ok(Response)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

pub use url::Url;

pub mod intercept;

pub use intercept::{HandlerId, InterceptAction, InterceptHandler, RequestInterceptor};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("Request blocked")]
    Blocked,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the requested resource will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// A navigable page.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    /// Programmatic fetch (XHR / fetch()).
    #[default]
    Empty,
}

impl Destination {
    /// Check if this is a navigation request.
    pub fn is_document(&self) -> bool {
        matches!(self, Destination::Document)
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: Destination,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            destination: Destination::Empty,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a GET request for a navigable page.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).destination(Destination::Document)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Parse a URL and create a GET request.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Where a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    /// Fresh from the network.
    #[default]
    Network,
    /// Replayed from a cache namespace.
    Cache,
    /// Synthesised locally because nothing else was available.
    Fallback,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            source: ResponseSource::Network,
        }
    }

    /// Create a locally synthesised response.
    pub fn synthetic(
        url: Url,
        status: StatusCode,
        status_text: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            url,
            status,
            status_text: status_text.into(),
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Fallback,
        }
    }

    /// Set a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set where this response came from.
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get the body as bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// The Content-Type header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Anything that can turn a request into a response.
///
/// `Err` means the network itself failed (offline, DNS, reset); HTTP error
/// statuses come back as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Request timeout; `None` leaves timeouts to the platform.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("dlmp-agent/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
            default_timeout: None,
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// `reqwest`-backed network access.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("HttpFetcher initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }
        let timeout = request.timeout.or(self.config.default_timeout);

        let response = req_builder
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(url, status, headers, body))
    }
}

fn send_error(error: reqwest::Error, timeout: Option<Duration>) -> NetError {
    match timeout {
        Some(after) if error.is_timeout() => NetError::Timeout(after),
        _ => NetError::HttpError(error),
    }
}

/// The host application's networking layer.
///
/// Every request is first offered to the registered interceptors; only
/// requests they let through reach the network.
pub struct ResourceLoader {
    network: Arc<dyn Fetcher>,
    interceptor: Arc<RwLock<RequestInterceptor>>,
}

impl ResourceLoader {
    /// Create a new resource loader over a network fetcher.
    pub fn new(network: Arc<dyn Fetcher>) -> Self {
        Self {
            network,
            interceptor: Arc::new(RwLock::new(RequestInterceptor::new())),
        }
    }

    /// Register an interception handler.
    pub async fn register(&self, handler: Arc<dyn InterceptHandler>) -> HandlerId {
        self.interceptor.write().await.add_handler(handler)
    }

    /// Remove an interception handler.
    pub async fn unregister(&self, id: HandlerId) -> bool {
        self.interceptor.write().await.remove_handler(id)
    }

    /// Fetch a request, letting interceptors answer first.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let action = self.interceptor.read().await.intercept(&request).await;
        match action {
            InterceptAction::Continue => self.network.fetch(&request).await,
            InterceptAction::Respond(response) => Ok(*response),
            InterceptAction::Block => {
                warn!(url = %request.url, "Request blocked by interceptor");
                Err(NetError::Blocked)
            }
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        ResourceLoader::fetch(self, request.clone()).await
    }
}
