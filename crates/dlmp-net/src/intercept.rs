//! Request interception hook point.
//!
//! Handlers run in registration order; the first one that does not return
//! [`InterceptAction::Continue`] decides the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::{Request, Response};

/// Action to take for an intercepted request.
#[derive(Debug, Clone)]
pub enum InterceptAction {
    /// Let the request proceed to the network untouched.
    Continue,
    /// Answer the request with this response.
    Respond(Box<Response>),
    /// Fail the request.
    Block,
}

/// Handler for intercepting requests.
#[async_trait]
pub trait InterceptHandler: Send + Sync {
    /// Called for each request. Return the action to take.
    async fn intercept(&self, request: &Request) -> InterceptAction;
}

/// Identifier returned when a handler is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered set of interception handlers.
pub struct RequestInterceptor {
    handlers: Vec<(HandlerId, Arc<dyn InterceptHandler>)>,
}

impl RequestInterceptor {
    /// Create a new interceptor.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler.
    pub fn add_handler(&mut self, handler: Arc<dyn InterceptHandler>) -> HandlerId {
        let id = HandlerId::new();
        self.handlers.push((id, handler));
        id
    }

    /// Remove a handler.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Intercept a request.
    pub async fn intercept(&self, request: &Request) -> InterceptAction {
        trace!(url = %request.url, "Intercepting request");

        for (id, handler) in &self.handlers {
            match handler.intercept(request).await {
                InterceptAction::Continue => continue,
                other => {
                    debug!(url = %request.url, handler = ?id, "Handler intercepted");
                    return other;
                }
            }
        }

        InterceptAction::Continue
    }
}

impl Default for RequestInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Url;
    use http::StatusCode;

    struct Fixed(InterceptAction);

    #[async_trait]
    impl InterceptHandler for Fixed {
        async fn intercept(&self, _request: &Request) -> InterceptAction {
            self.0.clone()
        }
    }

    fn test_request(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn canned(body: &'static str) -> InterceptAction {
        InterceptAction::Respond(Box::new(Response::synthetic(
            Url::parse("https://example.com/").unwrap(),
            StatusCode::OK,
            "OK",
            body,
        )))
    }

    #[tokio::test]
    async fn test_empty_interceptor_continues() {
        let interceptor = RequestInterceptor::new();
        assert!(interceptor.is_empty());
        let action = interceptor.intercept(&test_request("https://example.com/")).await;
        assert!(matches!(action, InterceptAction::Continue));
    }

    #[tokio::test]
    async fn test_first_decisive_handler_wins() {
        let mut interceptor = RequestInterceptor::new();
        interceptor.add_handler(Arc::new(Fixed(InterceptAction::Continue)));
        interceptor.add_handler(Arc::new(Fixed(canned("first"))));
        interceptor.add_handler(Arc::new(Fixed(canned("second"))));

        let action = interceptor.intercept(&test_request("https://example.com/")).await;
        match action {
            InterceptAction::Respond(response) => {
                assert_eq!(response.text().unwrap(), "first");
            }
            other => panic!("Expected respond, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_block() {
        let mut interceptor = RequestInterceptor::new();
        interceptor.add_handler(Arc::new(Fixed(InterceptAction::Block)));
        let action = interceptor.intercept(&test_request("https://example.com/")).await;
        assert!(matches!(action, InterceptAction::Block));
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let mut interceptor = RequestInterceptor::new();
        let id = interceptor.add_handler(Arc::new(Fixed(InterceptAction::Block)));
        assert_eq!(interceptor.len(), 1);
        assert!(interceptor.remove_handler(id));
        assert!(!interceptor.remove_handler(id));

        let action = interceptor.intercept(&test_request("https://example.com/")).await;
        assert!(matches!(action, InterceptAction::Continue));
    }
}
