//! Deferred work run when connectivity returns.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dlmp_net::{Fetcher, Request};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::AgentError;

/// Work run on a background-sync event.
#[async_trait]
pub trait SyncTask: Send + Sync {
    async fn run(&self) -> Result<(), AgentError>;
}

/// Queues write requests made while offline and replays them in order.
///
/// A rejected request (4xx) is dropped. A server error or network failure
/// stops the replay; it and everything behind it stay queued.
pub struct OutboxSync {
    network: Arc<dyn Fetcher>,
    queue: Mutex<VecDeque<Request>>,
}

impl OutboxSync {
    pub fn new(network: Arc<dyn Fetcher>) -> Self {
        Self {
            network,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a request for the next sync.
    pub async fn enqueue(&self, request: Request) {
        debug!(method = %request.method, url = %request.url, "Queued for sync");
        self.queue.lock().await.push_back(request);
    }

    /// Number of requests waiting.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

#[async_trait]
impl SyncTask for OutboxSync {
    async fn run(&self) -> Result<(), AgentError> {
        // Held across the replay so a second sync cannot send the same request twice.
        let mut queue = self.queue.lock().await;
        let mut sent = 0usize;

        while let Some(request) = queue.front() {
            match self.network.fetch(request).await {
                Ok(response) if response.status.is_server_error() => {
                    return Err(AgentError::Sync(format!(
                        "{} {} answered {}, {} left",
                        request.method,
                        request.url,
                        response.status,
                        queue.len()
                    )));
                }
                Ok(response) => {
                    if response.status.is_client_error() {
                        warn!(url = %request.url, status = %response.status, "Queued request rejected, dropping");
                    }
                    queue.pop_front();
                    sent += 1;
                }
                Err(e) => {
                    return Err(AgentError::Sync(format!(
                        "{} {}: {e}, {} left",
                        request.method,
                        request.url,
                        queue.len()
                    )));
                }
            }
        }

        if sent > 0 {
            info!(sent, "Outbox flushed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFetcher;
    use bytes::Bytes;
    use url::Url;

    fn post(path: &str) -> Request {
        let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
        Request::post(url, Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn test_replays_in_order() {
        let network = Arc::new(ScriptedFetcher::new());
        network.respond("http://localhost:3000/api/cases", 201, "");
        network.respond("http://localhost:3000/api/notes", 201, "");
        let outbox = OutboxSync::new(network.clone());

        outbox.enqueue(post("/api/cases")).await;
        outbox.enqueue(post("/api/notes")).await;
        outbox.run().await.unwrap();

        assert!(outbox.is_empty().await);
        assert_eq!(network.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_keeps_queue() {
        let network = Arc::new(ScriptedFetcher::new());
        network.set_offline(true);
        let outbox = OutboxSync::new(network.clone());
        outbox.enqueue(post("/api/cases")).await;
        outbox.enqueue(post("/api/notes")).await;

        assert!(matches!(outbox.run().await, Err(AgentError::Sync(_))));
        assert_eq!(outbox.len().await, 2);
        assert_eq!(network.total_calls(), 1);

        network.set_offline(false);
        network.respond("http://localhost:3000/api/cases", 200, "");
        network.respond("http://localhost:3000/api/notes", 200, "");
        outbox.run().await.unwrap();
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_error_stops_client_error_drops() {
        let network = Arc::new(ScriptedFetcher::new());
        network.respond("http://localhost:3000/api/bad", 422, "");
        network.respond("http://localhost:3000/api/down", 503, "");
        let outbox = OutboxSync::new(network.clone());
        outbox.enqueue(post("/api/bad")).await;
        outbox.enqueue(post("/api/down")).await;
        outbox.enqueue(post("/api/later")).await;

        assert!(outbox.run().await.is_err());
        assert_eq!(outbox.len().await, 2);
        assert_eq!(network.calls("http://localhost:3000/api/later"), 0);
    }
}
