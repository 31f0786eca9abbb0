//! Control channel between the host application and the agent.
//!
//! Wire form: `{"type": "...", "payload": {...}}`. Each command carries at most
//! one private reply port; replies are never broadcast.
//!
//! | Command | Reply |
//! |---|---|
//! | `SKIP_WAITING` | none |
//! | `GET_VERSION` | `{version}` |
//! | `CLEAR_CACHE` | `{success}` |
//! | `CACHE_URLS {urls}` | `{success}`, `{success: false, error}` if any URL failed |

use std::sync::Arc;

use dlmp_net::Fetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, info};
use url::Url;

use crate::store::{fetch_and_store, CacheStore};
use crate::{Agent, AgentError};

/// A command understood by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    SkipWaiting,
    GetVersion,
    ClearCache,
    CacheUrls(CacheUrlsPayload),
}

/// Payload of `CACHE_URLS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheUrlsPayload {
    pub urls: Vec<String>,
}

impl ControlCommand {
    /// Parse a raw message.
    pub fn from_value(value: &JsonValue) -> Result<Self, AgentError> {
        serde_json::from_value(value.clone())
            .map_err(|e| AgentError::UnknownCommand(format!("{value}: {e}")))
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version {
        version: String,
    },
    Outcome {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlReply {
    pub fn success() -> Self {
        Self::Outcome {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self::Outcome {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Agent side of a single-shot reply channel.
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<ControlReply>);

impl ReplyPort {
    /// Send the one reply. A host that stopped listening is not an error.
    pub fn send(self, reply: ControlReply) {
        if self.0.send(reply).is_err() {
            debug!("Reply dropped, host no longer listening");
        }
    }
}

/// Host side of a single-shot reply channel.
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<ControlReply>);

impl PendingReply {
    /// Wait for the reply. Fails if the agent dropped the port without replying.
    pub async fn recv(self) -> Result<ControlReply, AgentError> {
        self.0.await.map_err(|_| AgentError::ChannelClosed)
    }
}

/// Create a connected reply port / pending reply pair.
pub fn rpc_channel() -> (ReplyPort, PendingReply) {
    let (tx, rx) = oneshot::channel();
    (ReplyPort(tx), PendingReply(rx))
}

/// A message posted to the agent.
#[derive(Debug)]
pub struct ControlMessage {
    pub data: JsonValue,
    pub reply: Option<ReplyPort>,
}

impl ControlMessage {
    /// A message that expects no reply.
    pub fn notify(command: &ControlCommand) -> Self {
        Self {
            data: command.to_value(),
            reply: None,
        }
    }

    /// A message plus the handle its reply will arrive on.
    pub fn request(command: &ControlCommand) -> (Self, PendingReply) {
        let (port, pending) = rpc_channel();
        (
            Self {
                data: command.to_value(),
                reply: Some(port),
            },
            pending,
        )
    }
}

/// Delete every namespace, current included.
pub(crate) async fn clear_all(store: &dyn CacheStore) -> Result<usize, AgentError> {
    let names = store.namespaces().await?;
    for name in &names {
        store.delete(name).await?;
    }
    info!(count = names.len(), "All caches cleared");
    Ok(names.len())
}

/// Fetch and store a batch of URLs into `namespace`, all or nothing.
pub(crate) async fn cache_urls(
    store: &dyn CacheStore,
    network: &dyn Fetcher,
    namespace: &str,
    urls: &[Url],
) -> Result<usize, AgentError> {
    let count = fetch_and_store(store, network, namespace, urls).await?;
    info!(namespace = %namespace, count, "Cached URLs");
    Ok(count)
}

/// Host-side handle for talking to an agent.
#[derive(Clone)]
pub struct ControlClient {
    agent: Arc<Agent>,
}

impl ControlClient {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    /// Ask the agent to activate without waiting.
    pub async fn skip_waiting(&self) {
        self.agent
            .handle_message(ControlMessage::notify(&ControlCommand::SkipWaiting))
            .await;
    }

    /// The agent's version tag.
    pub async fn get_version(&self) -> Result<String, AgentError> {
        match self.request(ControlCommand::GetVersion).await? {
            ControlReply::Version { version } => Ok(version),
            other => Err(AgentError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Delete every cache namespace.
    pub async fn clear_cache(&self) -> Result<(), AgentError> {
        self.expect_success(ControlCommand::ClearCache).await
    }

    /// Fetch and cache `urls` in the agent's current namespace.
    pub async fn cache_urls(&self, urls: Vec<String>) -> Result<(), AgentError> {
        self.expect_success(ControlCommand::CacheUrls(CacheUrlsPayload { urls }))
            .await
    }

    async fn expect_success(&self, command: ControlCommand) -> Result<(), AgentError> {
        match self.request(command).await? {
            ControlReply::Outcome { success: true, .. } => Ok(()),
            ControlReply::Outcome { error, .. } => Err(AgentError::CommandFailed(
                error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            other => Err(AgentError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    async fn request(&self, command: ControlCommand) -> Result<ControlReply, AgentError> {
        let (message, pending) = ControlMessage::request(&command);
        self.agent.handle_message(message).await;
        pending.recv().await
    }
}
