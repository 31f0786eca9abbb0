//! Push notifications and notification actions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationDefaults;
use crate::AgentError;

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    #[serde(alias = "action")]
    pub id: String,
    #[serde(alias = "title")]
    pub label: String,
}

/// Opaque data carried by a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Where a click on the notification body navigates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A notification ready to hand to the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

/// A push message as delivered by the messaging backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushMessage {
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub vibrate: Option<Vec<u32>>,
    /// `null` and absent both mean no data.
    pub data: Option<NotificationData>,
    pub actions: Option<Vec<NotificationAction>>,
}

impl PushMessage {
    /// Parse a raw JSON payload. `title` is required.
    pub fn parse(payload: &[u8]) -> Result<Self, AgentError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(AgentError::Notification("empty push payload".to_string()));
        }
        serde_json::from_slice(payload)
            .map_err(|e| AgentError::Notification(format!("malformed push payload: {e}")))
    }

    /// Fill absent presentation fields from `defaults`.
    pub fn into_notification(self, defaults: &NotificationDefaults) -> NotificationPayload {
        NotificationPayload {
            title: self.title,
            body: self.body,
            icon: self.icon.unwrap_or_else(|| defaults.icon.clone()),
            badge: self.badge.unwrap_or_else(|| defaults.badge.clone()),
            vibrate: self.vibrate.unwrap_or_else(|| defaults.vibrate.clone()),
            data: self.data.unwrap_or_default(),
            actions: self.actions.unwrap_or_default(),
        }
    }
}

/// Identifier of a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

/// The OS/browser shell the agent surfaces notifications and windows through.
#[async_trait]
pub trait Shell: Send + Sync {
    async fn show_notification(
        &self,
        id: NotificationId,
        notification: &NotificationPayload,
    ) -> Result<(), AgentError>;

    async fn close_notification(&self, id: NotificationId) -> Result<(), AgentError>;

    async fn open_window(&self, url: &Url) -> Result<(), AgentError>;
}

/// A [`Shell`] that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingShell {
    shown: Mutex<Vec<(NotificationId, NotificationPayload)>>,
    closed: Mutex<Vec<NotificationId>>,
    opened: Mutex<Vec<Url>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications displayed so far, closed ones included.
    pub fn shown(&self) -> Vec<(NotificationId, NotificationPayload)> {
        lock(&self.shown).clone()
    }

    /// Notifications still on screen.
    pub fn visible(&self) -> Vec<NotificationPayload> {
        let closed = lock(&self.closed).clone();
        lock(&self.shown)
            .iter()
            .filter(|(id, _)| !closed.contains(id))
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn closed(&self) -> Vec<NotificationId> {
        lock(&self.closed).clone()
    }

    /// Windows opened so far.
    pub fn opened(&self) -> Vec<Url> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl Shell for RecordingShell {
    async fn show_notification(
        &self,
        id: NotificationId,
        notification: &NotificationPayload,
    ) -> Result<(), AgentError> {
        lock(&self.shown).push((id, notification.clone()));
        Ok(())
    }

    async fn close_notification(&self, id: NotificationId) -> Result<(), AgentError> {
        lock(&self.closed).push(id);
        Ok(())
    }

    async fn open_window(&self, url: &Url) -> Result<(), AgentError> {
        lock(&self.opened).push(url.clone());
        Ok(())
    }
}

/// A click on a displayed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationClick {
    pub id: NotificationId,
    /// Id of the action button, `None` for a click on the body.
    pub action: Option<String>,
    pub data: NotificationData,
}

/// What an action handler may touch.
pub struct ActionContext<'a> {
    pub shell: &'a dyn Shell,
    pub origin: &'a Url,
}

impl ActionContext<'_> {
    /// Open `data.url`, or the origin root when absent.
    pub async fn open_target(&self, data: &NotificationData) -> Result<(), AgentError> {
        let target = data.url.as_deref().unwrap_or("/");
        let url = self
            .origin
            .join(target)
            .map_err(|e| AgentError::Notification(format!("bad target {target:?}: {e}")))?;
        info!(url = %url, "Opening window");
        self.shell.open_window(&url).await
    }
}

/// Handles one notification action id.
#[async_trait]
pub trait NotificationActionHandler: Send + Sync {
    async fn handle(
        &self,
        click: &NotificationClick,
        context: &ActionContext<'_>,
    ) -> Result<(), AgentError>;
}

struct ViewAction;

#[async_trait]
impl NotificationActionHandler for ViewAction {
    async fn handle(
        &self,
        click: &NotificationClick,
        context: &ActionContext<'_>,
    ) -> Result<(), AgentError> {
        context.open_target(&click.data).await
    }
}

struct DismissAction;

#[async_trait]
impl NotificationActionHandler for DismissAction {
    async fn handle(
        &self,
        _click: &NotificationClick,
        _context: &ActionContext<'_>,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Action handlers by id.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn NotificationActionHandler>>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A registry with `view` and `dismiss`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("view", Arc::new(ViewAction));
        registry.register("dismiss", Arc::new(DismissAction));
        registry
    }

    /// Register or replace the handler for `id`.
    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn NotificationActionHandler>) {
        self.handlers.insert(id.into(), handler);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Run the handler for `id`. Unknown ids are logged and ignored.
    pub async fn dispatch(
        &self,
        id: &str,
        click: &NotificationClick,
        context: &ActionContext<'_>,
    ) -> Result<(), AgentError> {
        match self.handlers.get(id) {
            Some(handler) => {
                debug!(action = %id, "Dispatching notification action");
                handler.handle(click, context).await
            }
            None => {
                warn!(action = %id, "Unknown notification action");
                Ok(())
            }
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
