//! The agent: one version of the offline layer with a typed entry point per trigger.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dlmp_net::{Fetcher, InterceptAction, InterceptHandler, Request, Response};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::classify::Classifier;
use crate::config::AgentConfig;
use crate::control::{self, ControlCommand, ControlMessage, ControlReply};
use crate::event::ExtendableEvent;
use crate::lifecycle::{AgentState, LifecycleController};
use crate::policy::PolicyEngine;
use crate::push::{
    ActionContext, ActionRegistry, NotificationActionHandler, NotificationClick, NotificationId,
    PushMessage, Shell,
};
use crate::registration::Clients;
use crate::store::{CacheStore, MemoryCacheStore};
use crate::sync::SyncTask;
use crate::AgentError;

/// Unique identifier for an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(u64);

impl AgentId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    store: Option<Arc<dyn CacheStore>>,
    network: Option<Arc<dyn Fetcher>>,
    shell: Option<Arc<dyn Shell>>,
    sync_task: Option<Arc<dyn SyncTask>>,
    actions: ActionRegistry,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            store: None,
            network: None,
            shell: None,
            sync_task: None,
            actions: ActionRegistry::with_builtins(),
        }
    }

    /// Cache storage. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Network access. Required.
    pub fn network(mut self, network: Arc<dyn Fetcher>) -> Self {
        self.network = Some(network);
        self
    }

    /// Notification and window surface. Required.
    pub fn shell(mut self, shell: Arc<dyn Shell>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Work run on the configured sync tag.
    pub fn sync_task(mut self, task: Arc<dyn SyncTask>) -> Self {
        self.sync_task = Some(task);
        self
    }

    /// Register a notification action handler, replacing a built-in of the same id.
    pub fn action(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn NotificationActionHandler>,
    ) -> Self {
        self.actions.register(id, handler);
        self
    }

    /// Validate the configuration and assemble the agent.
    pub fn build(self) -> Result<Agent, AgentError> {
        self.config.validate()?;
        let network = self
            .network
            .ok_or_else(|| AgentError::Config("agent needs a network fetcher".to_string()))?;
        let shell = self
            .shell
            .ok_or_else(|| AgentError::Config("agent needs a shell".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCacheStore::new()) as Arc<dyn CacheStore>);

        let classifier = Classifier::from_config(&self.config)?;
        let manifest = self
            .config
            .precache
            .iter()
            .map(|path| self.config.resolve(path))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_page = self.config.resolve(&self.config.offline_page)?;
        let namespace = self.config.namespace();

        let lifecycle = LifecycleController::new(namespace.clone());
        let policy = PolicyEngine::new(
            Arc::clone(&store),
            Arc::clone(&network),
            namespace,
            offline_page,
            lifecycle.subscribe(),
        );

        let agent = Agent {
            id: AgentId::new(),
            lifecycle,
            config: Arc::new(self.config),
            classifier,
            policy,
            manifest,
            store,
            network,
            shell,
            actions: Arc::new(self.actions),
            sync_task: self.sync_task,
            keepalive: ExtendableEvent::new(),
        };
        debug!(agent = %agent.id, namespace = %agent.namespace(), "Agent built");
        Ok(agent)
    }
}

/// One version of the offline caching agent.
///
/// Holds no global state: everything it needs is injected through
/// [`AgentBuilder`]. Each trigger has its own entry point.
pub struct Agent {
    id: AgentId,
    config: Arc<AgentConfig>,
    classifier: Classifier,
    policy: PolicyEngine,
    lifecycle: LifecycleController,
    manifest: Vec<Url>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    shell: Arc<dyn Shell>,
    actions: Arc<ActionRegistry>,
    sync_task: Option<Arc<dyn SyncTask>>,
    keepalive: ExtendableEvent,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Name of the namespace this version reads and writes.
    pub fn namespace(&self) -> &str {
        self.policy.namespace()
    }

    pub fn state(&self) -> AgentState {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.lifecycle.subscribe()
    }

    /// The resolved precache manifest.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    /// Precache the manifest. On failure the agent is redundant.
    pub async fn install(&self) -> Result<(), AgentError> {
        self.lifecycle
            .install(self.store.as_ref(), self.network.as_ref(), &self.manifest)
            .await
    }

    /// Delete stale namespaces, take control of `clients` and start serving.
    pub async fn activate(&self, clients: &mut Clients) -> Result<usize, AgentError> {
        self.lifecycle.begin_activation()?;
        let deleted = self.lifecycle.collect_garbage(self.store.as_ref()).await;
        let claimed = clients.claim(self.id);
        self.lifecycle.finish_activation()?;
        info!(agent = %self.id, version = %self.version(), deleted, claimed, "Agent active");
        Ok(claimed)
    }

    /// Ask to be activated without waiting for older versions.
    pub fn skip_waiting(&self) {
        self.lifecycle.skip_waiting();
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.skip_waiting_requested()
    }

    pub(crate) async fn wait_for_skip(&self) {
        self.lifecycle.wait_for_skip().await
    }

    /// Discard this version.
    pub fn mark_redundant(&self) {
        self.lifecycle.mark_redundant();
    }

    /// Answer an intercepted request.
    ///
    /// `None` means the request is not handled and goes to the network as is:
    /// the agent is not active, or the request is cross-origin or not a GET.
    /// Background writes are registered on `event`.
    pub async fn handle_fetch(
        &self,
        request: &Request,
        event: &ExtendableEvent,
    ) -> Option<Response> {
        if self.state() != AgentState::Active {
            trace!(url = %request.url, state = ?self.state(), "Agent not active");
            return None;
        }
        let class = self.classifier.classify(request)?;
        Some(self.policy.handle(request, class, event).await)
    }

    /// Handle a control message. Unknown commands get no reply.
    pub async fn handle_message(&self, message: ControlMessage) {
        let ControlMessage { data, reply } = message;
        let command = match ControlCommand::from_value(&data) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring control message");
                return;
            }
        };
        debug!(command = ?command, "Control message");

        let response = match command {
            ControlCommand::SkipWaiting => {
                self.skip_waiting();
                None
            }
            ControlCommand::GetVersion => Some(ControlReply::Version {
                version: self.version().to_string(),
            }),
            ControlCommand::ClearCache => Some(
                match control::clear_all(self.store.as_ref()).await {
                    Ok(_) => ControlReply::success(),
                    Err(e) => ControlReply::failure(e),
                },
            ),
            ControlCommand::CacheUrls(payload) => Some(self.cache_urls(&payload.urls).await),
        };

        match (response, reply) {
            (Some(response), Some(port)) => port.send(response),
            (Some(_), None) => debug!("Command expected a reply port, none given"),
            (None, _) => {}
        }
    }

    /// Run the sync task if `tag` is the configured sync tag.
    pub async fn handle_sync(&self, tag: &str) {
        if tag != self.config.sync_tag {
            debug!(tag = %tag, "Ignoring sync event with unknown tag");
            return;
        }
        let Some(task) = self.sync_task.clone() else {
            debug!(tag = %tag, "No sync task registered");
            return;
        };

        info!(tag = %tag, "Background sync");
        let event = ExtendableEvent::new();
        event.wait_until(format!("sync {tag}"), async move { task.run().await });
        event.settled().await;
    }

    /// Show the notification a push payload describes.
    ///
    /// Missing or malformed payloads show nothing.
    pub async fn handle_push(&self, payload: Option<&[u8]>) -> Option<NotificationId> {
        let Some(payload) = payload else {
            debug!("Push without payload ignored");
            return None;
        };
        let notification = match PushMessage::parse(payload) {
            Ok(message) => message.into_notification(&self.config.notification),
            Err(e) => {
                debug!(error = %e, "Push ignored");
                return None;
            }
        };

        let id = NotificationId::new();
        match self.shell.show_notification(id, &notification).await {
            Ok(()) => {
                info!(title = %notification.title, "Notification shown");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "Notification could not be shown");
                None
            }
        }
    }

    /// Close the clicked notification, then route the click.
    pub async fn handle_notification_click(&self, click: NotificationClick) {
        let shell = Arc::clone(&self.shell);
        let actions = Arc::clone(&self.actions);
        let origin = self.config.origin.clone();

        let event = ExtendableEvent::new();
        event.wait_until("notification-click", async move {
            if let Err(e) = shell.close_notification(click.id).await {
                warn!(id = click.id.raw(), error = %e, "Notification could not be closed");
            }
            let context = ActionContext {
                shell: shell.as_ref(),
                origin: &origin,
            };
            match click.action.as_deref() {
                Some(action) => actions.dispatch(action, &click, &context).await,
                None => context.open_target(&click.data).await,
            }
        });
        event.settled().await;
    }

    /// Record an error raised outside any handled unit of work.
    pub fn report_error(&self, source: &str, error: &dyn fmt::Display) {
        error!(agent = %self.id, source = %source, error = %error, "Uncaught agent error");
    }

    /// Wait for work started on the interception path.
    pub async fn settled(&self) {
        self.keepalive.settled().await;
    }

    async fn cache_urls(&self, urls: &[String]) -> ControlReply {
        let resolved = match urls
            .iter()
            .map(|u| self.config.resolve(u))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(resolved) => resolved,
            Err(e) => return ControlReply::failure(e),
        };

        match control::cache_urls(
            self.store.as_ref(),
            self.network.as_ref(),
            self.namespace(),
            &resolved,
        )
        .await
        {
            Ok(_) => ControlReply::success(),
            Err(e) => {
                warn!(error = %e, "CACHE_URLS failed");
                ControlReply::failure(e)
            }
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl InterceptHandler for Agent {
    async fn intercept(&self, request: &Request) -> InterceptAction {
        match self.handle_fetch(request, &self.keepalive).await {
            Some(response) => InterceptAction::Respond(Box::new(response)),
            None => InterceptAction::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlClient;
    use crate::push::{NotificationData, NotificationPayload, RecordingShell};
    use crate::store::CacheKey;
    use crate::sync::OutboxSync;
    use crate::testing::{FailingStore, ScriptedFetcher};
    use bytes::Bytes;
    use dlmp_net::ResponseSource;
    use serde_json::json;
    use std::time::Duration;

    /// Shell that cannot close notifications.
    #[derive(Default)]
    struct StickyShell(RecordingShell);

    #[async_trait]
    impl Shell for StickyShell {
        async fn show_notification(
            &self,
            id: NotificationId,
            notification: &NotificationPayload,
        ) -> Result<(), AgentError> {
            self.0.show_notification(id, notification).await
        }

        async fn close_notification(&self, _id: NotificationId) -> Result<(), AgentError> {
            Err(AgentError::Notification("already gone".to_string()))
        }

        async fn open_window(&self, url: &Url) -> Result<(), AgentError> {
            self.0.open_window(url).await
        }
    }

    struct Fixture {
        agent: Arc<Agent>,
        network: Arc<ScriptedFetcher>,
        shell: Arc<RecordingShell>,
        store: Arc<MemoryCacheStore>,
    }

    fn fixture_with(config: AgentConfig) -> Fixture {
        let network = Arc::new(ScriptedFetcher::new());
        for path in &config.precache {
            network.respond(config.resolve(path).unwrap().as_str(), 200, "precached");
        }
        let shell = Arc::new(RecordingShell::new());
        let store = Arc::new(MemoryCacheStore::new());
        let agent = Agent::builder(config)
            .network(network.clone())
            .shell(shell.clone())
            .store(store.clone())
            .build()
            .unwrap();
        Fixture {
            agent: Arc::new(agent),
            network,
            shell,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AgentConfig::default())
    }

    async fn active(fixture: &Fixture) {
        fixture.agent.install().await.unwrap();
        fixture.agent.activate(&mut Clients::new()).await.unwrap();
    }

    fn url(path: &str) -> Url {
        Url::parse("http://localhost:3000").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_builder_requires_network_and_shell() {
        assert!(matches!(
            Agent::builder(AgentConfig::default()).build(),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            Agent::builder(AgentConfig::default())
                .network(Arc::new(ScriptedFetcher::new()))
                .build(),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_builder_rejects_bad_pattern() {
        let mut config = AgentConfig::default();
        config.no_cache_patterns.push("(".to_string());
        let result = Agent::builder(config)
            .network(Arc::new(ScriptedFetcher::new()))
            .shell(Arc::new(RecordingShell::new()))
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_not_active_passes_through() {
        let f = fixture();
        let event = ExtendableEvent::new();
        assert!(f
            .agent
            .handle_fetch(&Request::get(url("/app.js")), &event)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_activate_claims_and_collects() {
        let f = fixture();
        f.store.open("dlmp-cache-0.9.0").await.unwrap();
        f.agent.install().await.unwrap();

        let mut clients = Clients::new();
        let client = clients.open(url("/"), None);
        assert_eq!(f.agent.activate(&mut clients).await.unwrap(), 1);

        assert_eq!(f.agent.state(), AgentState::Active);
        assert_eq!(clients.get(client).unwrap().controller, Some(f.agent.id()));
        assert_eq!(
            f.store.namespaces().await.unwrap(),
            vec![f.agent.namespace().to_string()]
        );
    }

    #[tokio::test]
    async fn test_activate_survives_gc_failure() {
        let config = AgentConfig::default();
        let network = Arc::new(ScriptedFetcher::new());
        for path in &config.precache {
            network.respond(config.resolve(path).unwrap().as_str(), 200, "precached");
        }
        let store = Arc::new(FailingStore::new());
        store.open("dlmp-cache-0.9.0").await.unwrap();
        let agent = Agent::builder(config)
            .network(network)
            .shell(Arc::new(RecordingShell::new()))
            .store(store.clone())
            .build()
            .unwrap();

        agent.install().await.unwrap();
        store.fail_deletes(true);
        agent.activate(&mut Clients::new()).await.unwrap();

        assert_eq!(agent.state(), AgentState::Active);
        assert_eq!(store.namespaces().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_cross_origin_and_post_pass_through() {
        let f = fixture();
        active(&f).await;
        let event = ExtendableEvent::new();

        let cross = Request::get(Url::parse("https://cdn.example.com/lib.js").unwrap());
        assert!(f.agent.handle_fetch(&cross, &event).await.is_none());

        let post = Request::post(url("/api/cases"), Bytes::new());
        assert!(f.agent.handle_fetch(&post, &event).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_static_asset_cache_first() {
        let f = fixture();
        active(&f).await;
        f.network.respond(url("/app.js").as_str(), 200, "v1");
        let event = ExtendableEvent::new();

        let first = f
            .agent
            .handle_fetch(&Request::get(url("/app.js")), &event)
            .await
            .unwrap();
        assert_eq!(first.source, ResponseSource::Network);

        f.network.set_offline(true);
        let second = f
            .agent
            .handle_fetch(&Request::get(url("/app.js")), &event)
            .await
            .unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.text().unwrap(), "v1");
        event.settled().await;
    }

    #[tokio::test]
    async fn test_intercept_uses_keepalive() {
        let f = fixture();
        active(&f).await;
        f.network
            .respond(url("/api/users/me").as_str(), 200, r#"{"id":1}"#);

        let action = f.agent.intercept(&Request::get(url("/api/users/me"))).await;
        assert!(matches!(action, InterceptAction::Respond(_)));
        f.agent.settled().await;

        let key = CacheKey::get(&url("/api/users/me"));
        assert!(f
            .store
            .match_key(f.agent.namespace(), &key)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_intercept_releases_finished_work() {
        let f = fixture();
        active(&f).await;
        f.network
            .respond(url("/api/users/me").as_str(), 200, r#"{"id":1}"#);

        for _ in 0..1000 {
            f.agent.intercept(&Request::get(url("/api/users/me"))).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.agent.intercept(&Request::get(url("/api/users/me"))).await;

        assert_eq!(f.agent.keepalive.retained(), 1);
        f.agent.settled().await;
        assert_eq!(f.agent.keepalive.retained(), 0);
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let f = fixture();
        active(&f).await;
        let client = ControlClient::new(f.agent.clone());

        assert_eq!(client.get_version().await.unwrap(), "1.0.0");

        f.network.respond(url("/cases/1").as_str(), 200, "case");
        client.cache_urls(vec!["/cases/1".to_string()]).await.unwrap();
        assert!(f
            .store
            .match_key(f.agent.namespace(), &CacheKey::get(&url("/cases/1")))
            .await
            .unwrap()
            .is_some());

        assert!(client
            .cache_urls(vec!["/missing".to_string()])
            .await
            .is_err());

        client.clear_cache().await.unwrap();
        assert!(f.store.namespaces().await.unwrap().is_empty());

        client.skip_waiting().await;
        assert!(f.agent.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_unknown_command_gets_no_reply() {
        let f = fixture();
        let (message, pending) = ControlMessage::request(&ControlCommand::GetVersion);
        let message = ControlMessage {
            data: json!({"type": "REBOOT"}),
            reply: message.reply,
        };
        f.agent.handle_message(message).await;
        assert!(matches!(pending.recv().await, Err(AgentError::ChannelClosed)));

        f.agent
            .handle_message(ControlMessage {
                data: json!(42),
                reply: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_sync_only_for_configured_tag() {
        let network = Arc::new(ScriptedFetcher::new());
        network.respond(url("/api/cases").as_str(), 201, "");
        let outbox = Arc::new(OutboxSync::new(network.clone()));
        outbox
            .enqueue(Request::post(url("/api/cases"), Bytes::new()))
            .await;

        let agent = Agent::builder(AgentConfig::default())
            .network(network.clone())
            .shell(Arc::new(RecordingShell::new()))
            .sync_task(outbox.clone())
            .build()
            .unwrap();

        agent.handle_sync("other-tag").await;
        assert_eq!(outbox.len().await, 1);

        agent.handle_sync("background-sync").await;
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_sync_is_swallowed() {
        let network = Arc::new(ScriptedFetcher::new());
        network.set_offline(true);
        let outbox = Arc::new(OutboxSync::new(network.clone()));
        outbox
            .enqueue(Request::post(url("/api/cases"), Bytes::new()))
            .await;
        let agent = Agent::builder(AgentConfig::default())
            .network(network)
            .shell(Arc::new(RecordingShell::new()))
            .sync_task(outbox.clone())
            .build()
            .unwrap();

        agent.handle_sync("background-sync").await;
        assert_eq!(outbox.len().await, 1);
    }

    #[tokio::test]
    async fn test_push_shows_one_notification() {
        let f = fixture();
        let id = f
            .agent
            .handle_push(Some(br#"{"title":"T","body":"B"}"#))
            .await;
        assert!(id.is_some());

        let shown = f.shell.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].1.title, "T");
        assert_eq!(shown[0].1.body, "B");
    }

    #[tokio::test]
    async fn test_bad_push_shows_nothing() {
        let f = fixture();
        assert!(f.agent.handle_push(Some(b"{oops")).await.is_none());
        assert!(f.agent.handle_push(None).await.is_none());
        assert!(f.shell.shown().is_empty());
    }

    #[tokio::test]
    async fn test_click_body_opens_url_or_root() {
        let f = fixture();
        let id = NotificationId::new();

        f.agent
            .handle_notification_click(NotificationClick {
                id,
                action: None,
                data: NotificationData::default(),
            })
            .await;
        f.agent
            .handle_notification_click(NotificationClick {
                id,
                action: None,
                data: NotificationData {
                    url: Some("/cases/1".to_string()),
                    ..Default::default()
                },
            })
            .await;

        assert_eq!(f.shell.opened(), vec![url("/"), url("/cases/1")]);
        assert_eq!(f.shell.closed(), vec![id, id]);
    }

    #[tokio::test]
    async fn test_click_dismiss_only_closes() {
        let f = fixture();
        f.agent
            .handle_notification_click(NotificationClick {
                id: NotificationId::new(),
                action: Some("dismiss".to_string()),
                data: NotificationData::default(),
            })
            .await;
        assert!(f.shell.opened().is_empty());
        assert_eq!(f.shell.closed().len(), 1);
    }

    #[tokio::test]
    async fn test_click_routes_even_if_close_fails() {
        let shell = Arc::new(StickyShell::default());
        let agent = Agent::builder(AgentConfig::default())
            .network(Arc::new(ScriptedFetcher::new()))
            .shell(shell.clone())
            .build()
            .unwrap();

        agent
            .handle_notification_click(NotificationClick {
                id: NotificationId::new(),
                action: Some("view".to_string()),
                data: NotificationData {
                    url: Some("/cases/9".to_string()),
                    ..Default::default()
                },
            })
            .await;

        assert_eq!(shell.0.opened(), vec![url("/cases/9")]);
    }

    #[tokio::test]
    async fn test_report_error_does_not_panic() {
        let f = fixture();
        f.agent.report_error("unhandled-rejection", &"boom");
    }
}
