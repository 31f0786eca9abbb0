//! Host-side registration of agent versions.
//!
//! Tracks the installing, waiting and active agent, the open clients each
//! one controls, and host connectivity. At most one agent is active; a new
//! version waits until no client is controlled by the old one, unless it asks
//! to skip waiting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dlmp_common::spawn_guarded;
use dlmp_net::{InterceptAction, InterceptHandler, Request};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{Agent, AgentId};
use crate::lifecycle::AgentState;
use crate::AgentError;

/// Identifier of an open client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An open consumer context (a tab or window) of the host application.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// The agent answering this client's requests.
    pub controller: Option<AgentId>,
}

/// The set of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: Vec<Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, url: Url, controller: Option<AgentId>) -> ClientId {
        let id = ClientId::new();
        self.clients.push(Client {
            id,
            url,
            controller,
        });
        id
    }

    pub fn close(&mut self, id: ClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c.id != id);
        self.clients.len() != before
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Put every client under `agent`. Returns how many changed controller.
    pub fn claim(&mut self, agent: AgentId) -> usize {
        let mut claimed = 0;
        for client in &mut self.clients {
            if client.controller != Some(agent) {
                client.controller = Some(agent);
                claimed += 1;
            }
        }
        claimed
    }

    pub fn controlled_by(&self, agent: AgentId) -> usize {
        self.clients
            .iter()
            .filter(|c| c.controller == Some(agent))
            .count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Notifications published to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    StateChange { version: String, state: AgentState },
    /// A new version now controls the clients.
    ControllerChange { version: String },
    InstallFailed { version: String, error: String },
    ConnectivityChange { online: bool },
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Agent>>,
    waiting: Option<Arc<Agent>>,
    active: Option<Arc<Agent>>,
    clients: Clients,
}

/// Registration of the offline agent for one scope.
pub struct Registration {
    scope: Url,
    slots: Mutex<Slots>,
    events: mpsc::UnboundedSender<RegistrationEvent>,
    online: AtomicBool,
}

impl Registration {
    /// Create an empty registration and the receiver of its events.
    pub fn new(scope: Url) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registration = Arc::new(Self {
            scope,
            slots: Mutex::new(Slots::default()),
            events,
            online: AtomicBool::new(true),
        });
        (registration, rx)
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub async fn installing(&self) -> Option<Arc<Agent>> {
        self.slots.lock().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<Agent>> {
        self.slots.lock().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<Agent>> {
        self.slots.lock().await.active.clone()
    }

    /// Install `agent` and make it active as soon as the rules allow.
    ///
    /// A failed install leaves the current active agent in charge.
    pub async fn register(self: &Arc<Self>, agent: Agent) -> Result<Arc<Agent>, AgentError> {
        let agent = Arc::new(agent);
        let version = agent.version().to_string();
        info!(scope = %self.scope, version = %version, "Registering agent");

        self.slots.lock().await.installing = Some(Arc::clone(&agent));
        self.emit(RegistrationEvent::UpdateFound {
            version: version.clone(),
        });

        let installed = agent.install().await;

        let mut slots = self.slots.lock().await;
        if slots
            .installing
            .as_ref()
            .is_some_and(|a| a.id() == agent.id())
        {
            slots.installing = None;
        }

        if let Err(e) = installed {
            drop(slots);
            warn!(version = %version, error = %e, "Install failed, keeping current agent");
            self.emit(RegistrationEvent::InstallFailed {
                version: version.clone(),
                error: e.to_string(),
            });
            self.emit_state(&agent);
            return Err(e);
        }

        if let Some(previous) = slots.waiting.replace(Arc::clone(&agent)) {
            previous.mark_redundant();
            self.emit_state(&previous);
        }
        self.emit_state(&agent);

        let blocked = slots
            .active
            .as_ref()
            .is_some_and(|active| slots.clients.controlled_by(active.id()) > 0);
        drop(slots);

        if blocked && !agent.skip_waiting_requested() {
            debug!(version = %version, "Waiting for older version to release its clients");
            self.watch_skip_waiting(Arc::clone(&agent));
        } else {
            self.activate_waiting(agent.id()).await?;
        }
        Ok(agent)
    }

    /// Open a client controlled by the current active agent.
    pub async fn open_client(&self, url: Url) -> ClientId {
        let mut slots = self.slots.lock().await;
        let controller = slots.active.as_ref().map(|a| a.id());
        slots.clients.open(url, controller)
    }

    /// Close a client. The waiting agent activates once the old one controls none.
    pub async fn close_client(&self, id: ClientId) -> Result<(), AgentError> {
        let pending = {
            let mut slots = self.slots.lock().await;
            slots.clients.close(id);
            match (&slots.waiting, &slots.active) {
                (Some(waiting), Some(active)) if slots.clients.controlled_by(active.id()) == 0 => {
                    Some(waiting.id())
                }
                (Some(waiting), None) => Some(waiting.id()),
                _ => None,
            }
        };
        if let Some(id) = pending {
            self.activate_waiting(id).await?;
        }
        Ok(())
    }

    /// The agent controlling `client`.
    pub async fn controller_of(&self, client: ClientId) -> Option<AgentId> {
        self.slots
            .lock()
            .await
            .clients
            .get(client)
            .and_then(|c| c.controller)
    }

    /// Record a connectivity change. Reconnecting triggers a sync on the active agent.
    pub async fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        info!(online, "Connectivity changed");
        self.emit(RegistrationEvent::ConnectivityChange { online });

        if online {
            if let Some(agent) = self.active().await {
                let tag = agent.config().sync_tag.clone();
                agent.handle_sync(&tag).await;
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Promote the waiting agent if it is still `id`.
    async fn activate_waiting(&self, id: AgentId) -> Result<(), AgentError> {
        let mut slots = self.slots.lock().await;
        let agent = match slots.waiting.take() {
            Some(agent) if agent.id() == id => agent,
            other => {
                slots.waiting = other;
                return Ok(());
            }
        };

        if agent.state() != AgentState::Waiting {
            return Err(AgentError::State(format!(
                "cannot activate {} from {:?}",
                agent.version(),
                agent.state()
            )));
        }

        // The outgoing version must stop writing before its namespace is collected.
        if let Some(previous) = slots.active.take() {
            previous.mark_redundant();
            self.emit_state(&previous);
        }

        if let Err(e) = agent.activate(&mut slots.clients).await {
            warn!(version = %agent.version(), error = %e, "Activation failed");
            agent.mark_redundant();
            self.emit_state(&agent);
            return Err(e);
        }
        slots.active = Some(Arc::clone(&agent));
        drop(slots);

        self.emit_state(&agent);
        self.emit(RegistrationEvent::ControllerChange {
            version: agent.version().to_string(),
        });
        Ok(())
    }

    fn watch_skip_waiting(self: &Arc<Self>, agent: Arc<Agent>) {
        let registration: Weak<Self> = Arc::downgrade(self);
        let mut state = agent.subscribe();
        spawn_guarded(format!("skip-waiting {}", agent.id()), async move {
            tokio::select! {
                _ = agent.wait_for_skip() => {}
                _ = state.wait_for(|s| *s != AgentState::Waiting) => return Ok(()),
            }
            match registration.upgrade() {
                Some(registration) => registration.activate_waiting(agent.id()).await,
                None => Ok(()),
            }
        });
    }

    fn emit_state(&self, agent: &Agent) {
        self.emit(RegistrationEvent::StateChange {
            version: agent.version().to_string(),
            state: agent.state(),
        });
    }

    fn emit(&self, event: RegistrationEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for registration events");
        }
    }
}

#[async_trait]
impl InterceptHandler for Registration {
    async fn intercept(&self, request: &Request) -> InterceptAction {
        match self.active().await {
            Some(agent) => agent.intercept(request).await,
            None => InterceptAction::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::RecordingShell;
    use crate::testing::ScriptedFetcher;
    use crate::AgentConfig;
    use std::time::Duration;

    fn scope() -> Url {
        Url::parse("http://localhost:3000/").unwrap()
    }

    fn serving(config: &AgentConfig) -> Arc<ScriptedFetcher> {
        let network = Arc::new(ScriptedFetcher::new());
        for path in &config.precache {
            network.respond(config.resolve(path).unwrap().as_str(), 200, "page");
        }
        network
    }

    fn agent(version: &str, network: Arc<ScriptedFetcher>) -> Agent {
        Agent::builder(AgentConfig::default().with_version(version))
            .network(network)
            .shell(Arc::new(RecordingShell::new()))
            .build()
            .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RegistrationEvent>) -> Vec<RegistrationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_clients() {
        let mut clients = Clients::new();
        let a = clients.open(scope(), None);
        let b = clients.open(scope(), None);
        let agent = AgentId::new();

        assert_eq!(clients.claim(agent), 2);
        assert_eq!(clients.claim(agent), 0);
        assert_eq!(clients.controlled_by(agent), 2);
        assert!(clients.close(a));
        assert!(!clients.close(a));
        assert_eq!(clients.len(), 1);
        assert_eq!(clients.get(b).unwrap().controller, Some(agent));
    }

    #[tokio::test]
    async fn test_first_agent_activates_immediately() {
        let network = serving(&AgentConfig::default());
        let (registration, mut rx) = Registration::new(scope());

        let agent = registration.register(agent("1.0.0", network)).await.unwrap();

        assert_eq!(agent.state(), AgentState::Active);
        assert_eq!(registration.active().await.unwrap().id(), agent.id());
        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&RegistrationEvent::UpdateFound {
                version: "1.0.0".to_string()
            })
        );
        assert!(events.contains(&RegistrationEvent::ControllerChange {
            version: "1.0.0".to_string()
        }));
    }

    #[tokio::test]
    async fn test_failed_install_keeps_active() {
        let network = serving(&AgentConfig::default());
        let (registration, mut rx) = Registration::new(scope());
        let v1 = registration
            .register(agent("1.0.0", network.clone()))
            .await
            .unwrap();

        network.set_offline(true);
        assert!(registration
            .register(agent("2.0.0", network.clone()))
            .await
            .is_err());

        assert_eq!(registration.active().await.unwrap().id(), v1.id());
        assert_eq!(v1.state(), AgentState::Active);
        assert!(registration.waiting().await.is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            RegistrationEvent::InstallFailed { version, .. } if version == "2.0.0"
        )));
    }

    #[tokio::test]
    async fn test_new_version_waits_for_clients() {
        let network = serving(&AgentConfig::default());
        let (registration, _rx) = Registration::new(scope());
        let v1 = registration
            .register(agent("1.0.0", network.clone()))
            .await
            .unwrap();
        let client = registration.open_client(scope()).await;
        assert_eq!(registration.controller_of(client).await, Some(v1.id()));

        let v2 = registration
            .register(agent("2.0.0", network.clone()))
            .await
            .unwrap();
        assert_eq!(v2.state(), AgentState::Waiting);
        assert_eq!(registration.active().await.unwrap().id(), v1.id());

        registration.close_client(client).await.unwrap();
        assert_eq!(v2.state(), AgentState::Active);
        assert_eq!(v1.state(), AgentState::Redundant);
    }

    #[tokio::test]
    async fn test_skip_waiting_activates() {
        let network = serving(&AgentConfig::default());
        let (registration, _rx) = Registration::new(scope());
        let v1 = registration
            .register(agent("1.0.0", network.clone()))
            .await
            .unwrap();
        let client = registration.open_client(scope()).await;

        let v2 = registration
            .register(agent("2.0.0", network.clone()))
            .await
            .unwrap();
        assert_eq!(v2.state(), AgentState::Waiting);

        let mut state = v2.subscribe();
        v2.skip_waiting();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == AgentState::Active),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(v1.state(), AgentState::Redundant);
        assert_eq!(registration.controller_of(client).await, Some(v2.id()));
    }

    #[tokio::test]
    async fn test_connectivity_events() {
        let (registration, mut rx) = Registration::new(scope());
        registration.set_online(true).await;
        assert!(drain(&mut rx).is_empty());

        registration.set_online(false).await;
        registration.set_online(true).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                RegistrationEvent::ConnectivityChange { online: false },
                RegistrationEvent::ConnectivityChange { online: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_intercept_without_active_continues() {
        let (registration, _rx) = Registration::new(scope());
        let action = registration
            .intercept(&Request::get(scope().join("/app.js").unwrap()))
            .await;
        assert!(matches!(action, InterceptAction::Continue));
    }
}
