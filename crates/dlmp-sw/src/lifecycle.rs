//! Agent lifecycle.
//!
//! ```text
//! Installing ──precache ok──→ Waiting ──(no older controller | skip-waiting)──→ Activating
//!     │                                                                          │
//!     └──precache failed──→ Redundant ←──superseded── Active ←──GC + claim───────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use dlmp_net::Fetcher;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::store::{fetch_and_store, CacheStore};
use crate::AgentError;

/// Lifecycle state of an agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentState {
    /// Precaching the manifest.
    #[default]
    Installing,
    /// Installed, waiting for older versions to release their clients.
    Waiting,
    /// Deleting stale namespaces and claiming clients.
    Activating,
    /// Serving traffic.
    Active,
    /// Discarded: install failed or superseded.
    Redundant,
}

/// Drives one agent version through its states.
pub struct LifecycleController {
    state: watch::Sender<AgentState>,
    namespace: String,
    skip_waiting: AtomicBool,
    skip_notify: Notify,
}

impl LifecycleController {
    /// Create a controller in `Installing`.
    pub fn new(namespace: impl Into<String>) -> Self {
        let (state, _) = watch::channel(AgentState::Installing);
        Self {
            state,
            namespace: namespace.into(),
            skip_waiting: AtomicBool::new(false),
            skip_notify: Notify::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Precache `manifest` into this version's namespace.
    ///
    /// Every URL is fetched before anything is written; one failure discards
    /// the version and leaves the store as it was.
    pub async fn install(
        &self,
        store: &dyn CacheStore,
        network: &dyn Fetcher,
        manifest: &[Url],
    ) -> Result<(), AgentError> {
        self.expect(AgentState::Installing)?;
        info!(namespace = %self.namespace, entries = manifest.len(), "Installing");

        let existed = match store.namespaces().await {
            Ok(names) => names.iter().any(|n| n == &self.namespace),
            Err(_) => true,
        };

        match fetch_and_store(store, network, &self.namespace, manifest).await {
            Ok(count) => {
                debug!(namespace = %self.namespace, entries = count, "Precache complete");
                self.transition(AgentState::Installing, AgentState::Waiting)?;
                Ok(())
            }
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Precache failed, discarding version");
                if !existed {
                    if let Err(e) = store.delete(&self.namespace).await {
                        warn!(namespace = %self.namespace, error = %e, "Cleanup after failed install failed");
                    }
                }
                self.mark_redundant();
                Err(AgentError::InstallFailed(e.to_string()))
            }
        }
    }

    /// Move `Waiting → Activating`.
    pub fn begin_activation(&self) -> Result<(), AgentError> {
        self.transition(AgentState::Waiting, AgentState::Activating)
    }

    /// Delete every namespace but this version's. Failures are logged and skipped.
    pub async fn collect_garbage(&self, store: &dyn CacheStore) -> usize {
        let names = match store.namespaces().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Cannot enumerate namespaces, skipping cleanup");
                return 0;
            }
        };

        let mut deleted = 0;
        for name in names.iter().filter(|n| **n != self.namespace) {
            match store.delete(name).await {
                Ok(_) => {
                    info!(namespace = %name, "Deleted stale namespace");
                    deleted += 1;
                }
                Err(e) => warn!(namespace = %name, error = %e, "Failed to delete stale namespace"),
            }
        }
        deleted
    }

    /// Move `Activating → Active`.
    pub fn finish_activation(&self) -> Result<(), AgentError> {
        self.transition(AgentState::Activating, AgentState::Active)
    }

    /// Discard this version.
    pub fn mark_redundant(&self) {
        let previous = self.state.send_replace(AgentState::Redundant);
        if previous != AgentState::Redundant {
            info!(namespace = %self.namespace, from = ?previous, "Version is redundant");
        }
    }

    /// Request activation without waiting for older versions to release clients.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.skip_notify.notify_one();
        debug!(namespace = %self.namespace, "Skip waiting requested");
    }

    /// Whether skip-waiting was requested.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Resolve once skip-waiting has been requested.
    pub async fn wait_for_skip(&self) {
        if self.skip_waiting_requested() {
            return;
        }
        self.skip_notify.notified().await;
    }

    fn expect(&self, expected: AgentState) -> Result<(), AgentError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(AgentError::State(format!("expected {expected:?}, was {state:?}")))
        }
    }

    fn transition(&self, from: AgentState, to: AgentState) -> Result<(), AgentError> {
        let mut current = from;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            info!(namespace = %self.namespace, from = ?from, to = ?to, "Lifecycle transition");
            Ok(())
        } else {
            Err(AgentError::State(format!(
                "cannot move from {current:?} to {to:?}"
            )))
        }
    }
}
