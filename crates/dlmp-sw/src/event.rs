//! Event lifetime extension.
//!
//! A triggering event stays alive until every unit of work registered on it
//! has settled, including fire-and-forget cache writes and background
//! revalidation. Hosts await [`ExtendableEvent::settled`] before tearing the
//! agent down.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use dlmp_common::spawn_guarded;
use tokio::task::JoinHandle;

/// Collects the asynchronous work spawned on behalf of one event.
#[derive(Debug, Clone, Default)]
pub struct ExtendableEvent {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExtendableEvent {
    /// Create an event with no outstanding work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `future` settles. Failures are logged.
    pub fn wait_until<F, E>(&self, label: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let handle = spawn_guarded(label, future);
        let mut tasks = self.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Number of registered units that have not finished yet.
    pub fn pending(&self) -> usize {
        self.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Handles still held, finished or not.
    #[cfg(test)]
    pub(crate) fn retained(&self) -> usize {
        self.lock().len()
    }

    /// Wait for all registered work, including work registered while waiting.
    pub async fn settled(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = self.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                // Guarded tasks never fail; a JoinError here means cancellation.
                let _ = handle.await;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
