//! Supervised background tasks.
//!
//! Every unit of work the agent schedules runs through [`spawn_guarded`]. A
//! returned error is logged as a warning and a panic is caught and logged as
//! an error; neither reaches the code that scheduled the work.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// Spawn a fallible unit of work whose failures are logged and swallowed.
pub fn spawn_guarded<F, E>(label: impl Into<String>, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let label = label.into();
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => trace!(task = %label, "Task completed"),
            Ok(Err(e)) => warn!(task = %label, error = %e, "Task failed"),
            Err(panic) => {
                error!(task = %label, panic = %panic_message(panic.as_ref()), "Task panicked")
            }
        }
    })
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
