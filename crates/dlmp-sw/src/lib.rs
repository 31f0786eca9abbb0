//! # DLMP Offline Agent
//!
//! Offline caching layer for the DLMP case-management console.
//!
//! ## Features
//!
//! - **Precaching**: the application shell is stored when a version installs
//! - **Request policies**: network-first for API traffic, cache-first with
//!   background refresh for static assets, synthetic fallbacks when offline
//! - **Versioning**: one namespace per version, stale ones purged on activation
//! - **Control channel**: skip waiting, version query, cache clear, ad-hoc caching
//! - **Background sync and push**: deferred work on reconnect, notifications
//!   with action routing
//!
//! ## Architecture
//!
//! ```text
//! Registration (host side)
//!     ├── installing / waiting / active (Agent)
//!     └── Clients
//!
//! Agent
//!     ├── Classifier ──→ PolicyEngine ──→ CacheStore
//!     │                        └────────→ Fetcher (network)
//!     ├── LifecycleController
//!     ├── control (ControlMessage → ControlReply)
//!     ├── SyncTask
//!     └── Shell + ActionRegistry (notifications)
//! ```

use dlmp_common::CommonError;
use dlmp_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod classify;
pub mod config;
pub mod control;
pub mod event;
pub mod lifecycle;
pub mod policy;
pub mod push;
pub mod registration;
pub mod store;
pub mod sync;
pub mod testing;

pub use agent::{Agent, AgentBuilder, AgentId};
pub use classify::{Bucket, Classifier, PatternRule, RequestClass};
pub use config::{AgentConfig, NotificationDefaults};
pub use control::{
    rpc_channel, CacheUrlsPayload, ControlClient, ControlCommand, ControlMessage, ControlReply,
    PendingReply, ReplyPort,
};
pub use event::ExtendableEvent;
pub use lifecycle::{AgentState, LifecycleController};
pub use policy::PolicyEngine;
pub use push::{
    ActionContext, ActionRegistry, NotificationAction, NotificationActionHandler,
    NotificationClick, NotificationData, NotificationId, NotificationPayload, PushMessage,
    RecordingShell, Shell,
};
pub use registration::{Client, ClientId, Clients, Registration, RegistrationEvent};
pub use store::{CacheEntry, CacheKey, CacheStore, MemoryCacheStore, StoreError};
pub use sync::{OutboxSync, SyncTask};

// ==================== Errors ====================

/// Errors that can occur in agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Reply channel closed")]
    ChannelClosed,
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
