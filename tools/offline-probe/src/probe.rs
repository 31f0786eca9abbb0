//! Probe plumbing: configuration loading, a network that can be unplugged,
//! and result formatting.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dlmp_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response, Url};
use dlmp_sw::{AgentConfig, AgentError, ControlReply, NotificationPayload};
use serde::Serialize;
use thiserror::Error;

/// Errors that end a probe run.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load the agent configuration, applying an origin override.
pub fn load_config(path: Option<&Path>, origin: Option<&str>) -> Result<AgentConfig, ProbeError> {
    let mut config = match path {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(origin) = origin {
        config.origin = Url::parse(origin)
            .map_err(|e| ProbeError::Argument(format!("origin {origin:?}: {e}")))?;
        config.validate()?;
    }
    Ok(config)
}

/// Live HTTP that can be switched off to observe offline behaviour.
pub struct ProbeNetwork {
    http: HttpFetcher,
    unplugged: AtomicBool,
}

impl ProbeNetwork {
    pub fn new() -> Result<Self, NetError> {
        Ok(Self {
            http: HttpFetcher::new(LoaderConfig::default())?,
            unplugged: AtomicBool::new(false),
        })
    }

    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for ProbeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        self.http.fetch(request).await
    }
}

/// Which network condition a fetch ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Online,
    Offline,
}

/// Result of fetching one path through the loader.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub pass: Pass,
    pub url: String,
    pub status: Option<u16>,
    pub source: Option<String>,
    pub bytes: usize,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn from_result(pass: Pass, url: &Url, result: Result<Response, NetError>) -> Self {
        match result {
            Ok(response) => Self {
                pass,
                url: url.to_string(),
                status: Some(response.status.as_u16()),
                source: Some(format!("{:?}", response.source).to_lowercase()),
                bytes: response.bytes().len(),
                error: None,
            },
            Err(e) => Self {
                pass,
                url: url.to_string(),
                status: None,
                source: None,
                bytes: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pass = match self.pass {
            Pass::Online => "online ",
            Pass::Offline => "offline",
        };
        match (&self.status, &self.error) {
            (Some(status), _) => write!(
                f,
                "[{pass}] {status} {:<8} {:>8} B  {}",
                self.source.as_deref().unwrap_or("-"),
                self.bytes,
                self.url
            ),
            (None, Some(error)) => write!(f, "[{pass}] ERR {}  ({error})", self.url),
            (None, None) => write!(f, "[{pass}] ??? {}", self.url),
        }
    }
}

/// What a push payload produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum PushOutcome {
    Shown { notification: NotificationPayload },
    Ignored,
}

/// What a control message produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlOutcome {
    Reply { reply: ControlReply },
    NoReply,
}

/// Print `value` as pretty JSON, or through `text` otherwise.
pub fn emit<T: Serialize>(
    value: &T,
    json: bool,
    text: impl FnOnce(&T) -> String,
) -> Result<(), ProbeError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}
