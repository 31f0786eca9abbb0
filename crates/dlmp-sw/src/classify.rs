//! Request classification.
//!
//! Only same-origin GET requests are handled by the agent. Everything else
//! is passed through to the network untouched.

use http::Method;
use regex::Regex;
use tracing::trace;
use url::Origin;

use dlmp_net::Request;

use crate::{AgentConfig, AgentError};

/// Policy bucket of a handled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Explicitly excluded from caching; network-first, never written.
    NoCache,
    /// Whitelisted API; network-first, successful responses persisted.
    CacheableApi,
    /// Any other API traffic; network-first, never written.
    ApiNoStore,
    /// Everything else on the origin; cache-first with background refresh.
    StaticAsset,
}

impl RequestClass {
    /// Whether the network is consulted before the cache.
    pub fn is_network_first(&self) -> bool {
        !matches!(self, RequestClass::StaticAsset)
    }

    /// Whether successful responses are written to the cache.
    pub fn persists(&self) -> bool {
        matches!(self, RequestClass::CacheableApi | RequestClass::StaticAsset)
    }
}

/// Which list a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    NoCache,
    CacheableApi,
}

/// A path predicate.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub bucket: Bucket,
    pattern: Regex,
}

impl PatternRule {
    /// Compile a rule.
    pub fn new(bucket: Bucket, pattern: &str) -> Result<Self, AgentError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AgentError::Config(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self { bucket, pattern })
    }

    /// Check if a path matches.
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Decides which policy applies to a request.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    api_root: String,
    rules: Vec<PatternRule>,
}

impl Classifier {
    /// Build a classifier from the configured patterns, preserving their order.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let mut rules = Vec::with_capacity(
            config.no_cache_patterns.len() + config.api_cache_patterns.len(),
        );
        for pattern in &config.no_cache_patterns {
            rules.push(PatternRule::new(Bucket::NoCache, pattern)?);
        }
        for pattern in &config.api_cache_patterns {
            rules.push(PatternRule::new(Bucket::CacheableApi, pattern)?);
        }

        Ok(Self {
            origin: config.origin.origin(),
            api_root: config.api_root.clone(),
            rules,
        })
    }

    /// Classify a request. `None` means pass through.
    pub fn classify(&self, request: &Request) -> Option<RequestClass> {
        if request.method != Method::GET || request.url.origin() != self.origin {
            trace!(url = %request.url, method = %request.method, "Passing through");
            return None;
        }

        let path = request.url.path();
        let class = if self.first_match(Bucket::NoCache, path).is_some() {
            RequestClass::NoCache
        } else if path.starts_with(&self.api_root) {
            if self.first_match(Bucket::CacheableApi, path).is_some() {
                RequestClass::CacheableApi
            } else {
                RequestClass::ApiNoStore
            }
        } else {
            RequestClass::StaticAsset
        };

        trace!(url = %request.url, class = ?class, "Classified request");
        Some(class)
    }

    fn first_match(&self, bucket: Bucket, path: &str) -> Option<&PatternRule> {
        self.rules
            .iter()
            .filter(|r| r.bucket == bucket)
            .find(|r| r.matches(path))
    }
}
