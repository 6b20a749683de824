//! Service-base-URL lookup used by [`DestinationStage::service_destination`].
//!
//! [`DestinationStage::service_destination`]: crate::builder::DestinationStage::service_destination

use std::collections::HashMap;

/// Environment key of the user service base URL.
pub const USER_SERVICE_URL: &str = "USER_SERVICE_URL";
/// Environment key of the ticket service base URL.
pub const TICKET_SERVICE_URL: &str = "TICKET_SERVICE_URL";

/// Resolves a service key to its base URL.
pub trait ServiceRegistry: Send + Sync {
    /// Returns `None` when the key is unknown.
    fn resolve(&self, key: &str) -> Option<String>;
}

/// Registry backed by process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvRegistry;

impl ServiceRegistry for EnvRegistry {
    fn resolve(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed in-memory registry, mostly for wiring and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn with(mut self, key: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.entries.insert(key.into(), base_url.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, base_url: impl Into<String>) {
        self.entries.insert(key.into(), base_url.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ServiceRegistry for StaticRegistry {
    fn resolve(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticRegistry {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Joins a base URL and an endpoint path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
