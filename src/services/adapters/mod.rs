//! Source adapters.
//!
//! Every external collaborator implements [`SourceAdapter`]; the
//! [`AdapterRegistry`] maps source identifiers to implementations. Adding a
//! source means one implementation plus one `register` call.

mod smartraveller;
mod uk_fcdo;
mod us_state_dept;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AdvisoryRecord, RawContent};

pub use smartraveller::SmartravellerAdapter;
pub use uk_fcdo::UkFcdoAdapter;
pub use us_state_dept::UsStateDeptAdapter;

/// Capability interface implemented once per external source.
///
/// Adapters perform the network call and parsing only. They never persist
/// anything and never touch rate-limit or breaker state. `fetch` is cancelled
/// by dropping its future.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable source identifier.
    fn id(&self) -> &str;

    /// Fetch raw content for one country, or the source's listing when `None`.
    async fn fetch(&self, country: Option<&str>, timeout: Duration) -> Result<RawContent>;

    /// Parse raw content. `Ok(None)` means the source has no advisory for
    /// the query, which is not an error.
    fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>>;

    /// Whether the source currently answers.
    async fn health_check(&self) -> bool;

    /// Countries named on the source's listing, i.e. the content of
    /// `fetch(None, ..)`. An all-countries job expands into these when
    /// configuration lists none. An empty list means the listing is parsed
    /// as the job's only advisory.
    fn countries(&self, listing: &RawContent) -> Result<Vec<String>> {
        let _ = listing;
        Ok(Vec::new())
    }
}

/// Registry of adapters keyed by source identifier.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter sharing one HTTP client.
    pub fn builtin(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UsStateDeptAdapter::new(client.clone())));
        registry.register(Arc::new(UkFcdoAdapter::new(client.clone())));
        registry.register(Arc::new(SmartravellerAdapter::new(client)));
        registry
    }

    /// Add or replace an adapter under its own id.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        let id = adapter.id().to_string();
        if self.adapters.insert(id.clone(), adapter).is_some() {
            log::warn!("Adapter '{}' replaced in registry", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
