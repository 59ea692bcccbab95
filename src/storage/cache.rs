//! TTL cache for source responses.
//!
//! Not durable. Entries expire after their TTL and are evicted lazily on
//! access or when the cache is full.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::utils::lock;

/// Reproducible key built from operation, source and query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Params are sorted, so the same query always yields the same key.
    pub fn new<'a>(
        operation: &str,
        source_id: &str,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut params: Vec<_> = params.into_iter().collect();
        params.sort();
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        Self(format!("{operation}:{source_id}:{query}"))
    }

    /// Key for a raw fetch of one country, or the listing when `None`.
    pub fn fetch(source_id: &str, country: Option<&str>) -> Self {
        Self::new("fetch", source_id, [("country", country.unwrap_or("*"))])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Bounded key/value store with per-entry expiry.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<CacheKey, Entry<V>>>,
    max_entries: usize,
}

impl<V: Clone> TtlCache<V> {
    /// `max_entries == 0` means unbounded.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite. A zero TTL stores nothing.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = lock(&self.entries);
        let now = Instant::now();

        if self.max_entries > 0
            && entries.len() >= self.max_entries
            && !entries.contains_key(&key)
        {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) {
        lock(&self.entries).remove(key);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
