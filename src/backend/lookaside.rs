//! Lookaside store consulted around the primary dispatch path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

/// External cache the `lookaside` policy consults before delegating to its
/// primary child. Implementations own their eviction; the router only gets
/// and puts.
#[async_trait]
pub trait LookasideStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put(&self, key: String, value: Vec<u8>, ttl: Option<Duration>);
}

/// In-process store backed by a concurrent map. Ships for tests and small
/// single-process deployments; production wires a remote store instead.
///
/// Expired entries are dropped lazily on read; there is no sweeper task.
#[derive(Clone, Default)]
pub struct MemoryLookaside {
    entries: Arc<DashMap<String, StoredEntry>>,
}

#[derive(Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryLookaside {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LookasideStore for MemoryLookaside {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn put(&self, key: String, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries.insert(key, StoredEntry { value, expires_at });
    }
}
