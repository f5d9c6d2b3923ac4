//! Shared utilities for integration testing.

// Each test binary compiles its own copy; not every binary uses every
// helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use kvrouter::backend::StaticResolver;
use kvrouter::{
    Destination, DestinationId, MemoryLookaside, Operation, Reply, Request, RequestError,
    RouteContext,
};

/// One logged dispatch.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub op: Operation,
    pub key: String,
    pub ttl: Option<Duration>,
}

/// Programmable in-memory backend fleet keyed by destination address.
///
/// Each address gets its own key/value store, can be marked down to
/// simulate a transient outage, and can be given artificial latency.
/// Every dispatch is logged so tests can assert which destinations were
/// contacted and what they received.
#[derive(Default)]
pub struct MemoryBackend {
    stores: DashMap<String, DashMap<String, Vec<u8>>>,
    down: DashMap<String, ()>,
    slow: DashMap<String, Duration>,
    log: DashMap<String, Vec<SentRequest>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark an address as unreachable (or reachable again).
    pub fn set_down(&self, address: &str, down: bool) {
        if down {
            self.down.insert(address.to_string(), ());
        } else {
            self.down.remove(address);
        }
    }

    /// Add artificial latency to one address.
    pub fn set_slow(&self, address: &str, delay: Duration) {
        self.slow.insert(address.to_string(), delay);
    }

    /// Pre-populate one backend's store.
    pub fn seed(&self, address: &str, key: &str, value: &[u8]) {
        self.stores
            .entry(address.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    pub fn contains(&self, address: &str, key: &str) -> bool {
        self.stores
            .get(address)
            .map(|store| store.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of requests this address has received.
    pub fn requests_to(&self, address: &str) -> usize {
        self.log.get(address).map(|l| l.len()).unwrap_or(0)
    }

    /// Requests this address has received, in arrival order.
    pub fn sent_to(&self, address: &str) -> Vec<SentRequest> {
        self.log
            .get(address)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Addresses that received at least one request, sorted.
    pub fn contacted(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .log
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }
}

#[async_trait]
impl Destination for MemoryBackend {
    async fn send(&self, dest: &DestinationId, req: &Request) -> Result<Reply, RequestError> {
        self.log
            .entry(dest.address.clone())
            .or_default()
            .push(SentRequest {
                op: req.op,
                key: req.key.clone(),
                ttl: req.ttl,
            });

        if let Some(delay) = self.slow.get(&dest.address) {
            tokio::time::sleep(*delay).await;
        }

        if self.down.contains_key(&dest.address) {
            return Err(RequestError::Unavailable {
                destination: dest.to_string(),
                reason: "connection refused".into(),
            });
        }

        let store = self.stores.entry(dest.address.clone()).or_default();
        let reply = match req.op {
            Operation::Get => match store.get(&req.key) {
                Some(value) => Reply::found(value.clone()),
                None => Reply::not_found(),
            },
            Operation::Set => {
                store.insert(req.key.clone(), req.value.clone().unwrap_or_default());
                Reply::stored()
            }
            Operation::Delete => {
                if store.remove(&req.key).is_some() {
                    Reply::deleted()
                } else {
                    Reply::not_found()
                }
            }
        };
        Ok(reply)
    }
}

/// Context wired to the given backend fleet, with a lookaside store and a
/// resolver carrying one discoverable pool (`discovered`: two servers).
pub fn context(backend: Arc<MemoryBackend>) -> RouteContext {
    // Surface router logs when RUST_LOG is set; repeat calls are no-ops.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut resolver = StaticResolver::new();
    resolver.insert("discovered", &["10.9.0.1:11211", "10.9.0.2:11211"]);
    RouteContext {
        destination: backend,
        resolver: Arc::new(resolver),
        lookaside: Some(Arc::new(MemoryLookaside::new())),
        host_id: 11,
    }
}
