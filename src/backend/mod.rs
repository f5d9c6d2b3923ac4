//! External collaborator seam.
//!
//! # Responsibilities
//! - Identify backend destinations without interpreting addresses
//! - Define the send primitive the routing tree dispatches through
//! - Define service-name resolution for pools not declared in config
//! - Define the lookaside store consulted around the primary dispatch path
//!
//! # Design Decisions
//! - Everything here is a trait: the core chooses *which* destination to
//!   contact, never *how*. Transport, pooling and timeouts live behind
//!   `Destination`.
//! - Timeout enforcement belongs to the send primitive; the tree only
//!   propagates the `Timeout` errors it reports.

pub mod lookaside;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::RequestError;
use crate::message::{Reply, Request};

pub use lookaside::{LookasideStore, MemoryLookaside};

/// Opaque identifier of one backend destination: pool name plus stable
/// index plus the resolved address string. The core never parses the
/// address; it is handed verbatim to the send primitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationId {
    pub pool: String,
    pub index: usize,
    pub address: String,
}

impl DestinationId {
    pub fn new(pool: impl Into<String>, index: usize, address: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            index,
            address: address.into(),
        }
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.pool, self.index, self.address)
    }
}

/// The injected send primitive: serialize, transmit, await one reply.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn send(&self, dest: &DestinationId, req: &Request) -> Result<Reply, RequestError>;

    /// Optional warm-up (connection establishment, auth). Invoked only via
    /// the explicit `RouteTree::prime` lifecycle hook, never at build time.
    async fn prepare(&self, _dest: &DestinationId) -> Result<(), RequestError> {
        Ok(())
    }
}

/// Resolves a service/pool name to its destinations. Implementations are
/// expected to answer from a local snapshot; resolution must not block tree
/// construction on the network.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, pool: &str) -> Option<Vec<DestinationId>>;
}

/// Fixed name → destinations mapping. The default resolver for tests and
/// for deployments where every pool is declared in configuration.
#[derive(Debug, Default)]
pub struct StaticResolver {
    pools: HashMap<String, Vec<DestinationId>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: impl Into<String>, addresses: &[&str]) {
        let pool = pool.into();
        let destinations = addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| DestinationId::new(pool.clone(), i, *addr))
            .collect();
        self.pools.insert(pool, destinations);
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, pool: &str) -> Option<Vec<DestinationId>> {
        self.pools.get(pool).cloned()
    }
}
