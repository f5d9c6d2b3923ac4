//! Destination policies: the seam between the tree and real backends.
//!
//! A `destination` leaf owns one `DestinationId` and hands requests to the
//! injected send primitive. A `pool` node expands a named pool into
//! destination leaves behind key-hash selection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{Destination, DestinationId};
use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::routing::registry::RouteContext;
use crate::routing::select::HashRoute;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Leaf bound to one backend destination.
pub struct DestinationRoute {
    id: DestinationId,
    sender: Arc<dyn Destination>,
}

impl DestinationRoute {
    pub fn new(id: DestinationId, sender: Arc<dyn Destination>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> &DestinationId {
        &self.id
    }
}

#[async_trait]
impl RouteNode for DestinationRoute {
    fn kind(&self) -> &'static str {
        "destination"
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        self.sender.send(&self.id, req).await
    }

    async fn prime(&self) -> Result<(), RequestError> {
        self.sender.prepare(&self.id).await
    }
}

pub(crate) fn build_destination(
    ctx: &RouteContext,
    _factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "destination", path)?;
    let address = cfg::req_str(obj, "address", "destination", path)?;
    let pool = cfg::opt_str(obj, "pool", "destination", path)?.unwrap_or("");
    let index = cfg::u64_or(obj, "index", 0, "destination", path)? as usize;
    let id = DestinationId::new(pool, index, address);
    Ok(Arc::new(DestinationRoute::new(id, ctx.destination.clone())))
}

/// Build the subtree for one named pool: a destination leaf per server,
/// behind hash selection when the pool has more than one.
pub(crate) fn build_pool_subtree(
    ctx: &RouteContext,
    destinations: Vec<DestinationId>,
    salt: Option<String>,
    policy: &str,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    if destinations.is_empty() {
        return Err(ConfigError::new(policy, path, "pool has no servers"));
    }
    let mut leaves: Vec<RouteHandle> = destinations
        .into_iter()
        .map(|id| Arc::new(DestinationRoute::new(id, ctx.destination.clone())) as RouteHandle)
        .collect();
    if leaves.len() == 1 {
        return Ok(leaves.remove(0));
    }
    Ok(Arc::new(HashRoute::new(leaves, salt)))
}

pub(crate) fn build_pool(
    ctx: &RouteContext,
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "pool", path)?;
    let name = cfg::req_str(obj, "pool", "pool", path)?;
    let salt = cfg::opt_str(obj, "salt", "pool", path)?.map(String::from);
    let destinations = factory.pool_destinations(ctx, name, "pool", path)?;
    build_pool_subtree(ctx, destinations, salt, "pool", path)
}
