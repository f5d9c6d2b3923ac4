//! Lookaside-cache policy: consult an external store around the primary
//! dispatch path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::LookasideStore;
use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::observability::metrics;
use crate::routing::registry::RouteContext;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Wraps a primary child with the injected lookaside store.
///
/// Reads check the store first and short-circuit on a hit. On a miss the
/// primary is consulted and, when it produced a hit, the store is
/// populated on a detached task off the reply's critical path. Writes and
/// deletes bypass the store entirely.
pub struct LookasideRoute {
    children: Vec<RouteHandle>,
    store: Arc<dyn LookasideStore>,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl LookasideRoute {
    pub fn new(
        child: RouteHandle,
        store: Arc<dyn LookasideStore>,
        key_prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            children: vec![child],
            store,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

#[async_trait]
impl RouteNode for LookasideRoute {
    fn kind(&self) -> &'static str {
        "lookaside"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        if !req.op.is_read() {
            return self.children[0].route(req).await;
        }

        let store_key = self.store_key(&req.key);
        if let Some(value) = self.store.get(&store_key).await {
            metrics::record_lookaside(true);
            return Ok(Reply::found(value));
        }
        metrics::record_lookaside(false);

        let reply = self.children[0].route(req).await?;
        if reply.is_hit() {
            if let Some(value) = reply.value.clone() {
                let store = Arc::clone(&self.store);
                let ttl = self.ttl;
                tokio::spawn(async move {
                    store.put(store_key, value, ttl).await;
                });
            }
        }
        Ok(reply)
    }
}

pub(crate) fn build_lookaside(
    ctx: &RouteContext,
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let store = ctx.lookaside.clone().ok_or_else(|| {
        ConfigError::new("lookaside", path, "no lookaside store was injected")
    })?;
    let obj = cfg::as_object(config, "lookaside", path)?;
    let child = factory.build_child_field(obj, "child", "lookaside", path)?;
    let key_prefix = cfg::opt_str(obj, "key_prefix", "lookaside", path)?.unwrap_or("");
    let ttl = cfg::opt_u64(obj, "ttl_secs", "lookaside", path)?.map(Duration::from_secs);
    Ok(Arc::new(LookasideRoute::new(
        child,
        store,
        key_prefix,
        ttl,
    )))
}
