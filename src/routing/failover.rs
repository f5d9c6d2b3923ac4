//! Resilience policies: ordered alternatives tried in sequence.
//!
//! # Design Decisions
//! - Only transient child errors advance the chain; terminal errors
//!   surface immediately (retrying a malformed request cannot help, and
//!   retrying a throttled one amplifies load)
//! - Chain length is fixed by configuration; exhaustion surfaces the last
//!   attempt's result verbatim
//! - TTL rewrite caps failover writes at `min(original, failover_ttl)` so
//!   fallback copies never outlive the primary's intended expiry

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Sequential failover on transient errors, with an optional TTL cap on
/// every attempt after the first.
pub struct FailoverRoute {
    children: Vec<RouteHandle>,
    failover_ttl: Option<Duration>,
}

impl FailoverRoute {
    pub fn new(children: Vec<RouteHandle>, failover_ttl: Option<Duration>) -> Self {
        Self {
            children,
            failover_ttl,
        }
    }

    fn request_for_attempt(&self, req: &Request, attempt: usize) -> Request {
        match (attempt, self.failover_ttl) {
            (0, _) | (_, None) => req.clone(),
            (_, Some(cap)) => {
                let capped = match req.ttl {
                    Some(current) => cmp::min(current, cap),
                    None => cap,
                };
                req.with_ttl(Some(capped))
            }
        }
    }
}

#[async_trait]
impl RouteNode for FailoverRoute {
    fn kind(&self) -> &'static str {
        if self.failover_ttl.is_some() {
            "failover-ttl"
        } else {
            "failover"
        }
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let last = self.children.len().saturating_sub(1);
        for (attempt, child) in self.children.iter().enumerate() {
            let attempt_req = self.request_for_attempt(req, attempt);
            match child.route(&attempt_req).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_transient() && attempt < last => {
                    tracing::warn!(
                        attempt,
                        key = %req.key,
                        error = %err,
                        "Failing over to next child"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        // Children are non-empty by construction; the loop always returns.
        Err(RequestError::Local("failover has no children".into()))
    }
}

pub(crate) fn build_failover(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "failover", path)?;
    let children = factory.build_children_field(obj, "children", "failover", path)?;
    Ok(Arc::new(FailoverRoute::new(children, None)))
}

pub(crate) fn build_failover_ttl(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "failover-ttl", path)?;
    let children = factory.build_children_field(obj, "children", "failover-ttl", path)?;
    let ttl_secs = cfg::opt_u64(obj, "failover_ttl_secs", "failover-ttl", path)?.ok_or_else(
        || ConfigError::new("failover-ttl", path, "missing required field `failover_ttl_secs`"),
    )?;
    Ok(Arc::new(FailoverRoute::new(
        children,
        Some(Duration::from_secs(ttl_secs)),
    )))
}

/// Read-through failover: reads advance on a miss as well as on transient
/// errors and return the first hit. Writes and deletes go to the first
/// child only; fallback copies are populated by reads, not by writing
/// everywhere.
pub struct MissFailoverRoute {
    children: Vec<RouteHandle>,
}

impl MissFailoverRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl RouteNode for MissFailoverRoute {
    fn kind(&self) -> &'static str {
        "miss-failover"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        if !req.op.is_read() {
            return self.children[0].route(req).await;
        }

        let last = self.children.len().saturating_sub(1);
        let mut final_result = Err(RequestError::Local("miss-failover has no children".into()));
        for (attempt, child) in self.children.iter().enumerate() {
            match child.route(req).await {
                Ok(reply) if reply.is_hit() => return Ok(reply),
                Ok(reply) => {
                    if attempt < last {
                        tracing::debug!(attempt, key = %req.key, "Miss, trying next child");
                    }
                    final_result = Ok(reply);
                }
                Err(err) if err.is_transient() && attempt < last => {
                    tracing::warn!(
                        attempt,
                        key = %req.key,
                        error = %err,
                        "Failing over to next child"
                    );
                    final_result = Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        final_result
    }
}

pub(crate) fn build_miss_failover(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "miss-failover", path)?;
    let children = factory.build_children_field(obj, "children", "miss-failover", path)?;
    Ok(Arc::new(MissFailoverRoute::new(children)))
}
