//! Tiered-cache policies: fast L1 backed by a larger, slower L2.
//!
//! # Data Flow
//! ```text
//! Get:  L1 ──hit──▶ reply
//!        └─miss──▶ L2 ──hit──▶ reply + detached L1 populate
//!                   └─miss──▶ reply (miss)
//!
//! Set/Delete: both tiers concurrently; reply is L1's.
//! ```
//!
//! # Design Decisions
//! - Promotion is best-effort and never awaited; a failed populate costs a
//!   future miss, not latency
//! - `strict_l2_writes` trades write latency for durability: when set, an
//!   L2 write failure fails the whole write

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::join;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Operation, Reply, Request};
use crate::observability::metrics;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Two-tier read-through cache. Children are `[l1, l2]`.
pub struct L1L2CacheRoute {
    children: Vec<RouteHandle>,
    promotion_ttl: Option<Duration>,
    strict_l2_writes: bool,
    /// Writes with larger payloads skip L1 entirely. `None` disables the
    /// size split.
    l1_size_threshold: Option<usize>,
    name: &'static str,
}

impl L1L2CacheRoute {
    pub fn new(
        l1: RouteHandle,
        l2: RouteHandle,
        promotion_ttl: Option<Duration>,
        strict_l2_writes: bool,
    ) -> Self {
        Self {
            children: vec![l1, l2],
            promotion_ttl,
            strict_l2_writes,
            l1_size_threshold: None,
            name: "l1l2-cache",
        }
    }

    pub fn size_split(
        l1: RouteHandle,
        l2: RouteHandle,
        promotion_ttl: Option<Duration>,
        strict_l2_writes: bool,
        threshold_bytes: usize,
    ) -> Self {
        Self {
            children: vec![l1, l2],
            promotion_ttl,
            strict_l2_writes,
            l1_size_threshold: Some(threshold_bytes),
            name: "l1l2-size-split",
        }
    }

    fn l1(&self) -> &RouteHandle {
        &self.children[0]
    }

    fn l2(&self) -> &RouteHandle {
        &self.children[1]
    }

    /// Whether a value of this size may live in L1.
    fn fits_l1(&self, len: usize) -> bool {
        match self.l1_size_threshold {
            Some(threshold) => len <= threshold,
            None => true,
        }
    }

    async fn route_get(&self, req: &Request) -> Result<Reply, RequestError> {
        match self.l1().route(req).await {
            Ok(reply) if reply.is_hit() => return Ok(reply),
            Ok(_) => {}
            Err(err) => {
                // A broken L1 must not take reads down; fall through to L2.
                tracing::warn!(key = %req.key, error = %err, "L1 read failed, trying L2");
            }
        }

        let reply = self.l2().route(req).await?;
        if reply.is_hit() {
            if let Some(value) = &reply.value {
                if self.fits_l1(value.len()) {
                    let populate =
                        Request::set(req.key.clone(), value.clone(), self.promotion_ttl);
                    let l1 = Arc::clone(self.l1());
                    let policy = self.name;
                    tokio::spawn(async move {
                        if let Err(err) = l1.route(&populate).await {
                            metrics::record_suppressed_error(policy);
                            tracing::debug!(error = %err, "L1 promotion failed");
                        }
                    });
                }
            }
        }
        Ok(reply)
    }

    async fn route_write(&self, req: &Request) -> Result<Reply, RequestError> {
        // Oversized writes bypass L1; delete the L1 copy instead so a stale
        // small value cannot shadow the new large one.
        if req.op == Operation::Set && !self.fits_l1(req.value_len()) {
            let evict = Request::delete(req.key.clone());
            let l1 = Arc::clone(self.l1());
            tokio::spawn(async move {
                let _ = l1.route(&evict).await;
            });
            return self.l2().route(req).await;
        }

        let (l1_result, l2_result) = join!(self.l1().route(req), self.l2().route(req));

        if let Err(err) = l2_result {
            if self.strict_l2_writes {
                return Err(err);
            }
            metrics::record_suppressed_error(self.name);
            tracing::warn!(key = %req.key, error = %err, "L2 write failed, keeping L1 result");
        }
        l1_result
    }
}

#[async_trait]
impl RouteNode for L1L2CacheRoute {
    fn kind(&self) -> &'static str {
        self.name
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        match req.op {
            Operation::Get => self.route_get(req).await,
            Operation::Set | Operation::Delete => self.route_write(req).await,
        }
    }
}

fn tier_params(
    obj: &serde_json::Map<String, Value>,
    factory: &RouteFactory<'_>,
    policy: &'static str,
    path: &ConfigPath,
) -> Result<(RouteHandle, RouteHandle, Option<Duration>, bool), ConfigError> {
    let l1 = factory.build_child_field(obj, "l1", policy, path)?;
    let l2 = factory.build_child_field(obj, "l2", policy, path)?;
    let promotion_ttl =
        cfg::opt_u64(obj, "promotion_ttl_secs", policy, path)?.map(Duration::from_secs);
    let strict_l2_writes = cfg::bool_or(obj, "strict_l2_writes", false, policy, path)?;
    Ok((l1, l2, promotion_ttl, strict_l2_writes))
}

pub(crate) fn build_l1l2_cache(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "l1l2-cache", path)?;
    let (l1, l2, promotion_ttl, strict) = tier_params(obj, factory, "l1l2-cache", path)?;
    Ok(Arc::new(L1L2CacheRoute::new(l1, l2, promotion_ttl, strict)))
}

pub(crate) fn build_l1l2_size_split(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "l1l2-size-split", path)?;
    let (l1, l2, promotion_ttl, strict) = tier_params(obj, factory, "l1l2-size-split", path)?;
    let threshold = cfg::opt_u64(obj, "threshold_bytes", "l1l2-size-split", path)?.ok_or_else(
        || {
            ConfigError::new(
                "l1l2-size-split",
                path,
                "missing required field `threshold_bytes`",
            )
        },
    )?;
    Ok(Arc::new(L1L2CacheRoute::size_split(
        l1,
        l2,
        promotion_ttl,
        strict,
        threshold as usize,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal in-memory cache tier for exercising promotion.
    #[derive(Default)]
    struct MapTier {
        entries: DashMap<String, Vec<u8>>,
        gets: AtomicUsize,
        fail_writes: bool,
    }

    impl MapTier {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_writes() -> Arc<Self> {
            Arc::new(Self {
                fail_writes: true,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl RouteNode for MapTier {
        fn kind(&self) -> &'static str {
            "map-tier"
        }

        async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
            match req.op {
                Operation::Get => {
                    self.gets.fetch_add(1, Ordering::SeqCst);
                    Ok(match self.entries.get(&req.key) {
                        Some(v) => Reply::found(v.clone()),
                        None => Reply::not_found(),
                    })
                }
                Operation::Set => {
                    if self.fail_writes {
                        return Err(RequestError::Unavailable {
                            destination: "tier".into(),
                            reason: "write failed".into(),
                        });
                    }
                    self.entries
                        .insert(req.key.clone(), req.value.clone().unwrap_or_default());
                    Ok(Reply::stored())
                }
                Operation::Delete => {
                    if self.entries.remove(&req.key).is_some() {
                        Ok(Reply::deleted())
                    } else {
                        Ok(Reply::not_found())
                    }
                }
            }
        }
    }

    async fn settle() {
        // Let detached promotion tasks run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let l1 = MapTier::new();
        let l2 = MapTier::new();
        l2.entries.insert("k".into(), b"v".to_vec());
        let node = L1L2CacheRoute::new(l1.clone(), l2.clone(), None, false);

        let reply = node.route(&Request::get("k")).await.unwrap();
        assert!(reply.is_hit());

        settle().await;

        // Later read is served by L1 without touching L2.
        let l2_gets = l2.gets.load(Ordering::SeqCst);
        let reply = node.route(&Request::get("k")).await.unwrap();
        assert!(reply.is_hit());
        assert_eq!(l2.gets.load(Ordering::SeqCst), l2_gets);
    }

    #[tokio::test]
    async fn test_writes_reach_both_tiers() {
        let l1 = MapTier::new();
        let l2 = MapTier::new();
        let node = L1L2CacheRoute::new(l1.clone(), l2.clone(), None, false);

        node.route(&Request::set("k", b"v".to_vec(), None))
            .await
            .unwrap();
        assert!(l1.entries.contains_key("k"));
        assert!(l2.entries.contains_key("k"));
    }

    #[tokio::test]
    async fn test_l2_write_failure_ignored_by_default() {
        let node = L1L2CacheRoute::new(MapTier::new(), MapTier::failing_writes(), None, false);
        let reply = node
            .route(&Request::set("k", b"v".to_vec(), None))
            .await
            .unwrap();
        assert_eq!(reply, Reply::stored());
    }

    #[tokio::test]
    async fn test_l2_write_failure_fails_strict_writes() {
        let node = L1L2CacheRoute::new(MapTier::new(), MapTier::failing_writes(), None, true);
        let err = node
            .route(&Request::set("k", b"v".to_vec(), None))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_size_split_sends_large_values_to_l2_only() {
        let l1 = MapTier::new();
        let l2 = MapTier::new();
        let node = L1L2CacheRoute::size_split(l1.clone(), l2.clone(), None, false, 16);

        node.route(&Request::set("big", vec![0u8; 64], None))
            .await
            .unwrap();
        settle().await;
        assert!(!l1.entries.contains_key("big"));
        assert!(l2.entries.contains_key("big"));

        node.route(&Request::set("small", vec![0u8; 4], None))
            .await
            .unwrap();
        assert!(l1.entries.contains_key("small"));
        assert!(l2.entries.contains_key("small"));
    }

    #[tokio::test]
    async fn test_size_split_does_not_promote_oversized_values() {
        let l1 = MapTier::new();
        let l2 = MapTier::new();
        l2.entries.insert("big".into(), vec![0u8; 64]);
        let node = L1L2CacheRoute::size_split(l1.clone(), l2.clone(), None, false, 16);

        let reply = node.route(&Request::get("big")).await.unwrap();
        assert!(reply.is_hit());
        settle().await;
        assert!(!l1.entries.contains_key("big"));
    }
}
