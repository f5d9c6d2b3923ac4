//! Selection policies: pick exactly one child per request.
//!
//! # Design Decisions
//! - Hash selection is the affinity primitive: same key + same child list
//!   ⇒ same child, across processes (FNV-1a, no process-seeded state)
//! - Round-robin is the only selector with shared mutable state, a single
//!   atomic counter
//! - Changing the child-set size intentionally gives no stability
//!   guarantee; pools that need smooth resizing layer their own scheme

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Operation, Reply, Request};
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Stable 64-bit FNV-1a. Selection must agree across proxy instances, so
/// no randomly seeded hasher can be used here.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Key-affine selection: child index derived from the key (plus an
/// optional salt, letting stacked hash nodes decorrelate).
pub struct HashRoute {
    children: Vec<RouteHandle>,
    salt: Option<String>,
}

impl HashRoute {
    pub fn new(children: Vec<RouteHandle>, salt: Option<String>) -> Self {
        Self { children, salt }
    }

    fn index_for(&self, key: &str) -> usize {
        let hash = match &self.salt {
            Some(salt) => {
                let mut salted = Vec::with_capacity(key.len() + salt.len());
                salted.extend_from_slice(key.as_bytes());
                salted.extend_from_slice(salt.as_bytes());
                fnv1a64(&salted)
            }
            None => fnv1a64(key.as_bytes()),
        };
        (hash % self.children.len() as u64) as usize
    }
}

#[async_trait]
impl RouteNode for HashRoute {
    fn kind(&self) -> &'static str {
        "hash"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        self.children[self.index_for(&req.key)].route(req).await
    }
}

pub(crate) fn build_hash(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "hash", path)?;
    let children = factory.build_children_field(obj, "children", "hash", path)?;
    let salt = cfg::opt_str(obj, "salt", "hash", path)?.map(String::from);
    Ok(Arc::new(HashRoute::new(children, salt)))
}

/// Uniform random selection; no affinity.
pub struct RandomRoute {
    children: Vec<RouteHandle>,
}

impl RandomRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl RouteNode for RandomRoute {
    fn kind(&self) -> &'static str {
        "random"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let index = fastrand::usize(..self.children.len());
        self.children[index].route(req).await
    }
}

pub(crate) fn build_random(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "random", path)?;
    let children = factory.build_children_field(obj, "children", "random", path)?;
    Ok(Arc::new(RandomRoute::new(children)))
}

/// Selection pinned by the proxy's host identifier rather than the key:
/// every request from this process goes to the same child. The index is
/// fixed at construction.
pub struct HostIdRoute {
    children: Vec<RouteHandle>,
    index: usize,
}

impl HostIdRoute {
    pub fn new(children: Vec<RouteHandle>, host_id: u64) -> Self {
        let index = (fnv1a64(&host_id.to_le_bytes()) % children.len() as u64) as usize;
        Self { children, index }
    }
}

#[async_trait]
impl RouteNode for HostIdRoute {
    fn kind(&self) -> &'static str {
        "host-id"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        self.children[self.index].route(req).await
    }
}

/// Rotating selection across children.
#[derive(Default)]
pub struct RoundRobinRoute {
    children: Vec<RouteHandle>,
    counter: AtomicUsize,
}

impl RoundRobinRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self {
            children,
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RouteNode for RoundRobinRoute {
    fn kind(&self) -> &'static str {
        "round-robin"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        self.children[turn % self.children.len()].route(req).await
    }
}

pub(crate) fn build_round_robin(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "round-robin", path)?;
    let children = factory.build_children_field(obj, "children", "round-robin", path)?;
    Ok(Arc::new(RoundRobinRoute::new(children)))
}

/// Dispatch by operation class: `operation_policies` maps get/set/delete
/// to a child, anything unmapped goes to `default_policy` (or `null`).
pub struct OperationSelectorRoute {
    children: Vec<RouteHandle>,
    /// Index into `children` per operation, in Operation declaration order.
    slots: [usize; 3],
}

impl OperationSelectorRoute {
    fn slot(op: Operation) -> usize {
        match op {
            Operation::Get => 0,
            Operation::Set => 1,
            Operation::Delete => 2,
        }
    }
}

#[async_trait]
impl RouteNode for OperationSelectorRoute {
    fn kind(&self) -> &'static str {
        "operation-selector"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let child = &self.children[self.slots[Self::slot(req.op)]];
        child.route(req).await
    }
}

pub(crate) fn build_operation_selector(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "operation-selector", path)?;

    // Child 0 is always the default policy.
    let default = match obj.get("default_policy") {
        Some(node) => factory.build(node, &path.child("default_policy"))?,
        None => Arc::new(crate::routing::leaf::NullRoute) as RouteHandle,
    };
    let mut children = vec![default];
    let mut slots = [0usize; 3];

    if let Some(policies) = obj.get("operation_policies") {
        let policies_path = path.child("operation_policies");
        let policies = cfg::as_object(policies, "operation-selector", &policies_path)?;
        for (field, op) in [
            ("get", Operation::Get),
            ("set", Operation::Set),
            ("delete", Operation::Delete),
        ] {
            if let Some(node) = policies.get(field) {
                let child = factory.build(node, &policies_path.child(field))?;
                slots[OperationSelectorRoute::slot(op)] = children.len();
                children.push(child);
            }
        }
        for field in policies.keys() {
            if !matches!(field.as_str(), "get" | "set" | "delete") {
                return Err(ConfigError::new(
                    "operation-selector",
                    policies_path.child(field),
                    "unknown operation class (expected get/set/delete)",
                ));
            }
        }
    }

    Ok(Arc::new(OperationSelectorRoute { children, slots }))
}
