//! Routing subsystem: the policy tree and its dispatch contract.
//!
//! # Data Flow
//! ```text
//! Tree Construction (off the hot path):
//!     serde_json::Value
//!     → registry.rs (policy name → builder, children built first)
//!     → RouteTree (immutable node tree, one configuration generation)
//!     → Router::install (atomic swap)
//!
//! Per Request:
//!     Router::route(request)
//!     → root RouteNode
//!     → policy nodes fan out / select / transform
//!     → replies combine bottom-up
//!     → one Reply (or RequestError)
//! ```
//!
//! # Design Decisions
//! - One capability contract: every policy implements only `route`
//! - The tree is the only handle graph: top-down traversal, no
//!   back-references, no global node registry
//! - Node-local mutable state is atomic or mutex-protected; nothing locks
//!   the tree as a whole
//! - In-flight requests keep the generation they started on; a swap never
//!   mutates a node in place

pub mod destination;
pub mod failover;
pub mod fanout;
pub mod leaf;
pub mod lookaside;
pub mod registry;
pub mod select;
pub mod shaping;
pub mod tiered;
pub mod transform;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::error::RequestError;
use crate::message::{Reply, Request};
use crate::observability::metrics;

pub use registry::{RouteContext, RouteFactory, RouteRegistry};

/// Shared handle to one node of the routing tree.
pub type RouteHandle = Arc<dyn RouteNode>;

/// One unit of the routing tree.
///
/// `route` suspends only while awaiting child replies or the external send
/// primitive; it must be safe to invoke concurrently for independent
/// requests.
#[async_trait]
pub trait RouteNode: Send + Sync {
    /// Policy name, as registered in the factory registry.
    fn kind(&self) -> &'static str;

    /// Ordered children. Count and order are fixed for the node's lifetime;
    /// selection and aggregation rely on stable indices.
    fn children(&self) -> &[RouteHandle] {
        &[]
    }

    /// Dispatch one request and produce one reply.
    async fn route(&self, req: &Request) -> Result<Reply, RequestError>;

    /// Deferred warm-up hook. Never invoked implicitly; construction does
    /// no I/O.
    async fn prime(&self) -> Result<(), RequestError> {
        Ok(())
    }
}

/// One immutable configuration generation of the routing tree.
pub struct RouteTree {
    root: RouteHandle,
    generation: u64,
    node_count: usize,
}

impl std::fmt::Debug for RouteTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTree")
            .field("root", &self.root.kind())
            .field("generation", &self.generation)
            .field("node_count", &self.node_count)
            .finish()
    }
}

impl RouteTree {
    pub fn new(root: RouteHandle) -> Self {
        let node_count = count_nodes(&root);
        Self {
            root,
            generation: 0,
            node_count,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn root(&self) -> &RouteHandle {
        &self.root
    }

    /// Dispatch one request at the root.
    pub async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        self.root.route(req).await
    }

    /// Explicit lifecycle hook: walk the tree and let every node warm up
    /// its destinations. The first failure aborts the walk.
    pub async fn prime(&self) -> Result<(), RequestError> {
        let mut stack = vec![self.root.clone()];
        while let Some(node) = stack.pop() {
            node.prime().await?;
            stack.extend(node.children().iter().cloned());
        }
        Ok(())
    }
}

fn count_nodes(root: &RouteHandle) -> usize {
    let mut count = 0;
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        count += 1;
        stack.extend(node.children().iter().cloned());
    }
    count
}

/// Entry point for the request-receiving layer: holds the active tree
/// generation and swaps it atomically on reload.
///
/// In-flight requests loaded the previous `Arc` and finish against it; the
/// old generation is dropped when the last of them completes.
#[derive(Default)]
pub struct Router {
    active: ArcSwapOption<RouteTree>,
    generation_counter: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly built tree as the next generation. Returns the
    /// generation number assigned to it.
    pub fn install(&self, mut tree: RouteTree) -> u64 {
        let generation = self.generation_counter.fetch_add(1, Ordering::Relaxed) + 1;
        tree.generation = generation;
        metrics::record_generation_install(generation, tree.node_count);
        self.active.store(Some(Arc::new(tree)));
        generation
    }

    /// Generation currently serving, 0 before the first install.
    pub fn generation(&self) -> u64 {
        self.generation_counter.load(Ordering::Relaxed)
    }

    /// Dispatch one request against the active generation.
    pub async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let start = Instant::now();
        let tree = match self.active.load_full() {
            Some(tree) => tree,
            None => {
                return Err(RequestError::Local("no route tree installed".into()));
            }
        };
        let result = tree.route(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_transient() => "transient_error",
            Err(_) => "error",
        };
        metrics::record_request(req.op.label(), outcome, start);
        result
    }
}
