//! Fan-out/aggregation policies: dispatch to several children, combine.
//!
//! # Design Decisions
//! - Children awaited together (`join_all`) when every result is needed;
//!   spawned detached when the parent may return first
//! - Dispatches already issued are never force-aborted: losers run to
//!   completion and their results are discarded, so backends never see a
//!   mid-flight cancellation
//! - Discarded failures are counted and logged at debug, never silent

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request, ResultCode};
use crate::observability::metrics;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Dispatch to a child on a detached task and discard the outcome,
/// keeping a count of suppressed failures.
pub(crate) fn spawn_discarded(child: RouteHandle, req: Request, policy: &'static str) {
    tokio::spawn(async move {
        if let Err(err) = child.route(&req).await {
            metrics::record_suppressed_error(policy);
            tracing::debug!(policy, error = %err, "Discarded background dispatch failure");
        }
    });
}

/// Spawn every child dispatch and collect results on a channel as they
/// complete. Receiver-side early return leaves the remaining tasks running
/// to completion; their sends fail silently.
fn spawn_collect(
    children: &[RouteHandle],
    req: &Request,
) -> mpsc::Receiver<Result<Reply, RequestError>> {
    let (tx, rx) = mpsc::channel(children.len());
    for child in children {
        let child = Arc::clone(child);
        let req = req.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(child.route(&req).await).await;
        });
    }
    rx
}

/// Dispatch to all children, wait for all, reply with the last child's
/// result in configured order. A failed sibling never aborts the others.
pub struct AllSyncRoute {
    children: Vec<RouteHandle>,
}

impl AllSyncRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl RouteNode for AllSyncRoute {
    fn kind(&self) -> &'static str {
        "all-sync"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let mut results = join_all(self.children.iter().map(|child| child.route(req))).await;
        let last = results.len().saturating_sub(1);
        for (i, result) in results.iter().enumerate().take(last) {
            if let Err(err) = result {
                tracing::debug!(child = i, error = %err, "all-sync sibling failed");
            }
        }
        match results.pop() {
            Some(last) => last,
            None => Err(RequestError::Local("all-sync has no children".into())),
        }
    }
}

pub(crate) fn build_all_sync(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "all-sync", path)?;
    let children = factory.build_children_field(obj, "children", "all-sync", path)?;
    Ok(Arc::new(AllSyncRoute::new(children)))
}

/// Fire-and-forget replication: dispatch to all children detached and
/// reply `Accepted` immediately.
pub struct AllAsyncRoute {
    children: Vec<RouteHandle>,
}

impl AllAsyncRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl RouteNode for AllAsyncRoute {
    fn kind(&self) -> &'static str {
        "all-async"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        for child in &self.children {
            spawn_discarded(Arc::clone(child), req.clone(), "all-async");
        }
        Ok(Reply::accepted())
    }
}

pub(crate) fn build_all_async(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "all-async", path)?;
    let children = factory.build_children_field(obj, "children", "all-async", path)?;
    Ok(Arc::new(AllAsyncRoute::new(children)))
}

/// Dispatch to all, reply with the first success. Losers run to
/// completion and are discarded. If every child fails, the last completing
/// error is surfaced.
pub struct AllFastestRoute {
    children: Vec<RouteHandle>,
}

impl AllFastestRoute {
    pub fn new(children: Vec<RouteHandle>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl RouteNode for AllFastestRoute {
    fn kind(&self) -> &'static str {
        "all-fastest"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let mut rx = spawn_collect(&self.children, req);
        let mut last_err = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    metrics::record_suppressed_error("all-fastest");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| RequestError::Local("all-fastest has no children".into())))
    }
}

pub(crate) fn build_all_fastest(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "all-fastest", path)?;
    let children = factory.build_children_field(obj, "children", "all-fastest", path)?;
    Ok(Arc::new(AllFastestRoute::new(children)))
}

/// What an `all-majority` node does when every child has replied and no
/// result class reached a strict majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMajorityPolicy {
    /// Fail the aggregate (default).
    Fail,
    /// Surface whichever result completed last.
    LastReply,
}

/// Result-class key used for vote counting. All errors fall into one
/// class: two backends disagreeing about *how* they failed still agree
/// that they failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VoteClass {
    Code(ResultCode),
    Error,
}

fn classify(result: &Result<Reply, RequestError>) -> VoteClass {
    match result {
        Ok(reply) => VoteClass::Code(reply.result),
        Err(_) => VoteClass::Error,
    }
}

/// Dispatch to all, reply as soon as a strict majority (⌊N/2⌋+1) agree on
/// a result class. Stragglers keep running detached.
pub struct AllMajorityRoute {
    children: Vec<RouteHandle>,
    no_majority: NoMajorityPolicy,
}

impl AllMajorityRoute {
    pub fn new(children: Vec<RouteHandle>, no_majority: NoMajorityPolicy) -> Self {
        Self {
            children,
            no_majority,
        }
    }
}

#[async_trait]
impl RouteNode for AllMajorityRoute {
    fn kind(&self) -> &'static str {
        "all-majority"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let needed = self.children.len() / 2 + 1;
        let mut rx = spawn_collect(&self.children, req);

        let mut votes: HashMap<VoteClass, usize> = HashMap::new();
        let mut samples: HashMap<VoteClass, Result<Reply, RequestError>> = HashMap::new();
        let mut last = None;

        while let Some(result) = rx.recv().await {
            let class = classify(&result);
            let count = votes.entry(class).or_insert(0);
            *count += 1;
            samples.entry(class).or_insert_with(|| result.clone());
            if *count >= needed {
                // Sample was stored on the class's first vote.
                return samples.remove(&class).unwrap_or(result);
            }
            last = Some(result);
        }

        match self.no_majority {
            NoMajorityPolicy::Fail => Err(RequestError::Local(format!(
                "no majority among {} replies",
                self.children.len()
            ))),
            NoMajorityPolicy::LastReply => {
                last.unwrap_or_else(|| Err(RequestError::Local("all-majority has no children".into())))
            }
        }
    }
}

pub(crate) fn build_all_majority(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "all-majority", path)?;
    let children = factory.build_children_field(obj, "children", "all-majority", path)?;
    let no_majority = match cfg::opt_str(obj, "no_majority", "all-majority", path)?.unwrap_or("fail")
    {
        "fail" => NoMajorityPolicy::Fail,
        "last-reply" => NoMajorityPolicy::LastReply,
        other => {
            return Err(ConfigError::new(
                "all-majority",
                path.child("no_majority"),
                format!("unknown policy `{other}` (expected fail/last-reply)"),
            ))
        }
    };
    Ok(Arc::new(AllMajorityRoute::new(children, no_majority)))
}

/// Await only the first `initial_count` children (combined like all-sync);
/// dispatch the remainder fire-and-forget.
pub struct AllInitialRoute {
    children: Vec<RouteHandle>,
    initial_count: usize,
}

impl AllInitialRoute {
    pub fn new(children: Vec<RouteHandle>, initial_count: usize) -> Self {
        Self {
            children,
            initial_count,
        }
    }
}

#[async_trait]
impl RouteNode for AllInitialRoute {
    fn kind(&self) -> &'static str {
        "all-initial"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let boundary = self.initial_count.min(self.children.len());
        let (initial, rest) = self.children.split_at(boundary);

        for child in rest {
            spawn_discarded(Arc::clone(child), req.clone(), "all-initial");
        }

        let mut results = join_all(initial.iter().map(|child| child.route(req))).await;
        match results.pop() {
            Some(last) => last,
            None => Err(RequestError::Local("all-initial awaits no children".into())),
        }
    }
}

pub(crate) fn build_all_initial(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "all-initial", path)?;
    let children = factory.build_children_field(obj, "children", "all-initial", path)?;
    let initial_count = cfg::u64_or(obj, "initial_count", 1, "all-initial", path)? as usize;
    if initial_count == 0 {
        return Err(ConfigError::new(
            "all-initial",
            path.child("initial_count"),
            "must be at least 1",
        ));
    }
    Ok(Arc::new(AllInitialRoute::new(children, initial_count)))
}
