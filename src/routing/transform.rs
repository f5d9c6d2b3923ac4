//! Single-child policies that rewrite the request before delegating.
//!
//! Rewrites always produce a new request; the original stays untouched so
//! sibling dispatches in an enclosing fan-out are unaffected.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// Key rewriting: ensure a prefix and/or append a suffix.
pub struct ModifyKeyRoute {
    children: Vec<RouteHandle>,
    ensure_prefix: Option<String>,
    append_suffix: Option<String>,
}

impl ModifyKeyRoute {
    pub fn new(
        child: RouteHandle,
        ensure_prefix: Option<String>,
        append_suffix: Option<String>,
    ) -> Self {
        Self {
            children: vec![child],
            ensure_prefix,
            append_suffix,
        }
    }

    fn rewrite(&self, key: &str) -> String {
        let mut key = match &self.ensure_prefix {
            Some(prefix) if !key.starts_with(prefix.as_str()) => format!("{prefix}{key}"),
            _ => key.to_string(),
        };
        if let Some(suffix) = &self.append_suffix {
            key.push_str(suffix);
        }
        key
    }
}

#[async_trait]
impl RouteNode for ModifyKeyRoute {
    fn kind(&self) -> &'static str {
        "modify-key"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let rewritten = req.with_key(self.rewrite(&req.key));
        self.children[0].route(&rewritten).await
    }
}

pub(crate) fn build_modify_key(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "modify-key", path)?;
    let child = factory.build_child_field(obj, "child", "modify-key", path)?;
    let ensure_prefix = cfg::opt_str(obj, "ensure_prefix", "modify-key", path)?.map(String::from);
    let append_suffix = cfg::opt_str(obj, "append_suffix", "modify-key", path)?.map(String::from);
    if ensure_prefix.is_none() && append_suffix.is_none() {
        return Err(ConfigError::new(
            "modify-key",
            path,
            "at least one of `ensure_prefix`/`append_suffix` is required",
        ));
    }
    Ok(Arc::new(ModifyKeyRoute::new(
        child,
        ensure_prefix,
        append_suffix,
    )))
}

/// How a configured TTL combines with the request's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlMode {
    /// Replace unconditionally.
    Set,
    /// Keep the shorter lifetime; a request without TTL gets the
    /// configured one.
    Min,
    /// Keep the longer lifetime; a request without TTL stays unbounded.
    Max,
}

/// TTL rewriting for the child subtree.
pub struct ModifyTtlRoute {
    children: Vec<RouteHandle>,
    ttl: Duration,
    mode: TtlMode,
}

impl ModifyTtlRoute {
    pub fn new(child: RouteHandle, ttl: Duration, mode: TtlMode) -> Self {
        Self {
            children: vec![child],
            ttl,
            mode,
        }
    }

    fn rewrite(&self, ttl: Option<Duration>) -> Option<Duration> {
        match (self.mode, ttl) {
            (TtlMode::Set, _) => Some(self.ttl),
            (TtlMode::Min, None) => Some(self.ttl),
            (TtlMode::Min, Some(current)) => Some(cmp::min(current, self.ttl)),
            (TtlMode::Max, None) => None,
            (TtlMode::Max, Some(current)) => Some(cmp::max(current, self.ttl)),
        }
    }
}

#[async_trait]
impl RouteNode for ModifyTtlRoute {
    fn kind(&self) -> &'static str {
        "modify-ttl"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let rewritten = req.with_ttl(self.rewrite(req.ttl));
        self.children[0].route(&rewritten).await
    }
}

pub(crate) fn build_modify_ttl(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "modify-ttl", path)?;
    let child = factory.build_child_field(obj, "child", "modify-ttl", path)?;
    let ttl_secs = cfg::opt_u64(obj, "ttl_secs", "modify-ttl", path)?.ok_or_else(|| {
        ConfigError::new("modify-ttl", path, "missing required field `ttl_secs`")
    })?;
    let mode = match cfg::opt_str(obj, "mode", "modify-ttl", path)?.unwrap_or("set") {
        "set" => TtlMode::Set,
        "min" => TtlMode::Min,
        "max" => TtlMode::Max,
        other => {
            return Err(ConfigError::new(
                "modify-ttl",
                path.child("mode"),
                format!("unknown mode `{other}` (expected set/min/max)"),
            ))
        }
    };
    Ok(Arc::new(ModifyTtlRoute::new(
        child,
        Duration::from_secs(ttl_secs),
        mode,
    )))
}
