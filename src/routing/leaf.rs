//! Terminal policies: null, error, blackhole, devnull, logging.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::observability::metrics;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

use std::sync::Arc;

/// Replies with the neutral default for the operation: miss for reads,
/// not-stored for writes. The standard stand-in child for anything absent.
pub struct NullRoute;

#[async_trait]
impl RouteNode for NullRoute {
    fn kind(&self) -> &'static str {
        "null"
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        Ok(Reply::default_for(req.op))
    }
}

pub(crate) fn build_null(
    _factory: &RouteFactory<'_>,
    _cfg: &Value,
    _path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    Ok(Arc::new(NullRoute))
}

/// Fails every request with a configured message.
pub struct ErrorRoute {
    message: String,
}

impl ErrorRoute {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl RouteNode for ErrorRoute {
    fn kind(&self) -> &'static str {
        "error"
    }

    async fn route(&self, _req: &Request) -> Result<Reply, RequestError> {
        Err(RequestError::Local(self.message.clone()))
    }
}

pub(crate) fn build_error(
    _factory: &RouteFactory<'_>,
    cfg: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(cfg, "error", path)?;
    let message = cfg::opt_str(obj, "message", "error", path)?.unwrap_or("error route");
    Ok(Arc::new(ErrorRoute::new(message)))
}

/// Swallows requests while claiming success for writes and deletes. Used
/// to retire traffic for a keyspace without surfacing errors to clients.
pub struct BlackholeRoute;

#[async_trait]
impl RouteNode for BlackholeRoute {
    fn kind(&self) -> &'static str {
        "blackhole"
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        tracing::debug!(op = req.op.label(), key = %req.key, "Blackholed request");
        Ok(Reply::swallowed_for(req.op))
    }
}

pub(crate) fn build_blackhole(
    _factory: &RouteFactory<'_>,
    _cfg: &Value,
    _path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    Ok(Arc::new(BlackholeRoute))
}

/// Like `null`, but counts what it swallows.
pub struct DevNullRoute;

#[async_trait]
impl RouteNode for DevNullRoute {
    fn kind(&self) -> &'static str {
        "devnull"
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        metrics::record_devnull();
        Ok(Reply::default_for(req.op))
    }
}

pub(crate) fn build_devnull(
    _factory: &RouteFactory<'_>,
    _cfg: &Value,
    _path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    Ok(Arc::new(DevNullRoute))
}

/// Passthrough that logs request and reply around its child. With no child
/// configured it behaves like `null`.
pub struct LoggingRoute {
    children: Vec<RouteHandle>,
}

impl LoggingRoute {
    pub fn new(child: Option<RouteHandle>) -> Self {
        Self {
            children: child.into_iter().collect(),
        }
    }
}

#[async_trait]
impl RouteNode for LoggingRoute {
    fn kind(&self) -> &'static str {
        "logging"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let result = match self.children.first() {
            Some(child) => child.route(req).await,
            None => Ok(Reply::default_for(req.op)),
        };
        match &result {
            Ok(reply) => tracing::info!(
                op = req.op.label(),
                key = %req.key,
                result = reply.result.label(),
                "Routed request"
            ),
            Err(err) => tracing::info!(
                op = req.op.label(),
                key = %req.key,
                error = %err,
                "Routed request"
            ),
        }
        result
    }
}

pub(crate) fn build_logging(
    factory: &RouteFactory<'_>,
    cfg: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(cfg, "logging", path)?;
    let child = match obj.get("child") {
        Some(node) => Some(factory.build(node, &path.child("child"))?),
        None => None,
    };
    Ok(Arc::new(LoggingRoute::new(child)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResultCode;

    #[tokio::test]
    async fn test_null_replies_neutral() {
        let node = NullRoute;
        assert_eq!(
            node.route(&Request::get("k")).await.unwrap().result,
            ResultCode::NotFound
        );
        assert_eq!(
            node.route(&Request::set("k", b"v".to_vec(), None))
                .await
                .unwrap()
                .result,
            ResultCode::NotStored
        );
    }

    #[tokio::test]
    async fn test_error_always_fails() {
        let node = ErrorRoute::new("pool retired");
        let err = node.route(&Request::get("k")).await.unwrap_err();
        assert_eq!(err, RequestError::Local("pool retired".into()));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_blackhole_claims_write_success() {
        let node = BlackholeRoute;
        assert_eq!(
            node.route(&Request::set("k", b"v".to_vec(), None))
                .await
                .unwrap()
                .result,
            ResultCode::Stored
        );
        assert_eq!(
            node.route(&Request::get("k")).await.unwrap().result,
            ResultCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_logging_without_child_is_null() {
        let node = LoggingRoute::new(None);
        assert_eq!(
            node.route(&Request::delete("k")).await.unwrap().result,
            ResultCode::NotFound
        );
    }
}
