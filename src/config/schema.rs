//! Typed top-level configuration envelope.
//!
//! Only the envelope is statically typed; route policy nodes stay generic
//! (`serde_json::Value`) because their shape depends on the policy name and
//! they nest recursively.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::config::value::ConfigPath;
use crate::error::ConfigError;

/// Root configuration document for the router core.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Pool definitions addressable by name from `pool` route nodes.
    /// Pools not declared here fall back to the injected service resolver.
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,

    /// Named route definitions. A name referenced twice expands into two
    /// independent subtrees.
    #[serde(default)]
    pub named_routes: HashMap<String, Value>,

    /// Root route node.
    pub route: Value,
}

/// One backend pool: an ordered server list.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Backend addresses in hashing order. Order is part of the contract:
    /// key affinity depends on stable indices.
    pub servers: Vec<String>,
}

impl RouterConfig {
    /// Deserialize the envelope out of a generic config tree.
    pub fn from_value(config: &Value) -> Result<Self, ConfigError> {
        serde_json::from_value(config.clone())
            .map_err(|e| ConfigError::new("<top-level>", ConfigPath::root(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parses() {
        let cfg = json!({
            "pools": {"main": {"servers": ["10.0.0.1:11211", "10.0.0.2:11211"]}},
            "named_routes": {"warm": {"type": "null"}},
            "route": {"type": "pool", "pool": "main"}
        });
        let parsed = RouterConfig::from_value(&cfg).unwrap();
        assert_eq!(parsed.pools["main"].servers.len(), 2);
        assert!(parsed.named_routes.contains_key("warm"));
    }

    #[test]
    fn test_missing_route_is_an_error() {
        let cfg = json!({"pools": {}});
        let err = RouterConfig::from_value(&cfg).unwrap_err();
        assert!(err.reason.contains("route"));
    }
}
