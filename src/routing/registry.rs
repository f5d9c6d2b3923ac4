//! Route factory registry and tree builder.
//!
//! # Data Flow
//! ```text
//! RouteRegistry::with_defaults(ctx)
//!     → builder per policy name (ctx captured in closures where needed)
//!
//! build_tree(config):
//!     envelope (pools, named_routes, route)
//!     → RouteFactory::build walks the route node top-down
//!     → children built before parents
//!     → RouteTree (all-or-nothing: first ConfigError aborts the build)
//! ```
//!
//! # Design Decisions
//! - The registry is an injected immutable mapping, not a process-wide
//!   singleton; building is a pure function of (config, injected context)
//! - Cross-cutting context (send primitive, resolver, lookaside store,
//!   host id) is captured at registry construction, never looked up
//!   globally
//! - A named route referenced twice expands into two independent subtrees;
//!   cyclic references are a build error, not a stack overflow

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::backend::{Destination, DestinationId, LookasideStore, ServiceResolver};
use crate::config::value::{self as cfg, ConfigPath};
use crate::config::RouterConfig;
use crate::error::ConfigError;
use crate::routing::select::HostIdRoute;
use crate::routing::{
    destination, failover, fanout, leaf, lookaside, select, shaping, tiered, transform,
    RouteHandle, RouteTree,
};

/// Cross-cutting context builders need but that is not per-node data.
#[derive(Clone)]
pub struct RouteContext {
    /// The send primitive every destination leaf dispatches through.
    pub destination: Arc<dyn Destination>,
    /// Resolves pool names not declared in the configuration document.
    pub resolver: Arc<dyn ServiceResolver>,
    /// Store backing `lookaside` nodes; absent means the policy is
    /// unavailable in this deployment.
    pub lookaside: Option<Arc<dyn LookasideStore>>,
    /// Identifier of this proxy instance, used by `host-id` selection.
    pub host_id: u64,
}

type BoxedBuilder =
    Box<dyn Fn(&RouteFactory<'_>, &Value, &ConfigPath) -> Result<RouteHandle, ConfigError> + Send + Sync>;

/// Immutable policy-name → builder mapping.
pub struct RouteRegistry {
    builders: HashMap<String, BoxedBuilder>,
}

impl RouteRegistry {
    /// Empty registry; useful for embedding a fully custom policy set.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with every built-in policy, closed over `ctx`.
    pub fn with_defaults(ctx: RouteContext) -> Self {
        let mut registry = Self::new();

        // Leaves
        registry.register("null", leaf::build_null);
        registry.register("error", leaf::build_error);
        registry.register("blackhole", leaf::build_blackhole);
        registry.register("devnull", leaf::build_devnull);
        registry.register("logging", leaf::build_logging);

        // Transforms
        registry.register("modify-key", transform::build_modify_key);
        registry.register("modify-ttl", transform::build_modify_ttl);

        // Selection
        registry.register("hash", select::build_hash);
        registry.register("random", select::build_random);
        registry.register("round-robin", select::build_round_robin);
        registry.register("operation-selector", select::build_operation_selector);
        {
            let ctx = ctx.clone();
            registry.register("host-id", move |factory, config, path| {
                let obj = cfg::as_object(config, "host-id", path)?;
                let children = factory.build_children_field(obj, "children", "host-id", path)?;
                Ok(Arc::new(HostIdRoute::new(children, ctx.host_id)) as RouteHandle)
            });
        }

        // Fan-out / aggregation
        registry.register("all-sync", fanout::build_all_sync);
        registry.register("all-async", fanout::build_all_async);
        registry.register("all-fastest", fanout::build_all_fastest);
        registry.register("all-majority", fanout::build_all_majority);
        registry.register("all-initial", fanout::build_all_initial);

        // Resilience
        registry.register("failover", failover::build_failover);
        registry.register("failover-ttl", failover::build_failover_ttl);
        registry.register("miss-failover", failover::build_miss_failover);

        // Tiered caches
        registry.register("l1l2-cache", tiered::build_l1l2_cache);
        registry.register("l1l2-size-split", tiered::build_l1l2_size_split);

        // Admission / shaping
        registry.register("rate-limit", shaping::build_rate_limit);
        registry.register("outstanding-limit", shaping::build_outstanding_limit);
        registry.register("latency-injection", shaping::build_latency_injection);
        registry.register("shadow", shaping::build_shadow);
        registry.register("load-balancer", shaping::build_load_balancer);

        // External collaborators
        {
            let ctx = ctx.clone();
            registry.register("lookaside", move |factory, config, path| {
                lookaside::build_lookaside(&ctx, factory, config, path)
            });
        }
        {
            let ctx = ctx.clone();
            registry.register("destination", move |factory, config, path| {
                destination::build_destination(&ctx, factory, config, path)
            });
        }
        {
            let ctx = ctx.clone();
            registry.register("pool", move |factory, config, path| {
                destination::build_pool(&ctx, factory, config, path)
            });
        }

        registry
    }

    /// Register (or override) a policy builder.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&RouteFactory<'_>, &Value, &ConfigPath) -> Result<RouteHandle, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Build a full tree from a configuration document. All-or-nothing:
    /// on error nothing is installed anywhere.
    pub fn build_tree(&self, config: &Value) -> Result<RouteTree, ConfigError> {
        let envelope = RouterConfig::from_value(config)?;

        let mut pools: HashMap<String, Vec<DestinationId>> = HashMap::new();
        for (name, pool) in &envelope.pools {
            let destinations = pool
                .servers
                .iter()
                .enumerate()
                .map(|(index, address)| DestinationId::new(name.clone(), index, address.clone()))
                .collect();
            pools.insert(name.clone(), destinations);
        }

        let factory = RouteFactory {
            registry: self,
            pools,
            named: &envelope.named_routes,
            expanding: RefCell::new(HashSet::new()),
        };
        let root = factory.build(&envelope.route, &ConfigPath::root().child("route"))?;
        Ok(RouteTree::new(root))
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursion handle the builders call back into for their children.
pub struct RouteFactory<'a> {
    registry: &'a RouteRegistry,
    pools: HashMap<String, Vec<DestinationId>>,
    named: &'a HashMap<String, Value>,
    /// Named routes currently being expanded, for cycle detection.
    expanding: RefCell<HashSet<String>>,
}

impl RouteFactory<'_> {
    /// Build one route node: an object with a `type` field, or a string
    /// reference (named route, `"pool|name"`, `"error|message"`, or a
    /// parameterless policy name).
    pub fn build(&self, config: &Value, path: &ConfigPath) -> Result<RouteHandle, ConfigError> {
        match config {
            Value::String(reference) => self.build_reference(reference, path),
            Value::Object(obj) => {
                let name = cfg::req_str(obj, "type", "<route>", path)?;
                let builder = self.registry.builders.get(name).ok_or_else(|| {
                    ConfigError::new(name, path, format!("unknown policy name `{name}`"))
                })?;
                builder(self, config, path)
            }
            _ => Err(ConfigError::new(
                "<route>",
                path,
                "expected an object or a route reference string",
            )),
        }
    }

    fn build_reference(
        &self,
        reference: &str,
        path: &ConfigPath,
    ) -> Result<RouteHandle, ConfigError> {
        if let Some((kind, arg)) = reference.split_once('|') {
            let synthetic = match kind {
                "pool" => serde_json::json!({"type": "pool", "pool": arg}),
                "error" => serde_json::json!({"type": "error", "message": arg}),
                _ => {
                    return Err(ConfigError::new(
                        kind,
                        path,
                        format!("unknown shorthand `{kind}|...`"),
                    ))
                }
            };
            return self.build(&synthetic, path);
        }

        if self.named.contains_key(reference) {
            return self.build_named(reference, path);
        }

        if self.registry.contains(reference) {
            let synthetic = serde_json::json!({ "type": reference });
            return self.build(&synthetic, path);
        }

        Err(ConfigError::new(
            "<route>",
            path,
            format!("unknown route reference `{reference}`"),
        ))
    }

    /// Expand a named route. Every reference yields an independent
    /// subtree; references that loop back into themselves are rejected.
    fn build_named(&self, name: &str, path: &ConfigPath) -> Result<RouteHandle, ConfigError> {
        if !self.expanding.borrow_mut().insert(name.to_string()) {
            return Err(ConfigError::new(
                "<route>",
                path,
                format!("cyclic named route reference `{name}`"),
            ));
        }
        let definition_path = ConfigPath::root().child("named_routes").child(name);
        // Presence was checked by the caller.
        let result = match self.named.get(name) {
            Some(config) => self.build(config, &definition_path),
            None => Err(ConfigError::new(
                "<route>",
                path,
                format!("unknown route reference `{name}`"),
            )),
        };
        self.expanding.borrow_mut().remove(name);
        result
    }

    /// Build a required single-child field.
    pub fn build_child_field(
        &self,
        obj: &Map<String, Value>,
        field: &str,
        policy: &str,
        path: &ConfigPath,
    ) -> Result<RouteHandle, ConfigError> {
        let node = obj.get(field).ok_or_else(|| {
            ConfigError::new(policy, path, format!("missing required field `{field}`"))
        })?;
        self.build(node, &path.child(field))
    }

    /// Build a non-empty child list. Accepts an array of route configs or
    /// a single config treated as a one-element list.
    pub fn build_children_field(
        &self,
        obj: &Map<String, Value>,
        field: &str,
        policy: &str,
        path: &ConfigPath,
    ) -> Result<Vec<RouteHandle>, ConfigError> {
        let node = obj.get(field).ok_or_else(|| {
            ConfigError::new(policy, path, format!("missing required field `{field}`"))
        })?;
        let field_path = path.child(field);
        let children = match node {
            Value::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    children.push(self.build(item, &field_path.index(i))?);
                }
                children
            }
            other => vec![self.build(other, &field_path)?],
        };
        if children.is_empty() {
            return Err(ConfigError::new(
                policy,
                field_path,
                "requires at least one child",
            ));
        }
        Ok(children)
    }

    /// Destinations of a pool: configuration-declared pools first, then
    /// the injected resolver.
    pub fn pool_destinations(
        &self,
        ctx: &RouteContext,
        name: &str,
        policy: &str,
        path: &ConfigPath,
    ) -> Result<Vec<DestinationId>, ConfigError> {
        if let Some(destinations) = self.pools.get(name) {
            return Ok(destinations.clone());
        }
        ctx.resolver.resolve(name).ok_or_else(|| {
            ConfigError::new(policy, path, format!("unresolved pool reference `{name}`"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticResolver;
    use crate::error::RequestError;
    use crate::message::{Reply, Request};
    use async_trait::async_trait;
    use serde_json::json;

    struct MissSender;

    #[async_trait]
    impl Destination for MissSender {
        async fn send(
            &self,
            _dest: &DestinationId,
            req: &Request,
        ) -> Result<Reply, RequestError> {
            Ok(Reply::default_for(req.op))
        }
    }

    fn test_ctx() -> RouteContext {
        let mut resolver = StaticResolver::new();
        resolver.insert("discovered", &["10.1.0.1:11211", "10.1.0.2:11211"]);
        RouteContext {
            destination: Arc::new(MissSender),
            resolver: Arc::new(resolver),
            lookaside: None,
            host_id: 7,
        }
    }

    #[test]
    fn test_unknown_policy_fails_with_path() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({
            "route": {"type": "failover", "children": [
                "null",
                {"type": "definitely-not-a-policy"}
            ]}
        });
        let err = registry.build_tree(&config).unwrap_err();
        assert!(err.reason.contains("definitely-not-a-policy"));
        assert_eq!(err.path, "route.children[1]");
    }

    #[test]
    fn test_missing_type_field_fails() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({"route": {"children": []}});
        let err = registry.build_tree(&config).unwrap_err();
        assert!(err.reason.contains("type"));
    }

    #[test]
    fn test_pool_from_config_and_resolver() {
        let registry = RouteRegistry::with_defaults(test_ctx());

        let config = json!({
            "pools": {"local": {"servers": ["127.0.0.1:11211"]}},
            "route": {"type": "pool", "pool": "local"}
        });
        assert!(registry.build_tree(&config).is_ok());

        let config = json!({"route": {"type": "pool", "pool": "discovered"}});
        assert!(registry.build_tree(&config).is_ok());

        let config = json!({"route": {"type": "pool", "pool": "nowhere"}});
        let err = registry.build_tree(&config).unwrap_err();
        assert!(err.reason.contains("unresolved pool"));
    }

    #[test]
    fn test_named_route_expands_per_reference() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({
            "named_routes": {"spine": {"type": "round-robin", "children": ["null", "null"]}},
            "route": {"type": "all-sync", "children": ["spine", "spine"]}
        });
        let tree = registry.build_tree(&config).unwrap();
        // Two references to `spine` yield two independent subtrees:
        // all-sync + 2×(round-robin + 2×null) = 7 nodes.
        assert_eq!(tree.node_count(), 7);
    }

    #[test]
    fn test_cyclic_named_route_is_rejected() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({
            "named_routes": {"loop": {"type": "logging", "child": "loop"}},
            "route": "loop"
        });
        let err = registry.build_tree(&config).unwrap_err();
        assert!(err.reason.contains("cyclic"));
    }

    #[test]
    fn test_shorthand_references() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({
            "pools": {"a": {"servers": ["127.0.0.1:11211"]}},
            "route": {"type": "failover", "children": ["pool|a", "error|retired"]}
        });
        assert!(registry.build_tree(&config).is_ok());

        let config = json!({"route": "bogus|x"});
        assert!(registry.build_tree(&config).is_err());
    }

    #[test]
    fn test_lookaside_requires_injected_store() {
        let registry = RouteRegistry::with_defaults(test_ctx());
        let config = json!({
            "route": {"type": "lookaside", "child": "null"}
        });
        let err = registry.build_tree(&config).unwrap_err();
        assert!(err.reason.contains("lookaside store"));
    }

    #[test]
    fn test_custom_policy_registration() {
        let mut registry = RouteRegistry::with_defaults(test_ctx());
        registry.register("always-null", |_factory, _config, _path| {
            Ok(Arc::new(crate::routing::leaf::NullRoute) as RouteHandle)
        });
        let config = json!({"route": {"type": "always-null"}});
        assert!(registry.build_tree(&config).is_ok());
    }
}
