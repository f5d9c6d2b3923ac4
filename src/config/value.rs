//! Typed field access over the generic config tree.
//!
//! Route policies are configured by arbitrary JSON objects; these helpers
//! extract required/optional fields and produce `ConfigError`s that carry
//! the dotted path to the failing node.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Dotted path into the configuration document, e.g.
/// `route.children[1].l2`. Built incrementally while the builder recurses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPath(String);

impl ConfigPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Path of a named field under this one.
    pub fn child(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}.{}", self.0, segment))
        }
    }

    /// Path of an array element under this one.
    pub fn index(&self, i: usize) -> Self {
        Self(format!("{}[{}]", self.0, i))
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Require the node to be an object.
pub fn as_object<'a>(
    node: &'a Value,
    policy: &str,
    path: &ConfigPath,
) -> Result<&'a Map<String, Value>, ConfigError> {
    node.as_object()
        .ok_or_else(|| ConfigError::new(policy, path, "expected an object"))
}

/// Required string field.
pub fn req_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    policy: &str,
    path: &ConfigPath,
) -> Result<&'a str, ConfigError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ConfigError::new(
            policy,
            path.child(field),
            "expected a string",
        )),
        None => Err(ConfigError::new(
            policy,
            path,
            format!("missing required field `{field}`"),
        )),
    }
}

/// Optional string field.
pub fn opt_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    policy: &str,
    path: &ConfigPath,
) -> Result<Option<&'a str>, ConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ConfigError::new(
            policy,
            path.child(field),
            "expected a string",
        )),
    }
}

/// Optional unsigned integer field.
pub fn opt_u64(
    obj: &Map<String, Value>,
    field: &str,
    policy: &str,
    path: &ConfigPath,
) -> Result<Option<u64>, ConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ConfigError::new(policy, path.child(field), "expected an unsigned integer")
        }),
    }
}

/// Optional unsigned integer with a default.
pub fn u64_or(
    obj: &Map<String, Value>,
    field: &str,
    default: u64,
    policy: &str,
    path: &ConfigPath,
) -> Result<u64, ConfigError> {
    Ok(opt_u64(obj, field, policy, path)?.unwrap_or(default))
}

/// Optional floating-point field with a default. Integers are accepted.
pub fn f64_or(
    obj: &Map<String, Value>,
    field: &str,
    default: f64,
    policy: &str,
    path: &ConfigPath,
) -> Result<f64, ConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| ConfigError::new(policy, path.child(field), "expected a number")),
    }
}

/// Optional boolean field with a default.
pub fn bool_or(
    obj: &Map<String, Value>,
    field: &str,
    default: bool,
    policy: &str,
    path: &ConfigPath,
) -> Result<bool, ConfigError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ConfigError::new(
            policy,
            path.child(field),
            "expected a boolean",
        )),
    }
}
