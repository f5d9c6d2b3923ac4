//! Request representation.

use std::time::Duration;

/// Operation kind carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Set,
    Delete,
}

impl Operation {
    /// Stable lowercase label for logs, metrics and config lookup.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Get)
    }
}

/// One request flowing down the routing tree.
///
/// Immutable as seen by the tree: transform policies build a rewritten copy
/// for their child instead of mutating in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Operation,
    pub key: String,
    /// Payload for writes; `None` for gets and deletes.
    pub value: Option<Vec<u8>>,
    /// Entry lifetime; `None` means no expiry.
    pub ttl: Option<Duration>,
}

impl Request {
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            op: Operation::Get,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Option<Duration>) -> Self {
        Self {
            op: Operation::Set,
            key: key.into(),
            value: Some(value.into()),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: Operation::Delete,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }

    /// Copy with a different key. Used by key-rewriting policies.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut req = self.clone();
        req.key = key.into();
        req
    }

    /// Copy with a different TTL. Used by TTL-rewriting policies.
    pub fn with_ttl(&self, ttl: Option<Duration>) -> Self {
        let mut req = self.clone();
        req.ttl = ttl;
        req
    }

    /// Payload size in bytes, 0 when there is no payload.
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(Vec::len).unwrap_or(0)
    }
}
