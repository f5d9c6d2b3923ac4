//! Reply representation and result codes.

use crate::message::request::Operation;

/// Result code of a reply.
///
/// Aggregation policies agree or disagree on the code alone; the payload is
/// carried along but never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Read hit.
    Found,
    /// Read miss, or delete of a missing entry.
    NotFound,
    /// Write applied.
    Stored,
    /// Write not applied (neutral default for writes).
    NotStored,
    /// Delete applied.
    Deleted,
    /// Accepted for asynchronous processing; no outcome is known yet.
    Accepted,
}

impl ResultCode {
    pub fn label(&self) -> &'static str {
        match self {
            ResultCode::Found => "found",
            ResultCode::NotFound => "not_found",
            ResultCode::Stored => "stored",
            ResultCode::NotStored => "not_stored",
            ResultCode::Deleted => "deleted",
            ResultCode::Accepted => "accepted",
        }
    }
}

/// One reply flowing back up the routing tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub result: ResultCode,
    pub value: Option<Vec<u8>>,
}

impl Reply {
    pub fn found(value: impl Into<Vec<u8>>) -> Self {
        Self {
            result: ResultCode::Found,
            value: Some(value.into()),
        }
    }

    pub fn not_found() -> Self {
        Self {
            result: ResultCode::NotFound,
            value: None,
        }
    }

    pub fn stored() -> Self {
        Self {
            result: ResultCode::Stored,
            value: None,
        }
    }

    pub fn not_stored() -> Self {
        Self {
            result: ResultCode::NotStored,
            value: None,
        }
    }

    pub fn deleted() -> Self {
        Self {
            result: ResultCode::Deleted,
            value: None,
        }
    }

    pub fn accepted() -> Self {
        Self {
            result: ResultCode::Accepted,
            value: None,
        }
    }

    /// Neutral reply for an operation that reached no backend: a miss for
    /// reads, not-stored for writes, not-found for deletes.
    pub fn default_for(op: Operation) -> Self {
        match op {
            Operation::Get => Reply::not_found(),
            Operation::Set => Reply::not_stored(),
            Operation::Delete => Reply::not_found(),
        }
    }

    /// Reply that pretends the operation succeeded without doing anything.
    /// Reads still miss; writes and deletes claim success.
    pub fn swallowed_for(op: Operation) -> Self {
        match op {
            Operation::Get => Reply::not_found(),
            Operation::Set => Reply::stored(),
            Operation::Delete => Reply::deleted(),
        }
    }

    /// True for a read hit.
    pub fn is_hit(&self) -> bool {
        self.result == ResultCode::Found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_operation() {
        assert_eq!(Reply::default_for(Operation::Get).result, ResultCode::NotFound);
        assert_eq!(Reply::default_for(Operation::Set).result, ResultCode::NotStored);
        assert_eq!(Reply::default_for(Operation::Delete).result, ResultCode::NotFound);
    }

    #[test]
    fn test_swallowed_claims_success_for_writes() {
        assert_eq!(Reply::swallowed_for(Operation::Set).result, ResultCode::Stored);
        assert_eq!(Reply::swallowed_for(Operation::Delete).result, ResultCode::Deleted);
        assert_eq!(Reply::swallowed_for(Operation::Get).result, ResultCode::NotFound);
    }

    #[test]
    fn test_hit_detection() {
        assert!(Reply::found(b"v".to_vec()).is_hit());
        assert!(!Reply::not_found().is_hit());
        assert!(!Reply::stored().is_hit());
    }
}
