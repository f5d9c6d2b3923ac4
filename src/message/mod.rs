//! Request/reply model seen by the routing tree.
//!
//! # Data Flow
//! ```text
//! decoded wire request → Request (immutable)
//!     → routing tree (transform policies clone-and-rewrite)
//!     → Destination::send per chosen backend
//!     → Reply (result code + optional value)
//!     → aggregation policies combine replies bottom-up
//! ```
//!
//! # Design Decisions
//! - Requests are never mutated in place; rewrites produce a new value so
//!   concurrent fan-out over the same request stays safe.
//! - Replies carry a small closed set of result codes; aggregation compares
//!   codes, not payloads.

pub mod reply;
pub mod request;

pub use reply::{Reply, ResultCode};
pub use request::{Operation, Request};
