//! Configuration surface consumed by the route tree builder.
//!
//! # Data Flow
//! ```text
//! config text (parsed elsewhere)
//!     → serde_json::Value (generic tree, immutable)
//!     → schema.rs (typed top-level envelope: pools, named routes, root)
//!     → value.rs (field accessors with path-carrying errors)
//!     → routing::registry builders
//! ```
//!
//! # Design Decisions
//! - The core never parses configuration text; it consumes an already-typed
//!   generic tree and borrows into it while building.
//! - Every accessor failure names the policy and the dotted path of the
//!   offending node.

pub mod schema;
pub mod value;

pub use schema::{PoolConfig, RouterConfig};
pub use value::ConfigPath;
