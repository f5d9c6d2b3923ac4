//! Request-routing core for a distributed key-value cache proxy.
//!
//! Clients address logical pools, not machines; this crate decides, per
//! request, which backend destination(s) to contact and how to combine
//! their replies.
//!
//! # Architecture Overview
//!
//! ```text
//!   config document (serde_json::Value)
//!        │
//!        ▼
//!   ┌───────────────┐   registers policy builders, closes over
//!   │ RouteRegistry │◀─ injected context (send primitive, resolver,
//!   └──────┬────────┘   lookaside store, host id)
//!          │ build_tree (all-or-nothing)
//!          ▼
//!   ┌───────────────┐   one immutable configuration generation
//!   │   RouteTree   │   (policy nodes: fan-out, failover, hashing,
//!   └──────┬────────┘    tiered caches, admission, shadowing, ...)
//!          │ install (atomic swap)
//!          ▼
//!   ┌───────────────┐   route(request) → reply
//!   │    Router     │◀─ request-receiving layer (out of scope)
//!   └───────────────┘
//! ```
//!
//! The wire codec, transport, connection pooling, config-text parsing and
//! service discovery are external collaborators behind the traits in
//! [`backend`].

// Core subsystems
pub mod config;
pub mod message;
pub mod routing;

// External collaborator seam
pub mod backend;

// Cross-cutting concerns
pub mod error;
pub mod observability;

pub use backend::{Destination, DestinationId, LookasideStore, MemoryLookaside, ServiceResolver};
pub use error::{ConfigError, RequestError};
pub use message::{Operation, Reply, Request, ResultCode};
pub use routing::{RouteContext, RouteNode, RouteRegistry, RouteTree, Router};
