//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Route nodes produce:
//!     → tracing events (structured log lines, emitted inline)
//!     → metrics.rs (counters via the `metrics` facade)
//!
//! Consumers:
//!     → Log aggregation (stdout, file, remote)
//!     → Whatever metrics recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Metric updates are cheap (atomic increments behind the facade)
//! - No exporter lives here; the embedding process owns the recorder
//! - Suppressed errors (fire-and-forget dispatches) are always counted,
//!   never silently dropped

pub mod metrics;
