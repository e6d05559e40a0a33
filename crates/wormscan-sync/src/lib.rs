//! Cursor-based polling engine for cross-chain messaging events.
//!
//! One [`PollEngine`] per source walks finalized block ranges, writes every
//! event to an idempotent [`EventSink`] keyed by [`MessageIdentity`], and only
//! then persists its [`Cursor`]. Gap detection and backfill work from the sink's
//! keys alone.

pub mod adapters;
pub mod attributes;
pub mod backoff;
pub mod correlation;
pub mod error;
pub mod gaps;
pub mod keys;
pub mod mapper;
pub mod planner;
pub mod scheduler;
pub mod sync;
pub mod telemetry;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use adapters::*;
pub use attributes::*;
pub use backoff::*;
pub use correlation::*;
pub use error::*;
pub use gaps::*;
pub use mapper::*;
pub use planner::*;
pub use scheduler::*;
pub use sync::*;
pub use telemetry::{MetricsExporter, NoopMetrics};
pub use traits::*;
pub use types::*;
