//! # Core Trait Definitions
//!
//! The polling engine only talks to the outside world through the traits in this
//! module. Each one is a seam where a concrete backend is plugged in:
//!
//! ### [`SourceAdapter`]
//! One implementation per chain family. Every variant normalizes its chain's
//! quirks (batch caps, L1/L2 height bridging, pruned blocks, double-polled
//! finality) into two calls: the finalized height, and an inclusive range fetch
//! that never silently truncates.
//!
//! ### [`CursorStore`]
//! Durable per-source positions. `save` is the only point at which forward
//! progress becomes durable.
//!
//! ### [`EventSink`] and [`Publisher`]
//! The sink is the system of record and must be idempotent per
//! [`MessageIdentity`]; the publisher is an at-least-once announcement channel
//! whose failures never hold back the cursor.
//!
//! ### [`CorrelationStage`], [`Mapper`], [`Metrics`]
//! Optional second-leg lookup for multi-hop messages, the pure raw → typed
//! event mapping, and the count/measure metrics surface.
//!
//! All I/O traits use `async_trait` and are `Send + Sync` so one backend can be
//! shared by every source task.

use async_trait::async_trait;

use crate::{
    CorrelatedEvent, Cursor, FilterConfig, MessageIdentity, Position, RawEvent, SyncResult,
    TypedEvent, UpsertOutcome,
};

/// Chain-family specific event source.
///
/// # Errors
///
/// Implementations return [`crate::SyncError::TransientFetch`] for network,
/// timeout and rate-limit failures (the engine backs off and retries the same
/// range), and [`crate::SyncError::InvalidRange`] when the node rejects the
/// range itself (the engine re-plans on the next tick).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Highest height (or marker) that will not be reorganized.
    async fn get_finalized_height(&self) -> SyncResult<u64>;

    /// All events with `from <= block <= to`.
    ///
    /// Adapters that cannot serve the whole range in one request must paginate
    /// internally and return the union.
    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>>;

    /// Largest range a single upstream request can cover, if the chain caps it.
    fn maximum_batch_size(&self) -> Option<u64> {
        None
    }
}

#[async_trait]
impl<T: SourceAdapter + ?Sized> SourceAdapter for std::sync::Arc<T> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        (**self).get_finalized_height().await
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        (**self).get_events_in_range(from, to).await
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        (**self).maximum_batch_size()
    }
}

/// Durable per-source cursor storage
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, source_id: &str) -> SyncResult<Option<Cursor>>;

    async fn save(&self, source_id: &str, position: Position) -> SyncResult<()>;

    /// Operator rewind. Never called by the polling engine.
    async fn delete(&self, source_id: &str) -> SyncResult<()>;
}

/// System of record for observed messages
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Insert or overwrite the message; re-upserting identical content is a no-op.
    async fn upsert(
        &self,
        identity: &MessageIdentity,
        payload: &serde_json::Value,
    ) -> SyncResult<UpsertOutcome>;

    /// Every persisted message id key for one chain, in key order.
    async fn message_keys(&self, chain_id: u16) -> SyncResult<Vec<String>>;
}

/// At-least-once announcement of sunk messages
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        identity: &MessageIdentity,
        payload: &serde_json::Value,
    ) -> SyncResult<()>;
}

/// Second-leg resolution of multi-hop messages
#[async_trait]
pub trait CorrelationStage: Send + Sync {
    async fn correlate(&self, events: Vec<RawEvent>) -> SyncResult<Vec<CorrelatedEvent>>;
}

/// Pure raw → typed event mapping, injected per source.
///
/// `Ok(None)` means the event is not a message this source cares about.
pub trait Mapper: Send + Sync {
    fn map(&self, event: &CorrelatedEvent, filter: &FilterConfig) -> SyncResult<Option<TypedEvent>>;
}

impl<F> Mapper for F
where
    F: Fn(&CorrelatedEvent, &FilterConfig) -> SyncResult<Option<TypedEvent>> + Send + Sync,
{
    fn map(&self, event: &CorrelatedEvent, filter: &FilterConfig) -> SyncResult<Option<TypedEvent>> {
        self(event, filter)
    }
}

/// Metric labels attached to every data point
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    pub source_id: String,
    pub chain_id: u16,
    pub commitment: String,
    /// Extra labels such as a tick outcome
    pub extra: Vec<(&'static str, String)>,
}

impl MetricLabels {
    pub fn with(&self, key: &'static str, value: impl Into<String>) -> Self {
        let mut labels = self.clone();
        labels.extra.push((key, value.into()));
        labels
    }
}

/// Externally collected count/measure metrics
pub trait Metrics: Send + Sync {
    fn count(&self, name: &'static str, labels: &MetricLabels);

    fn measure(&self, name: &'static str, value: f64, labels: &MetricLabels);
}

/// Pass-through stage for sources whose events are already complete messages
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl CorrelationStage for Passthrough {
    async fn correlate(&self, events: Vec<RawEvent>) -> SyncResult<Vec<CorrelatedEvent>> {
        Ok(events.into_iter().map(CorrelatedEvent::from).collect())
    }
}

/// Publisher for deployments without an outbound bus
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _identity: &MessageIdentity, _payload: &serde_json::Value) -> SyncResult<()> {
        Ok(())
    }
}
