//! Scenario tests for the polling engine
//!
//! [`Scenario`] bundles one scripted source with in-memory cursor, sink,
//! publisher and metrics backends, so each test reads as: script the chain,
//! build an engine, tick, inspect what was persisted.

use std::sync::Arc;
use wormscan_sync::mock::{
    raw_event, MemoryCursorStore, MemoryEventSink, RecordingMetrics, RecordingPublisher,
    ScriptedSource,
};
use wormscan_sync::{PollEngine, RawEvent, SourceConfig};

pub mod engine_scenarios_test;
pub mod marker_source_test;

/// Emitter used by every scripted event
pub const EMITTER: &str = "0x0000000000000000000000003ee18b2214aff97000d974cf647e7c347e8fa585";

pub type TestEngine = PollEngine<ScriptedSource, MemoryCursorStore, MemoryEventSink>;

#[derive(Clone, Default)]
pub struct Scenario {
    pub source: ScriptedSource,
    pub store: MemoryCursorStore,
    pub sink: MemoryEventSink,
    pub publisher: RecordingPublisher,
    pub metrics: RecordingMetrics,
}

impl Scenario {
    pub fn new(finalized: u64) -> Self {
        let scenario = Self::default();
        scenario.source.set_finalized(finalized);
        scenario
    }

    /// One message per block, sequence equal to the block height.
    pub fn with_messages(self, blocks: impl IntoIterator<Item = u64>) -> Self {
        for block in blocks {
            self.source.add_event(raw_event(block, EMITTER, block));
        }
        self
    }

    pub fn add(&self, event: RawEvent) {
        self.source.add_event(event);
    }

    /// Fast-ticking bounded source on chain 2
    pub fn config(from: Option<u64>, to: Option<u64>, batch: u64) -> SourceConfig {
        let mut config = SourceConfig::new("ethereum-logs", 2);
        config.from_block = from;
        config.to_block = to;
        config.max_batch_size = batch;
        config.tick_interval_ms = 1;
        config.backoff.base_delay_ms = 1;
        config.backoff.max_delay_ms = 8;
        config
    }

    /// A fresh engine over this scenario's backends, as after a process restart.
    pub fn engine(&self, config: SourceConfig) -> TestEngine {
        PollEngine::new(
            config,
            Arc::new(self.source.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.sink.clone()),
        )
        .with_publisher(Arc::new(self.publisher.clone()))
        .with_metrics(Arc::new(self.metrics.clone()))
    }
}
