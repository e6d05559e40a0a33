//! # Poll Engine
//!
//! [`PollEngine`] drives a single source through its tick state machine:
//!
//! ```text
//! Init → Idle → Planning → Fetching → Sinking → Persisting → Idle | Finished | Backoff
//! ```
//!
//! Each tick plans a range from the in-memory cursor and the adapter's
//! finalized height, fetches and correlates it, maps every event to a
//! [`MessageIdentity`](crate::MessageIdentity), upserts it into the sink,
//! announces it through the publisher, and only then saves the new cursor.
//! A failure anywhere before the save leaves the cursor untouched, so the same
//! range is planned again on the next attempt.
//!
//! ## Failure policy
//!
//! - Transient fetch, timeout and store errors move the source to `Backoff`
//!   (`base × 2^retry`, capped); the retry count resets after the next
//!   successful tick.
//! - Invalid ranges and other tick-fatal errors are logged and counted; the
//!   next tick re-plans from the same cursor.
//! - Mapping/key errors skip the single item.
//! - Publisher errors are logged and counted; the sink is the system of record,
//!   so they never hold back the cursor.
//!
//! ## Concurrency
//!
//! Ticks of one engine never overlap: [`PollEngine::tick`] holds a per-engine
//! lock and reports [`TickOutcome::Skipped`] if another tick is in flight.
//! Cancellation is only observed between ticks and while waiting, so a stop
//! request never abandons a tick halfway through sinking or persisting.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::adapters::with_deadline;
use crate::telemetry::{
    CURSOR_DIFF_METRIC, CURSOR_METRIC, EVENTS_SUNK_METRIC, INVALID_RANGE_METRIC, LAG_METRIC,
    OUTCOME_TAG, PUBLISH_FAILURES_METRIC, SKIPPED_ITEMS_METRIC, TICK_LATENCY_METRIC, TICK_METRIC,
    UNCORRELATED_METRIC,
};
use crate::{
    AttributeMapper, Backoff, BlockRange, CorrelatedEvent, CorrelationStage, Cursor, CursorStore,
    EventSink, Mapper, MetricLabels, Metrics, NoopMetrics, NoopPublisher, Passthrough, Plan,
    Position, Publisher, RangePlanner, SourceAdapter, SourceConfig, SyncError, SyncResult,
    UpsertOutcome,
};

/// Where a source currently is in its tick cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Idle,
    Planning,
    Fetching,
    Sinking,
    Persisting,
    Backoff { retry_count: u32, delay_ms: u64 },
    Finished,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick of this source was still in flight
    Skipped,
    /// Nothing finalized past the cursor
    Idle,
    /// The newest marker did not move; at most the scanned height was saved
    NoNewData { range: BlockRange },
    /// Range sunk and cursor saved
    Progressed {
        range: BlockRange,
        stats: SinkStats,
        position: Position,
        finished: bool,
    },
    /// Bounded source already complete
    Finished,
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Skipped => "skipped",
            TickOutcome::Idle => "idle",
            TickOutcome::NoNewData { .. } => "no_new_data",
            TickOutcome::Progressed { .. } => "progressed",
            TickOutcome::Finished => "finished",
        }
    }
}

/// Per-tick sink counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub publish_failures: usize,
}

/// How [`PollEngine::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Finished,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub source_id: String,
    pub state: EngineState,
    pub cursor: Option<Cursor>,
    pub retry_count: u32,
}

pub struct PollEngine<A, S, E>
where
    A: SourceAdapter + ?Sized,
    S: CursorStore,
    E: EventSink,
{
    config: SourceConfig,
    adapter: Arc<A>,
    store: Arc<S>,
    sink: Arc<E>,
    publisher: Arc<dyn Publisher>,
    correlation: Arc<dyn CorrelationStage>,
    mapper: Arc<dyn Mapper>,
    metrics: Arc<dyn Metrics>,
    planner: RangePlanner,
    labels: MetricLabels,
    cursor: RwLock<Option<Cursor>>,
    state: StdRwLock<EngineState>,
    backoff: StdMutex<Backoff>,
    tick_lock: Mutex<()>,
    initialized: AtomicBool,
}

impl<A, S, E> PollEngine<A, S, E>
where
    A: SourceAdapter + ?Sized + 'static,
    S: CursorStore + 'static,
    E: EventSink + 'static,
{
    /// Engine with pass-through correlation, the default attribute mapper, no
    /// publisher and no metrics. Use the `with_*` methods to plug in the rest.
    pub fn new(config: SourceConfig, adapter: Arc<A>, store: Arc<S>, sink: Arc<E>) -> Self {
        let labels = MetricLabels {
            source_id: config.source_id.clone(),
            chain_id: config.chain_id,
            commitment: config.commitment.clone(),
            extra: Vec::new(),
        };
        Self {
            planner: RangePlanner::from_config(&config),
            backoff: StdMutex::new(Backoff::from_config(&config.backoff)),
            mapper: Arc::new(AttributeMapper::new(config.chain_id)),
            publisher: Arc::new(NoopPublisher),
            correlation: Arc::new(Passthrough),
            metrics: Arc::new(NoopMetrics),
            labels,
            config,
            adapter,
            store,
            sink,
            cursor: RwLock::new(None),
            state: StdRwLock::new(EngineState::Init),
            tick_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationStage>) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn reset_backoff(&self) {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_interval_ms)
    }

    pub async fn cursor(&self) -> Option<Cursor> {
        self.cursor.read().await.clone()
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            source_id: self.config.source_id.clone(),
            state: self.state(),
            cursor: self.cursor().await,
            retry_count: self.backoff.lock().unwrap_or_else(|e| e.into_inner()).retry_count(),
        }
    }

    /// Load the persisted cursor. Runs automatically before the first tick.
    pub async fn init(&self) -> SyncResult<()> {
        let cursor = self.store.get(&self.config.source_id).await?;
        match &cursor {
            Some(c) => info!(
                "[{}] resuming from {} (saved at {})",
                self.config.source_id, c.position, c.updated_at
            ),
            None => info!(
                "[{}] no cursor yet, starting at {}",
                self.config.source_id,
                self.config
                    .from_block
                    .or(self.config.genesis_block)
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "the finalized height".to_string())
            ),
        }
        let finished = self.planner.is_complete(cursor.as_ref());
        *self.cursor.write().await = cursor;
        self.initialized.store(true, Ordering::SeqCst);
        self.set_state(if finished {
            EngineState::Finished
        } else {
            EngineState::Idle
        });
        Ok(())
    }

    /// Run one tick. Never overlaps with another tick of this engine.
    pub async fn tick(&self) -> SyncResult<TickOutcome> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("[{}] tick still in flight, skipping", self.config.source_id);
            self.record_tick_outcome("skipped");
            return Ok(TickOutcome::Skipped);
        };
        if !self.initialized.load(Ordering::SeqCst) {
            self.init().await?;
        }

        let started = Instant::now();
        let result = self.run_tick().await;
        self.metrics.measure(
            TICK_LATENCY_METRIC,
            started.elapsed().as_millis() as f64,
            &self.labels,
        );

        match &result {
            Ok(outcome) => self.record_tick_outcome(outcome.label()),
            Err(e) => {
                if !matches!(self.state(), EngineState::Finished) {
                    self.set_state(EngineState::Idle);
                }
                let label = match e {
                    SyncError::InvalidRange { .. } => {
                        self.metrics.count(INVALID_RANGE_METRIC, &self.labels);
                        "invalid_range"
                    }
                    e if e.is_retryable() => "transient_error",
                    _ => "error",
                };
                self.record_tick_outcome(label);
            }
        }
        result
    }

    fn record_tick_outcome(&self, outcome: &str) {
        self.metrics
            .count(TICK_METRIC, &self.labels.with(OUTCOME_TAG, outcome));
    }

    async fn run_tick(&self) -> SyncResult<TickOutcome> {
        self.set_state(EngineState::Planning);
        let cursor = self.cursor.read().await.clone();
        if self.planner.is_complete(cursor.as_ref()) {
            self.set_state(EngineState::Finished);
            return Ok(TickOutcome::Finished);
        }

        let finalized = with_deadline(
            "get_finalized_height",
            self.call_timeout(),
            self.adapter.get_finalized_height(),
        )
        .await?;

        let range = match self
            .planner
            .plan(cursor.as_ref(), finalized, self.config.max_batch_size)
        {
            Plan::Range(range) => range,
            Plan::Idle => {
                self.set_state(EngineState::Idle);
                if let Some(c) = &cursor {
                    self.metrics.measure(
                        LAG_METRIC,
                        finalized.saturating_sub(c.position.scanned_to()) as f64,
                        &self.labels,
                    );
                }
                return Ok(TickOutcome::Idle);
            }
            Plan::Finished => {
                self.set_state(EngineState::Finished);
                return Ok(TickOutcome::Finished);
            }
        };

        if let Some(c) = &cursor {
            if range.from < c.position.high_water() {
                return Err(SyncError::InvalidRange {
                    from: range.from,
                    to: range.to,
                    reason: format!("starts before persisted cursor {}", c.position),
                });
            }
        }

        self.set_state(EngineState::Fetching);
        debug!("[{}] fetching {} (finalized {})", self.config.source_id, range, finalized);
        let fetched = with_deadline(
            "get_events_in_range",
            self.call_timeout(),
            self.adapter.get_events_in_range(range.from, range.to),
        )
        .await?;

        let mut raw = Vec::with_capacity(fetched.len());
        for event in fetched {
            if range.contains(event.block) {
                raw.push(event);
            } else {
                warn!(
                    "[{}] adapter returned event {} at {} outside {}, ignoring",
                    self.config.source_id, event.tx_hash, event.block, range
                );
            }
        }
        let newest_marker = raw.iter().map(|e| e.block).max();
        let raw_count = raw.len();

        let correlated = with_deadline(
            "correlate",
            self.call_timeout(),
            self.correlation.correlate(raw),
        )
        .await?;
        if correlated.len() < raw_count {
            self.metrics.measure(
                UNCORRELATED_METRIC,
                (raw_count - correlated.len()) as f64,
                &self.labels,
            );
        }

        self.set_state(EngineState::Sinking);
        let stats = self.sink_events(correlated).await?;

        let Some(position) = self.planner.advance(cursor.as_ref(), range, newest_marker) else {
            debug!("[{}] no new data in {}", self.config.source_id, range);
            self.set_state(EngineState::Idle);
            return Ok(TickOutcome::NoNewData { range });
        };
        let new_marker = self
            .planner
            .has_new_marker(cursor.as_ref(), &position, newest_marker);

        self.set_state(EngineState::Persisting);
        self.store.save(&self.config.source_id, position).await?;
        let saved = Cursor::new(self.config.source_id.clone(), position);
        let finished = self.planner.is_complete(Some(&saved));
        *self.cursor.write().await = Some(saved);

        self.metrics
            .measure(CURSOR_METRIC, position.high_water() as f64, &self.labels);
        self.metrics
            .measure(CURSOR_DIFF_METRIC, position.diff() as f64, &self.labels);
        self.metrics.measure(
            LAG_METRIC,
            finalized.saturating_sub(position.scanned_to()) as f64,
            &self.labels,
        );

        if finished {
            info!("[{}] reached to_block, source finished", self.config.source_id);
            self.set_state(EngineState::Finished);
        } else {
            self.set_state(EngineState::Idle);
        }
        if !new_marker {
            debug!(
                "[{}] no new marker in {}, scanned up to {}",
                self.config.source_id,
                range,
                position.scanned_to()
            );
            return Ok(TickOutcome::NoNewData { range });
        }

        info!(
            "[{}] processed {}: {} written, {} unchanged, {} skipped",
            self.config.source_id, range, stats.written, stats.unchanged, stats.skipped
        );
        Ok(TickOutcome::Progressed {
            range,
            stats,
            position,
            finished,
        })
    }

    async fn sink_events(&self, events: Vec<CorrelatedEvent>) -> SyncResult<SinkStats> {
        let mut stats = SinkStats::default();
        for event in events {
            let typed = match self.mapper.map(&event, &self.config.filter) {
                Ok(Some(typed)) => typed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "[{}] skipping event tx {} at block {} on chain {}: {}",
                        self.config.source_id, event.raw.tx_hash, event.raw.block, self.config.chain_id, e
                    );
                    self.metrics.count(SKIPPED_ITEMS_METRIC, &self.labels);
                    stats.skipped += 1;
                    continue;
                }
            };
            if typed.identity.chain_id != self.config.chain_id {
                warn!(
                    "[{}] mapper produced chain {} for tx {}, expected {}",
                    self.config.source_id, typed.identity.chain_id, event.raw.tx_hash, self.config.chain_id
                );
                self.metrics.count(SKIPPED_ITEMS_METRIC, &self.labels);
                stats.skipped += 1;
                continue;
            }

            match self.sink.upsert(&typed.identity, &typed.payload).await? {
                UpsertOutcome::Inserted | UpsertOutcome::Updated => stats.written += 1,
                UpsertOutcome::Unchanged => stats.unchanged += 1,
            }

            if let Err(e) = self.publisher.publish(&typed.identity, &typed.payload).await {
                warn!(
                    "[{}] failed to publish {}: {}",
                    self.config.source_id, typed.identity, e
                );
                self.metrics.count(PUBLISH_FAILURES_METRIC, &self.labels);
                stats.publish_failures += 1;
            }
        }
        if stats.written > 0 {
            self.metrics
                .measure(EVENTS_SUNK_METRIC, stats.written as f64, &self.labels);
        }
        Ok(stats)
    }

    /// Tick until finished or cancelled, backing off on retryable failures.
    pub async fn run(&self, cancel: CancellationToken) -> RunExit {
        info!(
            "[{}] starting {} source on chain {} (batch {}, every {}ms)",
            self.config.source_id,
            self.config.kind.as_str(),
            self.config.chain_id,
            self.config.max_batch_size,
            self.config.tick_interval_ms
        );
        loop {
            if cancel.is_cancelled() {
                info!("[{}] stopped", self.config.source_id);
                return RunExit::Cancelled;
            }

            let wait = match self.tick().await {
                Ok(TickOutcome::Finished)
                | Ok(TickOutcome::Progressed { finished: true, .. }) => {
                    self.reset_backoff();
                    info!("[{}] finished", self.config.source_id);
                    return RunExit::Finished;
                }
                Ok(TickOutcome::Skipped) => self.tick_interval(),
                Ok(_) => {
                    self.reset_backoff();
                    self.tick_interval()
                }
                Err(e) if e.is_retryable() => {
                    let (delay, retry_count) = {
                        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
                        let delay = backoff.next_delay();
                        (delay, backoff.retry_count())
                    };
                    warn!(
                        "[{}] {} (retry {} in {:?})",
                        self.config.source_id, e, retry_count, delay
                    );
                    self.set_state(EngineState::Backoff {
                        retry_count,
                        delay_ms: delay.as_millis() as u64,
                    });
                    delay
                }
                Err(e) => {
                    error!("[{}] tick failed: {}", self.config.source_id, e);
                    self.tick_interval()
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] stopped", self.config.source_id);
                    return RunExit::Cancelled;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// A source loop the scheduler can own without knowing its backends
#[async_trait]
pub trait PollJob: Send + Sync {
    fn source_id(&self) -> &str;

    async fn run(&self, cancel: CancellationToken) -> RunExit;
}

#[async_trait]
impl<A, S, E> PollJob for PollEngine<A, S, E>
where
    A: SourceAdapter + ?Sized + 'static,
    S: CursorStore + 'static,
    E: EventSink + 'static,
{
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    async fn run(&self, cancel: CancellationToken) -> RunExit {
        PollEngine::run(self, cancel).await
    }
}
