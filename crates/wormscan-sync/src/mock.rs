//! Mock and in-memory implementations for testing

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{
    keys, AttributeBag, BlockRange, Cursor, CursorStore, EventSink, MessageIdentity, MetricLabels,
    Metrics, Position, Publisher, RawEvent, SourceAdapter, SyncError, SyncResult, UpsertOutcome,
};

/// Raw event carrying `emitter` and `sequence` attributes, as the
/// [`crate::AttributeMapper`] expects by default.
pub fn raw_event(block: u64, emitter: &str, sequence: u64) -> RawEvent {
    RawEvent {
        block,
        timestamp: 1_700_000_000 + block,
        tx_hash: format!("0x{:064x}", block * 1_000_000 + sequence),
        attributes: AttributeBag::from_pairs([
            ("emitter", emitter.to_string()),
            ("sequence", sequence.to_string()),
        ]),
        payload: serde_json::json!({ "sequence": sequence }),
    }
}

/// Scriptable source: events keyed by block, a settable finalized height,
/// queued failures, pruned blocks and an optional per-call range cap.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    events: Arc<RwLock<BTreeMap<u64, Vec<RawEvent>>>>,
    finalized: Arc<RwLock<u64>>,
    height_failures: Arc<RwLock<VecDeque<SyncError>>>,
    fetch_failures: Arc<RwLock<VecDeque<SyncError>>>,
    pruned: Arc<RwLock<HashSet<u64>>>,
    calls: Arc<RwLock<Vec<BlockRange>>>,
    max_batch: Option<u64>,
    latency: Option<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch(mut self, max_batch: u64) -> Self {
        self.max_batch = Some(max_batch);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn add_event(&self, event: RawEvent) {
        let mut events = self.events.write().unwrap();
        events.entry(event.block).or_default().push(event);
    }

    pub fn remove_block(&self, block: u64) {
        self.events.write().unwrap().remove(&block);
    }

    pub fn set_finalized(&self, height: u64) {
        *self.finalized.write().unwrap() = height;
    }

    pub fn prune(&self, block: u64) {
        self.pruned.write().unwrap().insert(block);
    }

    pub fn fail_next_fetch(&self, error: SyncError) {
        self.fetch_failures.write().unwrap().push_back(error);
    }

    pub fn fail_next_height(&self, error: SyncError) {
        self.height_failures.write().unwrap().push_back(error);
    }

    /// Every range requested so far, including rejected ones
    pub fn calls(&self) -> Vec<BlockRange> {
        self.calls.read().unwrap().clone()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        self.simulate_latency().await;
        if let Some(error) = self.height_failures.write().unwrap().pop_front() {
            return Err(error);
        }
        Ok(*self.finalized.read().unwrap())
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        self.simulate_latency().await;
        let range = BlockRange::new(from, to)?;
        self.calls.write().unwrap().push(range);
        if let Some(error) = self.fetch_failures.write().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(max) = self.max_batch {
            if range.len() > max {
                return Err(SyncError::InvalidRange {
                    from,
                    to,
                    reason: format!("node caps ranges at {} blocks", max),
                });
            }
        }
        {
            let pruned = self.pruned.read().unwrap();
            if let Some(block) = (from..=to).find(|b| pruned.contains(b)) {
                return Err(SyncError::Pruned(block));
            }
        }
        let events = self.events.read().unwrap();
        Ok(events
            .range(from..=to)
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect())
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        self.max_batch
    }
}

/// In-memory cursor store that also keeps every saved position
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<HashMap<String, Cursor>>>,
    history: Arc<Mutex<Vec<(String, Position)>>>,
    save_failures: Arc<RwLock<u32>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_saves(&self, count: u32) {
        *self.save_failures.write().unwrap() = count;
    }

    pub async fn history(&self, source_id: &str) -> Vec<Position> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, source_id: &str) -> SyncResult<Option<Cursor>> {
        Ok(self.cursors.lock().await.get(source_id).cloned())
    }

    async fn save(&self, source_id: &str, position: Position) -> SyncResult<()> {
        {
            let mut failures = self.save_failures.write().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Store("simulated cursor write failure".to_string()));
            }
        }
        self.cursors
            .lock()
            .await
            .insert(source_id.to_string(), Cursor::new(source_id, position));
        self.history
            .lock()
            .await
            .push((source_id.to_string(), position));
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> SyncResult<()> {
        self.cursors.lock().await.remove(source_id);
        Ok(())
    }
}

/// In-memory sink keyed by message id
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    messages: Arc<Mutex<BTreeMap<String, serde_json::Value>>>,
    upsert_failures: Arc<RwLock<u32>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_upserts(&self, count: u32) {
        *self.upsert_failures.write().unwrap() = count;
    }

    /// Store a key as-is, bypassing the codec (for corrupt-data tests).
    pub async fn insert_raw(&self, key: &str) {
        self.messages
            .lock()
            .await
            .insert(key.to_string(), serde_json::Value::Null);
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.messages.lock().await.keys().cloned().collect()
    }

    /// Sequences stored for one emitter, ascending
    pub async fn sequences(&self, chain_id: u16, emitter: &str) -> Vec<u64> {
        let mut sequences: Vec<u64> = self
            .keys()
            .await
            .iter()
            .filter_map(|k| keys::decode_message_id(k).ok())
            .filter(|d| d.chain_id == chain_id && d.emitter.as_str() == emitter)
            .map(|d| d.sequence)
            .collect();
        sequences.sort_unstable();
        sequences
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn upsert(
        &self,
        identity: &MessageIdentity,
        payload: &serde_json::Value,
    ) -> SyncResult<UpsertOutcome> {
        {
            let mut failures = self.upsert_failures.write().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Store("simulated sink write failure".to_string()));
            }
        }
        let mut messages = self.messages.lock().await;
        match messages.insert(identity.key(), payload.clone()) {
            None => Ok(UpsertOutcome::Inserted),
            Some(previous) if &previous == payload => Ok(UpsertOutcome::Unchanged),
            Some(_) => Ok(UpsertOutcome::Updated),
        }
    }

    async fn message_keys(&self, chain_id: u16) -> SyncResult<Vec<String>> {
        let prefix = keys::chain_prefix(chain_id);
        Ok(self
            .messages
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

/// Publisher that records every announcement and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<MessageIdentity>>>,
    failing: Arc<RwLock<bool>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().unwrap() = failing;
    }

    pub async fn published(&self) -> Vec<MessageIdentity> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, identity: &MessageIdentity, _payload: &serde_json::Value) -> SyncResult<()> {
        let failing = *self.failing.read().unwrap();
        if failing {
            return Err(SyncError::TransientFetch("bus unavailable".to_string()));
        }
        self.published.lock().await.push(identity.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    pub name: &'static str,
    pub value: Option<f64>,
    pub labels: MetricLabels,
}

/// Metrics sink that keeps every data point
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    points: Arc<RwLock<Vec<RecordedMetric>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self, name: &str) -> Vec<RecordedMetric> {
        self.points
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    /// Count data points of `name` whose extra labels include `key = value`
    pub fn count_with(&self, name: &str, key: &str, value: &str) -> usize {
        self.points(name)
            .iter()
            .filter(|p| p.labels.extra.iter().any(|(k, v)| *k == key && v == value))
            .count()
    }

    pub fn last_value(&self, name: &str) -> Option<f64> {
        self.points(name).last().and_then(|p| p.value)
    }
}

impl Metrics for RecordingMetrics {
    fn count(&self, name: &'static str, labels: &MetricLabels) {
        self.points.write().unwrap().push(RecordedMetric {
            name,
            value: None,
            labels: labels.clone(),
        });
    }

    fn measure(&self, name: &'static str, value: f64, labels: &MetricLabels) {
        self.points.write().unwrap().push(RecordedMetric {
            name,
            value: Some(value),
            labels: labels.clone(),
        });
    }
}
