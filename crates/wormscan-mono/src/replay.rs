//! File-backed source adapter
//!
//! Replays newline-delimited JSON [`RawEvent`]s from a local file. The file is
//! re-read on every call, so events appended while the binary runs are picked
//! up on the next tick, and the newest block in the file is the finalized
//! height unless a fixed one is configured.

use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::RwLock;
use wormscan_sync::{
    BlockRange, Counterpart, EventIndexLookup, PacketKey, PacketLookup, RawEvent, SourceAdapter,
    SyncError, SyncResult,
};

/// Parse JSONL; blank lines are ignored and malformed lines are logged and skipped.
pub fn parse_events(raw: &str, origin: &Path) -> Vec<RawEvent> {
    let mut events = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("{}:{}: skipping malformed event: {}", origin.display(), index + 1, e),
        }
    }
    events
}

async fn read_events(path: &Path) -> SyncResult<Vec<RawEvent>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        SyncError::TransientFetch(format!("reading {}: {}", path.display(), e))
    })?;
    Ok(parse_events(&raw, path))
}

#[derive(Debug, Clone)]
pub struct ReplayAdapter {
    path: PathBuf,
    finalized_height: Option<u64>,
}

impl ReplayAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            finalized_height: None,
        }
    }

    pub fn with_finalized_height(mut self, height: u64) -> Self {
        self.finalized_height = Some(height);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for ReplayAdapter {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        if let Some(height) = self.finalized_height {
            return Ok(height);
        }
        let events = read_events(&self.path).await?;
        Ok(events.iter().map(|e| e.block).max().unwrap_or(0))
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        let range = BlockRange::new(from, to)?;
        let mut events: Vec<RawEvent> = read_events(&self.path)
            .await?
            .into_iter()
            .filter(|e| range.contains(e.block))
            .collect();
        events.sort_by_key(|e| e.block);
        debug!("replayed {} events in {} from {}", events.len(), range, self.path.display());
        Ok(events)
    }
}

/// Counterparty lookup over a replay file, re-indexed when the file changes
pub struct ReplayLookup {
    path: PathBuf,
    index: RwLock<Option<(SystemTime, EventIndexLookup)>>,
}

impl ReplayLookup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: RwLock::new(None),
        }
    }

    async fn current(&self) -> SyncResult<EventIndexLookup> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| SyncError::TransientFetch(format!("reading {}: {}", self.path.display(), e)))?;

        if let Some((indexed_at, index)) = self.index.read().await.as_ref() {
            if *indexed_at == modified {
                return Ok(index.clone());
            }
        }

        let events = read_events(&self.path).await?;
        let index = EventIndexLookup::from_events(&events);
        debug!("indexed {} counterparty packets from {}", index.len(), self.path.display());
        *self.index.write().await = Some((modified, index.clone()));
        Ok(index)
    }
}

#[async_trait]
impl PacketLookup for ReplayLookup {
    async fn find_counterpart(&self, key: &PacketKey) -> SyncResult<Option<Counterpart>> {
        self.current().await?.find_counterpart(key).await
    }
}
