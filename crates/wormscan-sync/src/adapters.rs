//! # Chain Quirk Adapters
//!
//! Wrappers around a [`SourceAdapter`] that absorb per-chain behaviour while
//! keeping the finalized-height + inclusive-range contract intact:
//!
//! - [`Paginated`]: nodes that cap the block span of a single log query
//! - [`Timed`]: explicit deadline on every call, so a hung node becomes a
//!   retryable [`SyncError::Timeout`] instead of a stuck source
//! - [`Lagged`]: chains without a finalized tag, or L2 heights anchored a fixed
//!   depth behind their L1 confirmation
//! - [`ConfirmedTwice`]: nodes whose head must be read twice before it is trusted
//! - [`PrunedTolerant`]: archival gaps where the node answers `null` for blocks
//!   it no longer keeps
//!
//! Wrappers compose through [`SourceAdapterExt`]:
//!
//! ```rust,ignore
//! let source = rpc_adapter
//!     .pruned_tolerant()
//!     .paginated(1_000)
//!     .lagged(64)
//!     .with_timeout(Duration::from_secs(10));
//! ```

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

use crate::{BlockRange, RawEvent, SourceAdapter, SyncError, SyncResult};

/// Splits every range fetch into pages of at most `page_size` heights.
#[derive(Debug, Clone)]
pub struct Paginated<A> {
    inner: A,
    page_size: u64,
}

impl<A> Paginated<A> {
    pub fn new(inner: A, page_size: u64) -> Self {
        Self {
            inner,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for Paginated<A> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        self.inner.get_finalized_height().await
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        let range = BlockRange::new(from, to)?;
        let mut events = Vec::new();
        for page in range.chunks(self.page_size) {
            let mut batch = self.inner.get_events_in_range(page.from, page.to).await?;
            debug!("page {} returned {} events", page, batch.len());
            events.append(&mut batch);
        }
        Ok(events)
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        Some(self.page_size)
    }
}

/// Bounds every call by `timeout`.
#[derive(Debug, Clone)]
pub struct Timed<A> {
    inner: A,
    timeout: Duration,
}

impl<A> Timed<A> {
    pub fn new(inner: A, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

/// Await `fut`, turning an elapsed deadline into [`SyncError::Timeout`].
pub async fn with_deadline<T, F>(operation: &str, timeout: Duration, fut: F) -> SyncResult<T>
where
    F: std::future::Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation: operation.to_string(),
            millis: timeout.as_millis() as u64,
        }),
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for Timed<A> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        with_deadline("get_finalized_height", self.timeout, self.inner.get_finalized_height()).await
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        with_deadline(
            "get_events_in_range",
            self.timeout,
            self.inner.get_events_in_range(from, to),
        )
        .await
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        self.inner.maximum_batch_size()
    }
}

/// Reports `head - confirmations` as finalized.
#[derive(Debug, Clone)]
pub struct Lagged<A> {
    inner: A,
    confirmations: u64,
}

impl<A> Lagged<A> {
    pub fn new(inner: A, confirmations: u64) -> Self {
        Self { inner, confirmations }
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for Lagged<A> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        let head = self.inner.get_finalized_height().await?;
        Ok(head.saturating_sub(self.confirmations))
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        self.inner.get_events_in_range(from, to).await
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        self.inner.maximum_batch_size()
    }
}

/// Reads the head twice, `delay` apart, and trusts the lower reading.
#[derive(Debug, Clone)]
pub struct ConfirmedTwice<A> {
    inner: A,
    delay: Duration,
}

impl<A> ConfirmedTwice<A> {
    pub fn new(inner: A, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for ConfirmedTwice<A> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        let first = self.inner.get_finalized_height().await?;
        tokio::time::sleep(self.delay).await;
        let second = self.inner.get_finalized_height().await?;
        if first != second {
            debug!("finalized height moved between reads: {} -> {}", first, second);
        }
        Ok(first.min(second))
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        self.inner.get_events_in_range(from, to).await
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        self.inner.maximum_batch_size()
    }
}

/// Skips blocks the node reports as pruned instead of failing the whole range.
#[derive(Debug, Clone)]
pub struct PrunedTolerant<A> {
    inner: A,
}

impl<A> PrunedTolerant<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for PrunedTolerant<A> {
    async fn get_finalized_height(&self) -> SyncResult<u64> {
        self.inner.get_finalized_height().await
    }

    async fn get_events_in_range(&self, from: u64, to: u64) -> SyncResult<Vec<RawEvent>> {
        match self.inner.get_events_in_range(from, to).await {
            Err(SyncError::Pruned(block)) => {
                warn!(
                    "block {} pruned while fetching [{}, {}], retrying block by block",
                    block, from, to
                );
                let mut events = Vec::new();
                for height in from..=to {
                    match self.inner.get_events_in_range(height, height).await {
                        Ok(mut batch) => events.append(&mut batch),
                        Err(SyncError::Pruned(pruned)) => {
                            warn!("skipping pruned block {}", pruned);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(events)
            }
            other => other,
        }
    }

    fn maximum_batch_size(&self) -> Option<u64> {
        self.inner.maximum_batch_size()
    }
}

/// Combinators for stacking quirk wrappers
pub trait SourceAdapterExt: SourceAdapter + Sized {
    fn paginated(self, page_size: u64) -> Paginated<Self> {
        Paginated::new(self, page_size)
    }

    fn with_timeout(self, timeout: Duration) -> Timed<Self> {
        Timed::new(self, timeout)
    }

    fn lagged(self, confirmations: u64) -> Lagged<Self> {
        Lagged::new(self, confirmations)
    }

    fn confirmed_twice(self, delay: Duration) -> ConfirmedTwice<Self> {
        ConfirmedTwice::new(self, delay)
    }

    fn pruned_tolerant(self) -> PrunedTolerant<Self> {
        PrunedTolerant::new(self)
    }
}

impl<A: SourceAdapter + Sized> SourceAdapterExt for A {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{raw_event, ScriptedSource};

    #[tokio::test]
    async fn test_paginated_returns_union_of_pages() {
        let source = ScriptedSource::new().with_max_batch(3);
        for block in 1..=10 {
            source.add_event(raw_event(block, "01", block));
        }
        source.set_finalized(10);

        // Without pagination the capped node rejects the range.
        assert!(source.get_events_in_range(1, 10).await.is_err());

        let paged = source.clone().paginated(3);
        let events = paged.get_events_in_range(1, 10).await.unwrap();
        assert_eq!(events.len(), 10);
        assert_eq!(paged.maximum_batch_size(), Some(3));
        assert!(source.calls().iter().filter(|r| r.len() <= 3).count() >= 4);
    }

    #[tokio::test]
    async fn test_paginated_rejects_inverted_range() {
        let paged = ScriptedSource::new().paginated(5);
        match paged.get_events_in_range(9, 3).await {
            Err(SyncError::InvalidRange { from: 9, to: 3, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timed_turns_hang_into_timeout() {
        let source = ScriptedSource::new().with_latency(Duration::from_millis(200));
        let timed = source.with_timeout(Duration::from_millis(10));
        let err = timed.get_finalized_height().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_lagged_and_confirmed_twice() {
        let source = ScriptedSource::new();
        source.set_finalized(100);
        assert_eq!(source.clone().lagged(64).get_finalized_height().await.unwrap(), 36);
        assert_eq!(source.clone().lagged(500).get_finalized_height().await.unwrap(), 0);
        assert_eq!(
            source
                .clone()
                .confirmed_twice(Duration::from_millis(1))
                .get_finalized_height()
                .await
                .unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn test_pruned_blocks_are_skipped() {
        let source = ScriptedSource::new();
        for block in 1..=5 {
            source.add_event(raw_event(block, "01", block));
        }
        source.prune(3);
        assert!(matches!(
            source.get_events_in_range(1, 5).await,
            Err(SyncError::Pruned(3))
        ));
        let events = source.clone().pruned_tolerant().get_events_in_range(1, 5).await.unwrap();
        let blocks: Vec<u64> = events.iter().map(|e| e.block).collect();
        assert_eq!(blocks, vec![1, 2, 4, 5]);
    }
}
