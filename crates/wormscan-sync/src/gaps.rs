//! # Gap Detection and Backfill
//!
//! Every emitter numbers its messages with a strictly increasing sequence, so a
//! hole in the persisted sequences of one emitter is a message the pollers
//! missed. [`GapDetector`] finds the holes from the sink's message keys and
//! bounds each one by the blocks of its two observed neighbours: the missing
//! message must have been emitted somewhere in between.
//!
//! Holes are kept as [`GapSpan`]s; only the first [`MAX_GAPS_PER_EMITTER`]
//! missing sequences of each emitter are expanded into [`GapRecord`]s, so a
//! single outlier sequence cannot blow up a scan. Backfilling and scanning
//! again works through the rest.
//!
//! [`Backfiller`] re-fetches those bounded ranges through the same correlate →
//! map → upsert path the engine uses, writing only the identities that were
//! missing. It never reads or writes a cursor, so it can run next to a live
//! source. Gaps that the chain does not contain either are reported as
//! permanent for an operator to look at.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::with_deadline;
use crate::keys::decode_message_id;
use crate::{
    AttributeMapper, BlockRange, CorrelationStage, EmitterAddress, EventSink, FilterConfig,
    GapRecord, Mapper, MessageIdentity, NoopPublisher, Passthrough, Publisher, SourceAdapter,
    SourceConfig, SyncResult,
};

/// Missing sequences expanded into records per emitter and scan
pub const MAX_GAPS_PER_EMITTER: u64 = 10_000;

/// Consecutive missing sequences of one emitter, between two observed neighbours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapSpan {
    pub chain_id: u16,
    pub emitter: EmitterAddress,
    pub first_missing: u64,
    pub last_missing: u64,
    pub bounding_range: BlockRange,
}

impl GapSpan {
    pub fn len(&self) -> u64 {
        self.last_missing - self.first_missing + 1
    }

    /// One record per missing sequence, lazily
    pub fn records(&self) -> impl Iterator<Item = GapRecord> + '_ {
        (self.first_missing..=self.last_missing).map(move |missing_sequence| GapRecord {
            chain_id: self.chain_id,
            emitter: self.emitter.clone(),
            missing_sequence,
            bounding_range: self.bounding_range,
        })
    }
}

/// Gaps found in one chain's persisted keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapScan {
    /// Per-sequence records, at most [`MAX_GAPS_PER_EMITTER`] per emitter
    pub gaps: Vec<GapRecord>,
    pub spans: Vec<GapSpan>,
    /// Missing sequences left out of `gaps` by the per-emitter cap
    pub truncated: u64,
    /// Keys that could not be decoded
    pub skipped: usize,
    /// Distinct emitters seen on the chain
    pub emitters: usize,
}

impl GapScan {
    /// Every missing sequence, including the ones not expanded
    pub fn missing(&self) -> u64 {
        self.spans.iter().map(GapSpan::len).sum()
    }
}

pub struct GapDetector;

impl GapDetector {
    /// Find missing sequences among `keys` for `chain_id`.
    ///
    /// Keys of other chains are ignored; malformed keys are logged and counted.
    pub fn detect<I, K>(chain_id: u16, keys: I) -> GapScan
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        Self::detect_with_limit(chain_id, keys, MAX_GAPS_PER_EMITTER)
    }

    pub fn detect_with_limit<I, K>(chain_id: u16, keys: I, per_emitter: u64) -> GapScan
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut by_emitter: BTreeMap<EmitterAddress, BTreeMap<u64, u64>> = BTreeMap::new();
        let mut skipped = 0;

        for key in keys {
            let key = key.as_ref();
            let decoded = match decode_message_id(key) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("skipping undecodable message key: {}", e);
                    skipped += 1;
                    continue;
                }
            };
            if decoded.chain_id != chain_id {
                continue;
            }
            // The same sequence seen at two heights keeps the lower one
            let height = by_emitter
                .entry(decoded.emitter)
                .or_default()
                .entry(decoded.sequence)
                .or_insert(decoded.height);
            *height = (*height).min(decoded.height);
        }

        let mut scan = GapScan {
            skipped,
            emitters: by_emitter.len(),
            ..GapScan::default()
        };
        for (emitter, sequences) in &by_emitter {
            let mut budget = per_emitter;
            let mut previous: Option<(u64, u64)> = None;
            for (&sequence, &height) in sequences {
                if let Some((prev_sequence, prev_height)) = previous {
                    if sequence > prev_sequence + 1 {
                        let span = GapSpan {
                            chain_id,
                            emitter: emitter.clone(),
                            first_missing: prev_sequence + 1,
                            last_missing: sequence - 1,
                            bounding_range: BlockRange {
                                from: prev_height.min(height),
                                to: prev_height.max(height),
                            },
                        };
                        let take = span.len().min(budget);
                        scan.gaps.extend(span.records().take(take as usize));
                        scan.truncated += span.len() - take;
                        budget -= take;
                        scan.spans.push(span);
                    }
                }
                previous = Some((sequence, height));
            }
        }

        if !scan.spans.is_empty() {
            info!(
                "chain {}: {} missing sequences in {} spans across {} emitters",
                chain_id,
                scan.missing(),
                scan.spans.len(),
                scan.emitters
            );
        }
        if scan.truncated > 0 {
            warn!(
                "chain {}: {} missing sequences beyond {} per emitter not listed",
                chain_id, scan.truncated, per_emitter
            );
        }
        scan
    }

    /// List the sink's keys for `chain_id` and detect gaps in them.
    pub async fn scan<E: EventSink + ?Sized>(sink: &E, chain_id: u16) -> SyncResult<GapScan> {
        let keys = sink.message_keys(chain_id).await?;
        Ok(Self::detect(chain_id, keys))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub recovered: Vec<MessageIdentity>,
    pub permanent: Vec<GapRecord>,
}

impl BackfillReport {
    pub fn is_complete(&self) -> bool {
        self.permanent.is_empty()
    }
}

/// Re-fetches bounded ranges to close gaps. Never touches a cursor.
pub struct Backfiller<A: SourceAdapter + ?Sized, E: EventSink> {
    adapter: Arc<A>,
    sink: Arc<E>,
    correlation: Arc<dyn CorrelationStage>,
    mapper: Arc<dyn Mapper>,
    publisher: Arc<dyn Publisher>,
    filter: FilterConfig,
    chain_id: u16,
    batch_size: u64,
    call_timeout: Duration,
}

impl<A: SourceAdapter + ?Sized, E: EventSink> Backfiller<A, E> {
    pub fn new(config: &SourceConfig, adapter: Arc<A>, sink: Arc<E>) -> Self {
        Self {
            adapter,
            sink,
            correlation: Arc::new(Passthrough),
            mapper: Arc::new(AttributeMapper::new(config.chain_id)),
            publisher: Arc::new(NoopPublisher),
            filter: config.filter.clone(),
            chain_id: config.chain_id,
            batch_size: config.max_batch_size,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationStage>) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    fn chunk_size(&self) -> u64 {
        self.adapter
            .maximum_batch_size()
            .unwrap_or(self.batch_size)
            .max(1)
    }

    /// Try to recover every gap; whatever the chain does not hold is reported
    /// as permanent.
    pub async fn close(&self, gaps: Vec<GapRecord>) -> SyncResult<BackfillReport> {
        let mut by_range: BTreeMap<BlockRange, HashMap<(EmitterAddress, u64), GapRecord>> =
            BTreeMap::new();
        for gap in gaps {
            if gap.chain_id != self.chain_id {
                warn!(
                    "gap for chain {} handed to chain {} backfiller, ignoring",
                    gap.chain_id, self.chain_id
                );
                continue;
            }
            by_range
                .entry(gap.bounding_range)
                .or_default()
                .insert((gap.emitter.clone(), gap.missing_sequence), gap);
        }

        let mut report = BackfillReport::default();
        for (range, mut wanted) in by_range {
            info!("backfilling {} missing sequences in {}", wanted.len(), range);
            for chunk in range.chunks(self.chunk_size()) {
                self.recover_chunk(chunk, &mut wanted, &mut report).await?;
                if wanted.is_empty() {
                    debug!("all gaps in {} located at {}", range, chunk);
                    break;
                }
            }
            for (_, gap) in wanted {
                warn!("{}", gap.clone().into_permanent_error());
                report.permanent.push(gap);
            }
        }

        report
            .permanent
            .sort_by(|a, b| (&a.emitter, a.missing_sequence).cmp(&(&b.emitter, b.missing_sequence)));
        info!(
            "backfill on chain {}: {} recovered, {} permanent",
            self.chain_id,
            report.recovered.len(),
            report.permanent.len()
        );
        Ok(report)
    }

    async fn recover_chunk(
        &self,
        chunk: BlockRange,
        wanted: &mut HashMap<(EmitterAddress, u64), GapRecord>,
        report: &mut BackfillReport,
    ) -> SyncResult<()> {
        let raw = with_deadline(
            "get_events_in_range",
            self.call_timeout,
            self.adapter.get_events_in_range(chunk.from, chunk.to),
        )
        .await?;
        let correlated =
            with_deadline("correlate", self.call_timeout, self.correlation.correlate(raw)).await?;

        for event in correlated {
            let typed = match self.mapper.map(&event, &self.filter) {
                Ok(Some(typed)) => typed,
                Ok(None) => continue,
                Err(e) => {
                    debug!("backfill skipping tx {}: {}", event.raw.tx_hash, e);
                    continue;
                }
            };
            let id = (typed.identity.emitter.clone(), typed.identity.sequence);
            if typed.identity.chain_id != self.chain_id || !wanted.contains_key(&id) {
                continue;
            }

            self.sink.upsert(&typed.identity, &typed.payload).await?;
            if let Err(e) = self.publisher.publish(&typed.identity, &typed.payload).await {
                warn!("failed to publish recovered {}: {}", typed.identity, e);
            }
            info!("recovered {}", typed.identity);
            wanted.remove(&id);
            report.recovered.push(typed.identity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::encode_message_id;
    use crate::mock::{raw_event, MemoryEventSink, ScriptedSource};
    use crate::CorrelatedEvent;

    const EMITTER: &str = "0x0a";

    fn emitter() -> EmitterAddress {
        EmitterAddress::parse(EMITTER).unwrap()
    }

    async fn sink_events(sink: &MemoryEventSink, events: &[crate::RawEvent]) {
        let mapper = AttributeMapper::new(2);
        for event in events {
            let typed = mapper
                .map(&CorrelatedEvent::from(event.clone()), &FilterConfig::default())
                .unwrap()
                .unwrap();
            sink.upsert(&typed.identity, &typed.payload).await.unwrap();
        }
    }

    #[test]
    fn test_detects_missing_sequences_with_bounds() {
        let other = EmitterAddress::parse("0x0b").unwrap();
        let keys = vec![
            encode_message_id(2, 10, &emitter(), 1),
            encode_message_id(2, 20, &emitter(), 2),
            encode_message_id(2, 45, &emitter(), 5),
            encode_message_id(2, 11, &other, 7),
            encode_message_id(2, 12, &other, 8),
            encode_message_id(4, 99, &emitter(), 40),
            "garbage".to_string(),
        ];
        let scan = GapDetector::detect(2, &keys);
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.emitters, 2);
        let missing: Vec<u64> = scan.gaps.iter().map(|g| g.missing_sequence).collect();
        assert_eq!(missing, vec![3, 4]);
        assert!(scan
            .gaps
            .iter()
            .all(|g| g.bounding_range == BlockRange { from: 20, to: 45 }));
    }

    #[test]
    fn test_outlier_sequence_is_one_capped_span() {
        let keys = vec![
            encode_message_id(2, 10, &emitter(), 1),
            encode_message_id(2, 20, &emitter(), 1_000_000_000_000),
            encode_message_id(2, 30, &emitter(), 1_000_000_000_003),
        ];
        let scan = GapDetector::detect_with_limit(2, &keys, 4);

        assert_eq!(scan.spans.len(), 2);
        assert_eq!(scan.spans[0].first_missing, 2);
        assert_eq!(scan.spans[0].last_missing, 999_999_999_999);
        assert_eq!(scan.missing(), 999_999_999_998 + 2);
        let listed: Vec<u64> = scan.gaps.iter().map(|g| g.missing_sequence).collect();
        assert_eq!(listed, vec![2, 3, 4, 5]);
        assert_eq!(scan.truncated, scan.missing() - 4);

        // The default cap bounds the records as well
        assert_eq!(GapDetector::detect(2, &keys).gaps.len() as u64, MAX_GAPS_PER_EMITTER);
    }

    #[test]
    fn test_contiguous_sequences_have_no_gaps() {
        let keys: Vec<String> = (1..=5)
            .map(|s| encode_message_id(2, s * 10, &emitter(), s))
            .collect();
        assert!(GapDetector::detect(2, &keys).gaps.is_empty());
    }

    #[tokio::test]
    async fn test_backfill_closes_gap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let source = ScriptedSource::new().with_max_batch(5);
        let events: Vec<_> = (1..=5).map(|s| raw_event(s * 10, EMITTER, s)).collect();
        for event in &events {
            source.add_event(event.clone());
        }
        let sink = MemoryEventSink::new();
        sink_events(&sink, &[events[0].clone(), events[1].clone(), events[3].clone(), events[4].clone()]).await;

        let scan = GapDetector::scan(&sink, 2).await.unwrap();
        assert_eq!(scan.gaps.len(), 1);

        let config = SourceConfig::new("backfill", 2);
        let backfiller = Backfiller::new(&config, Arc::new(source.clone()), Arc::new(sink.clone()));
        let report = backfiller.close(scan.gaps).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].sequence, 3);
        assert_eq!(sink.sequences(2, emitter().as_str()).await, vec![1, 2, 3, 4, 5]);
        // [20, 40] in pages of 5 stops once block 30 is read
        assert_eq!(
            source.calls(),
            vec![
                BlockRange { from: 20, to: 24 },
                BlockRange { from: 25, to: 29 },
                BlockRange { from: 30, to: 34 },
            ]
        );
        assert!(GapDetector::scan(&sink, 2).await.unwrap().gaps.is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_gap_is_permanent() {
        let source = ScriptedSource::new();
        let events = vec![raw_event(10, EMITTER, 1), raw_event(30, EMITTER, 3)];
        for event in &events {
            source.add_event(event.clone());
        }
        let sink = MemoryEventSink::new();
        sink_events(&sink, &events).await;

        let scan = GapDetector::scan(&sink, 2).await.unwrap();
        let backfiller =
            Backfiller::new(&SourceConfig::new("backfill", 2), Arc::new(source), Arc::new(sink.clone()));
        let report = backfiller.close(scan.gaps).await.unwrap();

        assert!(report.recovered.is_empty());
        assert_eq!(report.permanent.len(), 1);
        let err = report.permanent[0].clone().into_permanent_error();
        assert!(err.to_string().contains("sequence 2"));
        assert_eq!(sink.len().await, 2);
    }
}
