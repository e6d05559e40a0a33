//! # Packet Correlation
//!
//! Gateway transfers are only half a message: the first-pass event carries an
//! IBC packet, and the message is complete once the packet is matched to the
//! receive/redeem on the counterparty chain. [`PacketCorrelator`] parses the
//! packet fields out of each event's [`AttributeBag`], builds a composite
//! [`PacketKey`], and issues one bounded lookup per distinct candidate.
//!
//! Candidates that do not resolve within the tick are dropped, not retried: an
//! overlapping range will present them again, and gap detection catches the ones
//! that never resolve. Lookup timeouts and transient failures abort the tick
//! instead, so the whole range is retried after backoff.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;

use crate::adapters::with_deadline;
use crate::{AttributeBag, CorrelatedEvent, CorrelationStage, Counterpart, RawEvent, SyncResult};

pub const PACKET_SEQUENCE: &str = "packet_sequence";
pub const PACKET_SRC_PORT: &str = "packet_src_port";
pub const PACKET_SRC_CHANNEL: &str = "packet_src_channel";
pub const PACKET_DST_PORT: &str = "packet_dst_port";
pub const PACKET_DST_CHANNEL: &str = "packet_dst_channel";
pub const PACKET_TIMEOUT_TIMESTAMP: &str = "packet_timeout_timestamp";
pub const PACKET_RECEIVER: &str = "packet_receiver";

const REQUIRED: [&str; 3] = [PACKET_SEQUENCE, PACKET_SRC_CHANNEL, PACKET_DST_CHANNEL];

/// Identity of an IBC packet across both chains
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub sequence: u64,
    pub src_port: String,
    pub src_channel: String,
    pub dst_port: String,
    pub dst_channel: String,
    pub timeout_timestamp: Option<u64>,
}

impl PacketKey {
    /// `Ok(None)` when the event carries no packet at all.
    pub fn from_attributes(attributes: &AttributeBag) -> SyncResult<Option<Self>> {
        if !attributes.has_all(&REQUIRED) {
            return Ok(None);
        }
        Ok(Some(Self {
            sequence: attributes.require_u64(PACKET_SEQUENCE)?,
            src_port: attributes.get(PACKET_SRC_PORT).unwrap_or("transfer").to_string(),
            src_channel: attributes.require(PACKET_SRC_CHANNEL)?.to_string(),
            dst_port: attributes.get(PACKET_DST_PORT).unwrap_or("transfer").to_string(),
            dst_channel: attributes.require(PACKET_DST_CHANNEL)?.to_string(),
            timeout_timestamp: attributes.get_u64(PACKET_TIMEOUT_TIMESTAMP)?,
        }))
    }

    /// Composite key both legs agree on. Ports default to `transfer` and the
    /// timeout is informational, so neither is part of it.
    pub fn lookup_key(&self) -> String {
        format!("{}/{}/{:020}", self.src_channel, self.dst_channel, self.sequence)
    }
}

/// Second-leg lookup against the counterparty chain
#[async_trait]
pub trait PacketLookup: Send + Sync {
    async fn find_counterpart(&self, key: &PacketKey) -> SyncResult<Option<Counterpart>>;
}

pub struct PacketCorrelator<L> {
    lookup: L,
    timeout: Duration,
}

impl<L: PacketLookup> PacketCorrelator<L> {
    pub fn new(lookup: L, timeout: Duration) -> Self {
        Self { lookup, timeout }
    }
}

#[async_trait]
impl<L: PacketLookup> CorrelationStage for PacketCorrelator<L> {
    async fn correlate(&self, events: Vec<RawEvent>) -> SyncResult<Vec<CorrelatedEvent>> {
        let mut resolved: HashMap<String, Option<Counterpart>> = HashMap::new();
        let mut out = Vec::with_capacity(events.len());

        for event in events {
            let key = match PacketKey::from_attributes(&event.attributes) {
                Ok(Some(key)) => key,
                Ok(None) => {
                    out.push(CorrelatedEvent::from(event));
                    continue;
                }
                Err(e) => {
                    warn!("dropping event {} with unusable packet attributes: {}", event.tx_hash, e);
                    continue;
                }
            };

            let lookup_key = key.lookup_key();
            let counterpart = match resolved.get(&lookup_key) {
                Some(cached) => cached.clone(),
                None => {
                    let found =
                        with_deadline("find_counterpart", self.timeout, self.lookup.find_counterpart(&key))
                            .await?;
                    resolved.insert(lookup_key.clone(), found.clone());
                    found
                }
            };

            match counterpart {
                Some(counterpart) => out.push(CorrelatedEvent {
                    raw: event,
                    counterpart: Some(counterpart),
                }),
                None => debug!(
                    "packet {} from tx {} not resolved this tick",
                    lookup_key, event.tx_hash
                ),
            }
        }
        Ok(out)
    }
}

/// Lookup over an already fetched batch of counterparty events
#[derive(Debug, Clone, Default)]
pub struct EventIndexLookup {
    index: HashMap<String, Counterpart>,
}

impl EventIndexLookup {
    /// Index every event carrying packet attributes; others are ignored.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a RawEvent>) -> Self {
        let mut index = HashMap::new();
        for event in events {
            if let Ok(Some(key)) = PacketKey::from_attributes(&event.attributes) {
                index.insert(
                    key.lookup_key(),
                    Counterpart {
                        tx_hash: event.tx_hash.clone(),
                        emitter: event.attributes.get(PACKET_RECEIVER).map(str::to_string),
                        block: event.block,
                    },
                );
            }
        }
        Self { index }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl PacketLookup for EventIndexLookup {
    async fn find_counterpart(&self, key: &PacketKey) -> SyncResult<Option<Counterpart>> {
        Ok(self.index.get(&key.lookup_key()).cloned())
    }
}
