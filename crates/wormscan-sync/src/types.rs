//! Common types for wormscan-sync

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{keys, AttributeBag, SyncError, SyncResult};

/// Inclusive range of block heights (or markers, for sequence-indexed sources)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> SyncResult<Self> {
        if from > to {
            return Err(SyncError::InvalidRange {
                from,
                to,
                reason: "range start is past its end".to_string(),
            });
        }
        Ok(Self { from, to })
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, height: u64) -> bool {
        self.from <= height && height <= self.to
    }

    /// Split into consecutive sub-ranges of at most `size` heights.
    pub fn chunks(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut from = self.from;
        loop {
            let to = from.saturating_add(size - 1).min(self.to);
            out.push(BlockRange { from, to });
            if to == self.to {
                break;
            }
            from = to + 1;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Resumable position of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Position {
    /// Last fully processed block range
    Blocks { from: u64, to: u64 },
    /// Low/high water marks of a sequence-indexed source, plus the highest
    /// height already scanned so empty stretches are not re-read
    Markers {
        previous_from: u64,
        last_from: u64,
        #[serde(default)]
        scanned_to: u64,
    },
}

impl Position {
    pub fn high_water(&self) -> u64 {
        match *self {
            Position::Blocks { to, .. } => to,
            Position::Markers { last_from, .. } => last_from,
        }
    }

    pub fn low_water(&self) -> u64 {
        match *self {
            Position::Blocks { from, .. } => from,
            Position::Markers { previous_from, .. } => previous_from,
        }
    }

    /// Highest height covered by a completed scan
    pub fn scanned_to(&self) -> u64 {
        match *self {
            Position::Blocks { to, .. } => to,
            Position::Markers {
                last_from,
                scanned_to,
                ..
            } => scanned_to.max(last_from),
        }
    }

    /// Distance between the low and high water marks, reported as `cursor_diff`.
    pub fn diff(&self) -> u64 {
        self.high_water().saturating_sub(self.low_water())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Blocks { from, to } => write!(f, "blocks {{from: {}, to: {}}}", from, to),
            Position::Markers {
                previous_from,
                last_from,
                scanned_to,
            } => write!(
                f,
                "markers {{previous_from: {}, last_from: {}, scanned_to: {}}}",
                previous_from, last_from, scanned_to
            ),
        }
    }
}

/// Persisted per-source position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub source_id: String,
    pub position: Position,
    /// Unix milliseconds of the last save
    pub updated_at: u64,
}

impl Cursor {
    pub fn new(source_id: impl Into<String>, position: Position) -> Self {
        Self {
            source_id: source_id.into(),
            position,
            updated_at: unix_millis(),
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Emitter address normalized to 32 bytes of lowercase hex without a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmitterAddress(String);

pub const EMITTER_HEX_LEN: usize = 64;

impl EmitterAddress {
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let trimmed = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        if trimmed.is_empty() {
            return Err(SyncError::malformed(raw, "empty emitter address"));
        }
        if trimmed.len() > EMITTER_HEX_LEN {
            return Err(SyncError::malformed(
                raw,
                format!("emitter longer than {} hex characters", EMITTER_HEX_LEN),
            ));
        }
        if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SyncError::malformed(raw, "emitter is not hex"));
        }
        Ok(Self(format!(
            "{:0>width$}",
            trimmed.to_ascii_lowercase(),
            width = EMITTER_HEX_LEN
        )))
    }

    /// Normalize raw address bytes (20-byte EVM, 32-byte Solana/Cosmos, ...).
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        Self::parse(&hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EmitterAddress {
    type Error = SyncError;

    fn try_from(value: String) -> SyncResult<Self> {
        Self::parse(&value)
    }
}

impl From<EmitterAddress> for String {
    fn from(value: EmitterAddress) -> Self {
        value.0
    }
}

impl fmt::Display for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identity of one observed cross-chain message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdentity {
    pub chain_id: u16,
    pub block: u64,
    pub emitter: EmitterAddress,
    pub sequence: u64,
    pub tx_hash: String,
}

impl MessageIdentity {
    /// Block-ordered storage key; also the dedup key.
    pub fn key(&self) -> String {
        keys::encode_message_id(self.chain_id, self.block, &self.emitter, self.sequence)
    }

    /// `(chain, emitter, sequence)` key, independent of the observed block.
    pub fn sequence_key(&self) -> String {
        keys::encode_sequence_key(self.chain_id, &self.emitter, self.sequence)
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.chain_id, self.emitter, self.sequence)
    }
}

/// Whatever a source adapter returns for one observed transaction/log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Block height, or marker for sequence-indexed sources
    pub block: u64,
    #[serde(default)]
    pub timestamp: u64,
    pub tx_hash: String,
    #[serde(default)]
    pub attributes: AttributeBag,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Second leg of a multi-hop message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterpart {
    pub tx_hash: String,
    pub emitter: Option<String>,
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedEvent {
    pub raw: RawEvent,
    pub counterpart: Option<Counterpart>,
}

impl From<RawEvent> for CorrelatedEvent {
    fn from(raw: RawEvent) -> Self {
        Self {
            raw,
            counterpart: None,
        }
    }
}

/// Output of a mapper: the identity plus the payload handed to sinks
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent {
    pub identity: MessageIdentity,
    pub payload: serde_json::Value,
}

/// A missing sequence for one emitter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GapRecord {
    pub chain_id: u16,
    pub emitter: EmitterAddress,
    pub missing_sequence: u64,
    pub bounding_range: BlockRange,
}

impl GapRecord {
    pub fn into_permanent_error(self) -> SyncError {
        SyncError::PermanentGap {
            chain_id: self.chain_id,
            emitter: self.emitter.to_string(),
            sequence: self.missing_sequence,
            from: self.bounding_range.from,
            to: self.bounding_range.to,
        }
    }
}

/// Result of an idempotent sink write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Kind of poll job, resolved when configuration is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Block-ranged logs, one event per message
    Logs,
    /// Block-ranged gateway transfers that need packet correlation
    Transfers,
    /// Sequence-indexed redeems tracked by markers
    Redeems,
}

impl SourceKind {
    pub fn is_sequence_indexed(&self) -> bool {
        matches!(self, SourceKind::Redeems)
    }

    pub fn needs_correlation(&self) -> bool {
        matches!(self, SourceKind::Transfers)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Logs => "logs",
            SourceKind::Transfers => "transfers",
            SourceKind::Redeems => "redeems",
        }
    }
}

/// Filter handed to the mapper
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl FilterConfig {
    /// Empty address list accepts everything.
    pub fn accepts_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Configuration for one poll job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub chain_id: u16,
    #[serde(default = "default_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Explicit start override
    #[serde(default)]
    pub from_block: Option<u64>,
    /// Inclusive upper bound; the source finishes once it is persisted
    #[serde(default)]
    pub to_block: Option<u64>,
    /// Protocol deployment height, used when there is no cursor and no override
    #[serde(default)]
    pub genesis_block: Option<u64>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

fn default_kind() -> SourceKind {
    SourceKind::Logs
}

fn default_commitment() -> String {
    "finalized".to_string()
}

fn default_max_batch_size() -> u64 {
    100
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>, chain_id: u16) -> Self {
        Self {
            source_id: source_id.into(),
            chain_id,
            kind: default_kind(),
            commitment: default_commitment(),
            max_batch_size: default_max_batch_size(),
            tick_interval_ms: default_tick_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            from_block: None,
            to_block: None,
            genesis_block: None,
            backoff: BackoffConfig::default(),
            filter: FilterConfig::default(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.source_id.trim().is_empty() {
            return Err(SyncError::Config("source_id must not be empty".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(SyncError::Config(format!(
                "{}: max_batch_size must be positive",
                self.source_id
            )));
        }
        if let (Some(from), Some(to)) = (self.from_block, self.to_block) {
            if from > to {
                return Err(SyncError::Config(format!(
                    "{}: from_block {} is past to_block {}",
                    self.source_id, from, to
                )));
            }
        }
        if self.backoff.base_delay_ms == 0 || self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(SyncError::Config(format!(
                "{}: backoff base delay must be positive and not exceed the cap",
                self.source_id
            )));
        }
        Ok(())
    }
}
