//! Generic attribute-driven [`Mapper`]

use serde_json::json;

use crate::{
    CorrelatedEvent, EmitterAddress, FilterConfig, Mapper, MessageIdentity, SyncError, SyncResult,
    TypedEvent,
};

/// Builds a [`MessageIdentity`] from two event attributes.
///
/// Events missing either attribute are not messages and map to `None`. A present
/// but unparseable emitter is a [`SyncError::MalformedKey`], which the engine
/// treats as fatal to that item only.
#[derive(Debug, Clone)]
pub struct AttributeMapper {
    chain_id: u16,
    emitter_key: String,
    sequence_key: String,
}

impl AttributeMapper {
    pub fn new(chain_id: u16) -> Self {
        Self {
            chain_id,
            emitter_key: "emitter".to_string(),
            sequence_key: "sequence".to_string(),
        }
    }

    pub fn with_keys(mut self, emitter_key: impl Into<String>, sequence_key: impl Into<String>) -> Self {
        self.emitter_key = emitter_key.into();
        self.sequence_key = sequence_key.into();
        self
    }
}

impl Mapper for AttributeMapper {
    fn map(&self, event: &CorrelatedEvent, filter: &FilterConfig) -> SyncResult<Option<TypedEvent>> {
        let attributes = &event.raw.attributes;
        let (Some(raw_emitter), Some(raw_sequence)) =
            (attributes.get(&self.emitter_key), attributes.get(&self.sequence_key))
        else {
            return Ok(None);
        };
        if !filter.accepts_address(raw_emitter) {
            return Ok(None);
        }
        let emitter = EmitterAddress::parse(raw_emitter)?;
        let sequence = raw_sequence
            .trim()
            .parse::<u64>()
            .map_err(|e| SyncError::malformed(raw_sequence, format!("sequence: {}", e)))?;

        let identity = MessageIdentity {
            chain_id: self.chain_id,
            block: event.raw.block,
            emitter,
            sequence,
            tx_hash: event.raw.tx_hash.clone(),
        };
        let payload = json!({
            "tx_hash": event.raw.tx_hash,
            "block": event.raw.block,
            "timestamp": event.raw.timestamp,
            "attributes": event.raw.attributes,
            "data": event.raw.payload,
            "counterpart": event.counterpart,
        });
        Ok(Some(TypedEvent { identity, payload }))
    }
}
