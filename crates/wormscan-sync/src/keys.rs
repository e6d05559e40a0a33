//! # Canonical Key Encoding
//!
//! The stores behind [`crate::EventSink`] and [`crate::CursorStore`] are sorted-key
//! stores, so the key doubles as the index. Every numeric field is zero-padded to
//! a fixed width so that plain byte-wise string comparison matches numeric order:
//!
//! | key | layout |
//! |-----|--------|
//! | block | `{height:020}-{timestamp}` |
//! | block (newest first) | `{u64::MAX - height:020}-{timestamp}` |
//! | message id | `{chain:05}/{height:020}/{emitter:64 hex}/{sequence:020}` |
//! | sequence | `{chain:05}/{emitter:64 hex}/{sequence:020}` |
//!
//! Twenty digits cover the whole `u64` space, so no height or sequence can
//! overflow its slot and break ordering. Encoding is pure: identical inputs
//! always produce identical keys, which is what makes re-sinking an
//! overlapping range a no-op.

use crate::{EmitterAddress, SyncError, SyncResult, EMITTER_HEX_LEN};

pub const CHAIN_WIDTH: usize = 5;
pub const HEIGHT_WIDTH: usize = 20;
pub const SEQUENCE_WIDTH: usize = 20;
const SEPARATOR: char = '/';

/// Fields recovered from a message id key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessageId {
    pub chain_id: u16,
    pub height: u64,
    pub emitter: EmitterAddress,
    pub sequence: u64,
}

/// Fields recovered from a sequence key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSequenceKey {
    pub chain_id: u16,
    pub emitter: EmitterAddress,
    pub sequence: u64,
}

pub fn encode_block_key(height: u64, timestamp: u64) -> String {
    format!("{:0width$}-{}", height, timestamp, width = HEIGHT_WIDTH)
}

/// Inverse-offset variant: string order is descending height order.
pub fn encode_block_key_desc(height: u64, timestamp: u64) -> String {
    encode_block_key(u64::MAX - height, timestamp)
}

pub fn encode_message_id(chain_id: u16, height: u64, emitter: &EmitterAddress, sequence: u64) -> String {
    format!(
        "{:0cw$}{sep}{:0hw$}{sep}{}{sep}{:0sw$}",
        chain_id,
        height,
        emitter.as_str(),
        sequence,
        cw = CHAIN_WIDTH,
        hw = HEIGHT_WIDTH,
        sw = SEQUENCE_WIDTH,
        sep = SEPARATOR
    )
}

pub fn decode_message_id(key: &str) -> SyncResult<DecodedMessageId> {
    let parts: Vec<&str> = key.split(SEPARATOR).collect();
    if parts.len() != 4 {
        return Err(SyncError::malformed(
            key,
            format!("expected 4 fields, found {}", parts.len()),
        ));
    }
    Ok(DecodedMessageId {
        chain_id: decode_chain(key, parts[0])?,
        height: decode_padded(key, parts[1], HEIGHT_WIDTH, "height")?,
        emitter: decode_emitter(key, parts[2])?,
        sequence: decode_padded(key, parts[3], SEQUENCE_WIDTH, "sequence")?,
    })
}

pub fn encode_sequence_key(chain_id: u16, emitter: &EmitterAddress, sequence: u64) -> String {
    format!(
        "{:0cw$}{sep}{}{sep}{:0sw$}",
        chain_id,
        emitter.as_str(),
        sequence,
        cw = CHAIN_WIDTH,
        sw = SEQUENCE_WIDTH,
        sep = SEPARATOR
    )
}

pub fn decode_sequence_key(key: &str) -> SyncResult<DecodedSequenceKey> {
    let parts: Vec<&str> = key.split(SEPARATOR).collect();
    if parts.len() != 3 {
        return Err(SyncError::malformed(
            key,
            format!("expected 3 fields, found {}", parts.len()),
        ));
    }
    Ok(DecodedSequenceKey {
        chain_id: decode_chain(key, parts[0])?,
        emitter: decode_emitter(key, parts[1])?,
        sequence: decode_padded(key, parts[2], SEQUENCE_WIDTH, "sequence")?,
    })
}

/// Prefix shared by every message id of one chain.
pub fn chain_prefix(chain_id: u16) -> String {
    format!("{:0cw$}{}", chain_id, SEPARATOR, cw = CHAIN_WIDTH)
}

fn decode_chain(key: &str, field: &str) -> SyncResult<u16> {
    let value = decode_padded(key, field, CHAIN_WIDTH, "chain")?;
    u16::try_from(value).map_err(|_| SyncError::malformed(key, format!("chain id {} out of range", value)))
}

fn decode_padded(key: &str, field: &str, width: usize, name: &str) -> SyncResult<u64> {
    if field.len() != width {
        return Err(SyncError::malformed(
            key,
            format!("{} must be {} digits, found {}", name, width, field.len()),
        ));
    }
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SyncError::malformed(key, format!("{} is not numeric", name)));
    }
    field
        .parse::<u64>()
        .map_err(|e| SyncError::malformed(key, format!("{}: {}", name, e)))
}

fn decode_emitter(key: &str, field: &str) -> SyncResult<EmitterAddress> {
    if field.len() != EMITTER_HEX_LEN {
        return Err(SyncError::malformed(
            key,
            format!("emitter must be {} hex characters", EMITTER_HEX_LEN),
        ));
    }
    // Stored emitters are already normalized; uppercase would sort differently.
    if field.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(SyncError::malformed(key, "emitter is not lowercase"));
    }
    EmitterAddress::parse(field).map_err(|_| SyncError::malformed(key, "emitter is not hex"))
}
