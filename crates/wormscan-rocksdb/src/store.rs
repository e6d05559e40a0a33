//! Shared RocksDB handle and key layout
//!
//! One database holds every source's cursor and every persisted message:
//!
//! ```text
//! cursor/{source_id}                      -> Cursor (JSON)
//! msg/{chain}/{height}/{emitter}/{seq}    -> payload (JSON)
//! seq/{chain}/{emitter}/{seq}             -> message key
//! ```
//!
//! Message keys sort by chain, then height, so a prefix scan over
//! `msg/{chain}/` walks a chain in block order. The `seq/` entries are the
//! secondary index by emitter sequence.

use anyhow::Result;
use log::info;
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Arc;
use wormscan_sync::{keys, SyncError};

pub const CURSOR_PREFIX: &str = "cursor/";
pub const MESSAGE_PREFIX: &str = "msg/";
pub const SEQUENCE_PREFIX: &str = "seq/";

pub(crate) fn cursor_key(source_id: &str) -> Vec<u8> {
    format!("{}{}", CURSOR_PREFIX, source_id).into_bytes()
}

pub(crate) fn message_key(message_id: &str) -> Vec<u8> {
    format!("{}{}", MESSAGE_PREFIX, message_id).into_bytes()
}

pub(crate) fn sequence_index_key(sequence_key: &str) -> Vec<u8> {
    format!("{}{}", SEQUENCE_PREFIX, sequence_key).into_bytes()
}

pub(crate) fn chain_message_prefix(chain_id: u16) -> Vec<u8> {
    format!("{}{}", MESSAGE_PREFIX, keys::chain_prefix(chain_id)).into_bytes()
}

pub(crate) fn store_error(e: rocksdb::Error) -> SyncError {
    SyncError::Store(format!("Database error: {}", e))
}

/// RocksDB-backed [`wormscan_sync::CursorStore`] and [`wormscan_sync::EventSink`]
#[derive(Clone)]
pub struct RocksStore {
    pub(crate) db: Arc<DB>,
}

impl RocksStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn get_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening database at {}", path.display());
        let db = DB::open(&Self::get_options(), path)?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    /// Every key under `prefix`, in key order, with the prefix removed.
    pub(crate) fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut results = Vec::new();
        let mut iter = self.db.raw_iterator();
        iter.seek(prefix);

        while iter.valid() {
            if let Some(key) = iter.key() {
                if !key.starts_with(prefix) {
                    break;
                }
                if let Some(value) = iter.value() {
                    results.push((key[prefix.len()..].to_vec(), value.to_vec()));
                }
            }
            iter.next();
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_prefixes_do_not_overlap() {
        let two = chain_message_prefix(2);
        let twenty = chain_message_prefix(20);
        assert_eq!(two, b"msg/00002/".to_vec());
        assert!(!twenty.starts_with(&two));
        assert_eq!(cursor_key("eth"), b"cursor/eth".to_vec());
    }
}
