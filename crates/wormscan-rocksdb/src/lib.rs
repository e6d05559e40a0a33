//! RocksDB persistence for wormscan cursors and messages

pub mod cursor_store;
pub mod event_sink;
pub mod store;

pub use store::{RocksStore, CURSOR_PREFIX, MESSAGE_PREFIX, SEQUENCE_PREFIX};
