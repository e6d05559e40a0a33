use async_trait::async_trait;
use log::debug;
use wormscan_sync::{Cursor, CursorStore, Position, SyncResult};

use crate::store::{cursor_key, store_error, RocksStore, CURSOR_PREFIX};

impl RocksStore {
    /// All persisted cursors, ordered by source id
    pub fn cursors(&self) -> SyncResult<Vec<Cursor>> {
        self.scan_prefix(CURSOR_PREFIX.as_bytes())
            .into_iter()
            .map(|(_, value)| serde_json::from_slice::<Cursor>(&value).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl CursorStore for RocksStore {
    async fn get(&self, source_id: &str) -> SyncResult<Option<Cursor>> {
        match self.db.get(cursor_key(source_id)).map_err(store_error)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, source_id: &str, position: Position) -> SyncResult<()> {
        let cursor = Cursor::new(source_id, position);
        let value = serde_json::to_vec(&cursor)?;
        self.db
            .put(cursor_key(source_id), value)
            .map_err(store_error)?;
        debug!("saved cursor {} -> {}", source_id, position);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> SyncResult<()> {
        self.db.delete(cursor_key(source_id)).map_err(store_error)
    }
}
