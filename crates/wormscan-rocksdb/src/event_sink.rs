use async_trait::async_trait;
use log::{debug, warn};
use rocksdb::WriteBatch;
use wormscan_sync::{keys, EventSink, MessageIdentity, SyncResult, UpsertOutcome};

use crate::store::{chain_message_prefix, message_key, sequence_index_key, store_error, RocksStore};

impl RocksStore {
    /// Stored payload for a message id, if any
    pub fn message(&self, message_id: &str) -> SyncResult<Option<serde_json::Value>> {
        match self.db.get(message_key(message_id)).map_err(store_error)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Message id stored for an emitter sequence, through the `seq/` index
    pub fn message_id_for_sequence(&self, sequence_key: &str) -> SyncResult<Option<String>> {
        Ok(self
            .db
            .get(sequence_index_key(sequence_key))
            .map_err(store_error)?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }
}

#[async_trait]
impl EventSink for RocksStore {
    async fn upsert(
        &self,
        identity: &MessageIdentity,
        payload: &serde_json::Value,
    ) -> SyncResult<UpsertOutcome> {
        let message_id = identity.key();
        let key = message_key(&message_id);
        let index_key = sequence_index_key(&identity.sequence_key());
        let value = serde_json::to_vec(payload)?;
        let mut batch = WriteBatch::default();

        // (chain, emitter, sequence) is unique: the lowest height it was seen at wins
        let outcome = match self.db.get(&index_key).map_err(store_error)? {
            Some(indexed) if indexed != message_id.as_bytes() => {
                let indexed = String::from_utf8_lossy(&indexed).into_owned();
                match keys::decode_message_id(&indexed) {
                    Ok(existing) if existing.height <= identity.block => {
                        debug!("{} already stored as {}, keeping it", message_id, indexed);
                        return Ok(UpsertOutcome::Unchanged);
                    }
                    _ => {
                        debug!("{} replaces {}", message_id, indexed);
                        batch.delete(message_key(&indexed));
                        UpsertOutcome::Updated
                    }
                }
            }
            _ => match self.db.get(&key).map_err(store_error)? {
                None => UpsertOutcome::Inserted,
                Some(existing) if existing == value => return Ok(UpsertOutcome::Unchanged),
                Some(_) => UpsertOutcome::Updated,
            },
        };

        // Message and its sequence index land together
        batch.put(&key, &value);
        batch.put(index_key, message_id.as_bytes());
        self.db.write(batch).map_err(store_error)?;
        Ok(outcome)
    }

    async fn message_keys(&self, chain_id: u16) -> SyncResult<Vec<String>> {
        let prefix = chain_message_prefix(chain_id);
        let chain = keys::chain_prefix(chain_id);
        Ok(self
            .scan_prefix(&prefix)
            .into_iter()
            .map(|(suffix, _)| match String::from_utf8(suffix) {
                Ok(suffix) => format!("{}{}", chain, suffix),
                Err(e) => {
                    warn!("non-utf8 message key under chain {}", chain_id);
                    format!("{}{}", chain, String::from_utf8_lossy(e.as_bytes()))
                }
            })
            .collect())
    }
}
