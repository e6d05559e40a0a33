use async_trait::async_trait;
use log::info;
use wormscan_sync::{MessageIdentity, Publisher, SyncResult};

/// Announces sunk messages on the `wormscan::publish` log target
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, identity: &MessageIdentity, payload: &serde_json::Value) -> SyncResult<()> {
        info!(
            target: "wormscan::publish",
            "{} tx={} payload={}",
            identity.key(),
            identity.tx_hash,
            payload
        );
        Ok(())
    }
}
