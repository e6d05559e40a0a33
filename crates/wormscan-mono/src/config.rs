//! JSON configuration for the `wormscan` binary
//!
//! ```json
//! {
//!   "sources": [
//!     {
//!       "source_id": "ethereum-logs",
//!       "chain_id": 2,
//!       "from_block": 18000000,
//!       "max_batch_size": 500,
//!       "replay_file": "/data/ethereum.jsonl",
//!       "confirmations": 64
//!     }
//!   ]
//! }
//! ```
//!
//! Each entry is a [`SourceConfig`] plus the replay-specific fields below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use wormscan_sync::{SourceConfig, SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySourceConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Newline-delimited JSON raw events
    pub replay_file: PathBuf,
    /// Counterparty events for transfer correlation
    #[serde(default)]
    pub counterpart_file: Option<PathBuf>,
    /// Depth subtracted from the newest replayed block
    #[serde(default)]
    pub confirmations: u64,
    /// Largest range fetched per read
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub emitter_attribute: Option<String>,
    #[serde(default)]
    pub sequence_attribute: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub sources: Vec<ReplaySourceConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.sources {
            entry.source.validate()?;
            if !seen.insert(entry.source.source_id.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate source_id {}",
                    entry.source.source_id
                )));
            }
            if entry.page_size == Some(0) {
                return Err(SyncError::Config(format!(
                    "{}: page_size must be positive",
                    entry.source.source_id
                )));
            }
        }
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<&ReplaySourceConfig> {
        self.sources.iter().find(|s| s.source.source_id == source_id)
    }

    pub fn sources_for_chain(&self, chain_id: u16) -> impl Iterator<Item = &ReplaySourceConfig> {
        self.sources
            .iter()
            .filter(move |s| s.source.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wormscan_sync::SourceKind;

    #[test]
    fn test_defaults_and_kind() {
        let config = AppConfig::from_json(
            r#"{"sources": [
                {"source_id": "eth", "chain_id": 2, "replay_file": "eth.jsonl"},
                {"source_id": "sei", "chain_id": 32, "kind": "redeems", "genesis_block": 7,
                 "replay_file": "sei.jsonl", "page_size": 50}
            ]}"#,
        )
        .unwrap();

        let eth = config.source("eth").unwrap();
        assert_eq!(eth.source.kind, SourceKind::Logs);
        assert_eq!(eth.source.max_batch_size, 100);
        assert_eq!(eth.confirmations, 0);
        let sei = config.source("sei").unwrap();
        assert_eq!(sei.source.kind, SourceKind::Redeems);
        assert_eq!(sei.page_size, Some(50));
        assert_eq!(config.sources_for_chain(32).count(), 1);
    }

    #[test]
    fn test_rejects_invalid_sources() {
        let duplicate = r#"{"sources": [
            {"source_id": "eth", "chain_id": 2, "replay_file": "a"},
            {"source_id": "eth", "chain_id": 2, "replay_file": "b"}
        ]}"#;
        assert!(matches!(AppConfig::from_json(duplicate), Err(SyncError::Config(_))));

        let zero_batch = r#"{"sources": [
            {"source_id": "eth", "chain_id": 2, "max_batch_size": 0, "replay_file": "a"}
        ]}"#;
        assert!(AppConfig::from_json(zero_batch).is_err());

        let inverted = r#"{"sources": [
            {"source_id": "eth", "chain_id": 2, "from_block": 9, "to_block": 3, "replay_file": "a"}
        ]}"#;
        assert!(AppConfig::from_json(inverted).is_err());

        let unknown_kind = r#"{"sources": [
            {"source_id": "eth", "chain_id": 2, "kind": "mystery", "replay_file": "a"}
        ]}"#;
        assert!(matches!(
            AppConfig::from_json(unknown_kind),
            Err(SyncError::Serialization(_))
        ));
    }
}
