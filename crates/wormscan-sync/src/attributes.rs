//! Typed event attributes.
//!
//! Chain events carry loosely typed key/value attributes; Cosmos-family nodes
//! additionally base64-encode both sides. An [`AttributeBag`] is built once per
//! event, decoding everything up front, so downstream stages only deal with
//! plain strings and typed getters.

use base64::engine::{general_purpose::STANDARD as BASE64_ENGINE, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{SyncError, SyncResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag(BTreeMap<String, String>);

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Decode base64 key/value pairs as emitted by older Tendermint nodes.
    ///
    /// Later duplicates of a key overwrite earlier ones.
    pub fn from_base64_pairs<'a, I>(pairs: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            map.insert(decode_base64_text(key)?, decode_base64_text(value)?);
        }
        Ok(Self(map))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str) -> SyncResult<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| {
                SyncError::Serialization(format!("attribute {} = {:?} is not a u64: {}", key, raw, e))
            }),
        }
    }

    pub fn require(&self, key: &str) -> SyncResult<&str> {
        self.get(key)
            .ok_or_else(|| SyncError::Serialization(format!("missing attribute {}", key)))
    }

    pub fn require_u64(&self, key: &str) -> SyncResult<u64> {
        self.get_u64(key)?
            .ok_or_else(|| SyncError::Serialization(format!("missing attribute {}", key)))
    }

    /// True when every key is present with a non-empty value.
    pub fn has_all(&self, keys: &[&str]) -> bool {
        keys.iter()
            .all(|k| self.get(k).map(|v| !v.is_empty()).unwrap_or(false))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn decode_base64_text(encoded: &str) -> SyncResult<String> {
    let bytes = BASE64_ENGINE
        .decode(encoded)
        .map_err(|e| SyncError::Serialization(format!("invalid base64 attribute {:?}: {}", encoded, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| SyncError::Serialization(format!("attribute is not utf-8: {}", e)))
}
