//! In-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{validate_key, KeyValueStore};
use crate::error::CommonResult;

/// Process-local [`KeyValueStore`].
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Synchronous read, for assertions in tests and diagnostics.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> CommonResult<Option<String>> {
        validate_key(key)?;
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: String) -> CommonResult<()> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CommonResult<()> {
        validate_key(key)?;
        self.entries.remove(key);
        Ok(())
    }
}
