//! Key-value persistence
//!
//! Components that persist state consume the [`KeyValueStore`] trait and
//! never a concrete backend. Two adapters ship with this crate:
//!
//! - [`MemoryStore`]: process-local, backed by a concurrent map
//! - [`JsonFileStore`]: one file per key under a directory, written
//!   atomically through a temp file and rename

pub mod file;
pub mod memory;

use async_trait::async_trait;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::{CommonError, CommonResult};

/// Asynchronous string key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> CommonResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> CommonResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> CommonResult<()>;
}

pub(crate) fn validate_key(key: &str) -> CommonResult<()> {
    if key.trim().is_empty() {
        return Err(CommonError::validation("key", "storage key must not be empty"));
    }
    Ok(())
}
