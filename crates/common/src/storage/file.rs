//! File-backed store writing one JSON document per key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{validate_key, KeyValueStore};
use crate::error::{CommonError, CommonResult};

/// [`KeyValueStore`] keeping each key in `<dir>/<key>.json`.
///
/// Characters outside `[A-Za-z0-9._-]` in keys are replaced with `_` when
/// building file names. Writes go to a temp file that is then renamed over
/// the target, so readers never see a partial document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`; the directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path used for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> CommonResult<Option<String>> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored value");
                Ok(None)
            }
            Err(err) => Err(CommonError::persistence_op("read", err.to_string())),
        }
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set(&self, key: &str, value: String) -> CommonResult<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CommonError::persistence_op("create_dir", e.to_string()))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| CommonError::persistence_op("write", e.to_string()))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| CommonError::persistence_op("write", e.to_string()))?;
        file.sync_all().await.map_err(|e| CommonError::persistence_op("write", e.to_string()))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| CommonError::persistence_op("rename", e.to_string()))?;

        debug!(path = %path.display(), "stored value");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> CommonResult<()> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CommonError::persistence_op("delete", err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_sanitises_key() {
        let store = JsonFileStore::new("/tmp/flightdeck");
        assert_eq!(
            store.path_for("scheduler/pending tasks"),
            PathBuf::from("/tmp/flightdeck/scheduler_pending_tasks.json")
        );
        assert_eq!(store.path_for("a-b.c_d"), PathBuf::from("/tmp/flightdeck/a-b.c_d.json"));
    }

    /// Validates a full write, overwrite, read and delete cycle on disk.
    ///
    /// Assertions:
    /// - The temp file does not survive a successful write.
    /// - Deleting a missing key succeeds.
    #[tokio::test]
    async fn test_file_round_trip() -> CommonResult<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::new(dir.path().join("nested"));

        assert_eq!(store.get("pending").await?, None);
        store.set("pending", "[1]".to_string()).await?;
        store.set("pending", "[1,2]".to_string()).await?;
        assert_eq!(store.get("pending").await?.as_deref(), Some("[1,2]"));
        assert!(!store.path_for("pending").with_extension("json.tmp").exists());

        store.delete("pending").await?;
        store.delete("pending").await?;
        assert_eq!(store.get("pending").await?, None);
        Ok(())
    }
}
