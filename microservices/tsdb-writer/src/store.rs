//! Key-value storage backends for the failed-write buffer
//!
//! Values are JSON documents. Setting a key to `None` deletes it.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

const ENTRY_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistent key-value storage
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All keys currently present; order is unspecified
    async fn list_keys(&self) -> StoreResult<Vec<String>>;

    /// Value stored under `key`, if any
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Store `value` under `key`, or delete the key when `value` is `None`
    async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()>;
}

/// Process-local store, lost on restart
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()> {
        match value {
            Some(value) => {
                self.entries.insert(key.to_string(), value);
            }
            None => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}

/// Directory-backed store, one `{key}.json` file per entry
///
/// Entries are written to a temporary file and renamed into place, so a
/// crash mid-write never leaves a truncated entry behind.
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `directory`, creating it if needed
    pub async fn open(directory: impl Into<PathBuf>) -> StoreResult<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        debug!(directory = %directory.display(), "File store opened");
        Ok(Self { directory })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}", sanitize_key(key), ENTRY_SUFFIX))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if let Some(key) = name.strip_suffix(ENTRY_SUFFIX) {
                keys.push(key.to_string());
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let bytes = match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, value: Option<Value>) -> StoreResult<()> {
        let path = self.entry_path(key);

        match value {
            Some(value) => {
                let json = serde_json::to_vec(&value)?;
                let tmp = self
                    .directory
                    .join(format!("{}{}", sanitize_key(key), TEMP_SUFFIX));
                tokio::fs::write(&tmp, json).await?;
                tokio::fs::rename(&tmp, &path).await?;
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }

        Ok(())
    }
}

/// Replace characters that are unsafe in file names
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise(store: &dyn KvStore) {
        assert!(store.list_keys().await.unwrap().is_empty());
        assert!(store.get("missing").await.unwrap().is_none());

        store.set("a", Some(json!(["x 1"]))).await.unwrap();
        store.set("b", Some(json!(["y 2"]))).await.unwrap();
        store.set("a", Some(json!(["x 3"]))).await.unwrap();

        let mut keys = store.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.get("a").await.unwrap(), Some(json!(["x 3"])));

        store.set("a", None).await.unwrap();
        store.set("a", None).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.list_keys().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("buffer")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set("abc", Some(json!(["m v=1"]))).await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.list_keys().await.unwrap(), vec!["abc".to_string()]);
        assert_eq!(reopened.get("abc").await.unwrap(), Some(json!(["m v=1"])));
    }

    #[tokio::test]
    async fn test_file_store_ignores_temp_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("half.json.tmp"), b"[").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "bad"));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("a/b:c"), "a_b_c");
        assert_eq!(sanitize_key("0123abcd"), "0123abcd");
    }
}
