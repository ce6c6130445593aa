//! Content-addressed buffer of failed write batches
//!
//! Each batch is stored under a hash of its lines, so storing the same
//! content twice leaves a single entry.

use std::sync::Arc;

use brivas_influx_sdk::WriteBatch;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::{KvStore, StoreError, StoreResult};

/// Bytes of the SHA-256 digest kept in a key (128 bits)
const KEY_BYTES: usize = 16;

/// Deterministic, order-sensitive key for a batch
pub fn content_hash(batch: &WriteBatch) -> String {
    let mut hasher = Sha256::new();
    for line in batch.lines() {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();

    hex::encode(&digest[..KEY_BYTES])
}

/// Failed-batch buffer over a [`KvStore`]
#[derive(Clone)]
pub struct FailureBuffer {
    store: Arc<dyn KvStore>,
}

impl FailureBuffer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Persist a batch under its content hash and return the key
    pub async fn store(&self, batch: &WriteBatch) -> StoreResult<String> {
        let key = content_hash(batch);
        let value = serde_json::to_value(batch)?;
        self.store.set(&key, Some(value)).await?;
        debug!(key = %key, lines = batch.len(), "Buffered failed batch");
        Ok(key)
    }

    /// Keys of every buffered batch
    pub async fn list_keys(&self) -> StoreResult<Vec<String>> {
        self.store.list_keys().await
    }

    /// Read a batch and remove it from the buffer
    ///
    /// An entry that cannot be decoded is removed as well and reported as
    /// [`StoreError::Corrupt`]; leaving it would fail every later drain.
    pub async fn take(&self, key: &str) -> StoreResult<Option<WriteBatch>> {
        let value = match self.store.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(StoreError::Corrupt { key, source }) => {
                self.clear(&key).await?;
                return Err(StoreError::Corrupt { key, source });
            }
            Err(e) => return Err(e),
        };

        self.clear(key).await?;

        serde_json::from_value::<WriteBatch>(value)
            .map(Some)
            .map_err(|source| {
                warn!(key = %key, "Dropped undecodable buffer entry");
                StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }
            })
    }

    /// Remove a batch without reading it
    pub async fn clear(&self, key: &str) -> StoreResult<()> {
        self.store.set(key, None).await
    }

    /// Number of buffered batches
    pub async fn len(&self) -> StoreResult<usize> {
        Ok(self.store.list_keys().await?.len())
    }
}
