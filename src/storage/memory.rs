//! In-memory artifact store, used by tests and local tooling

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use super::{validate_key, ArtifactStore, Bucket, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<(Bucket, String), (SystemTime, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(bucket: Bucket, key: &str) -> StoreError {
        StoreError::NotFound {
            bucket,
            key: key.to_string(),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(Bucket, String), (SystemTime, Vec<u8>)>>, StoreError>
    {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn stat(&self, bucket: Bucket, key: &str) -> Result<SystemTime, StoreError> {
        validate_key(key)?;
        self.lock()?
            .get(&(bucket, key.to_string()))
            .map(|(mtime, _)| *mtime)
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn read(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.lock()?
            .get(&(bucket, key.to_string()))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn write(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock()?
            .insert((bucket, key.to_string()), (SystemTime::now(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock()?.remove(&(bucket, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok, block_on};

    #[test]
    fn test_rewrite_moves_mtime_forward() {
        let store = MemoryStore::new();
        block_on(async {
            assert_ok!(store.write(Bucket::Checkers, "1.bin", b"old").await);
            let first = assert_ok!(store.stat(Bucket::Checkers, "1.bin").await);

            assert_ok!(store.write(Bucket::Checkers, "1.bin", b"new").await);
            let second = assert_ok!(store.stat(Bucket::Checkers, "1.bin").await);
            assert!(second >= first);
            assert_eq!(assert_ok!(store.read(Bucket::Checkers, "1.bin").await), b"new");
        });
    }

    #[test]
    fn test_missing_and_invalid_keys() {
        let store = MemoryStore::new();
        block_on(async {
            let err = assert_err!(store.read(Bucket::Subtests, "3").await);
            assert!(err.is_not_found());

            let err = assert_err!(store.write(Bucket::Tests, "../escape", b"x").await);
            assert!(!err.is_not_found());
        });
    }
}
