//! Compiled checker cache
//!
//! Checker binaries live in the `checkers` bucket as `<problemID>.bin` and
//! are shared by every submission to the problem. Each problem has one
//! readers-writer lock: recompilation holds it exclusively, executions share
//! it, so no execution ever stages a half-written binary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::compiler::artifact_location;
use crate::storage::{ArtifactStore, Bucket, StoreError};

#[derive(Debug, Default)]
pub struct CheckerCache {
    locks: DashMap<i64, Arc<RwLock<()>>>,
    compilations: AtomicU64,
}

impl CheckerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding the compiled checker of `problem_id`
    pub fn lock_for(&self, problem_id: i64) -> Arc<RwLock<()>> {
        self.locks.entry(problem_id).or_default().clone()
    }

    /// Store location of the compiled checker of `problem_id`
    pub fn artifact(problem_id: i64) -> (Bucket, String) {
        artifact_location(-problem_id)
    }

    /// Number of checker compilations started by this cache
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub(crate) fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the compiled checker of a problem so the next `prepare` rebuilds it
    pub async fn invalidate(&self, store: &dyn ArtifactStore, problem_id: i64) -> Result<(), StoreError> {
        let lock = self.lock_for(problem_id);
        let _guard = lock.write().await;
        let (bucket, key) = Self::artifact(problem_id);
        store.delete(bucket, &key).await?;
        info!(problem_id, "Invalidated cached checker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_locks_are_per_problem() {
        let cache = CheckerCache::new();
        let a = cache.lock_for(1);
        let b = cache.lock_for(1);
        let c = cache.lock_for(2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_artifact_uses_problem_id() {
        assert_eq!(CheckerCache::artifact(12), (Bucket::Checkers, "12.bin".to_string()));
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let cache = Arc::new(CheckerCache::new());
        let lock = cache.lock_for(1);
        let write = lock.write().await;

        let other = cache.lock_for(1);
        let read = tokio::time::timeout(Duration::from_millis(20), other.read()).await;
        assert!(read.is_err());

        // Another problem is not blocked
        let unrelated = cache.lock_for(2);
        assert!(unrelated.try_read().is_ok());
        drop(write);
        assert!(other.try_read().is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_removes_artifact() {
        let cache = CheckerCache::new();
        let store = MemoryStore::new();
        store.write(Bucket::Checkers, "4.bin", b"bin").await.unwrap();

        cache.invalidate(&store, 4).await.unwrap();
        assert!(store.stat(Bucket::Checkers, "4.bin").await.is_err());
    }
}
