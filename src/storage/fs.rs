//! Local filesystem artifact store
//!
//! Layout: `<root>/<bucket>/<key>`. Writes go to a temporary file in the same
//! bucket directory and are renamed into place.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use super::{validate_key, ArtifactStore, Bucket, StoreError};

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the bucket directories
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for bucket in Bucket::all() {
            fs::create_dir_all(root.join(bucket.as_str())).await?;
        }
        info!("Opened filesystem artifact store at {:?}", root);
        Ok(Self { root })
    }

    fn path(&self, bucket: Bucket, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(bucket.as_str()).join(key))
    }
}

fn map_not_found(err: std::io::Error, bucket: Bucket, key: &str) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound {
            bucket,
            key: key.to_string(),
        }
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn stat(&self, bucket: Bucket, key: &str) -> Result<SystemTime, StoreError> {
        let path = self.path(bucket, key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(e, bucket, key))?;
        Ok(metadata.modified()?)
    }

    async fn read(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(bucket, key)?;
        fs::read(&path).await.map_err(|e| map_not_found(e, bucket, key))
    }

    async fn write(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path(bucket, key)?;
        let dir = self.root.join(bucket.as_str());

        // Rename is atomic within one directory
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        fs::write(tmp.path(), data).await?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        debug!("Wrote {} bytes to {}/{}", data.len(), bucket, key);
        Ok(())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError> {
        let path = self.path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
