//! Artifact store
//!
//! Byte blobs addressed by bucket and logical key: test data, contestant
//! outputs, compiled checkers and compiled submissions. The grading engine
//! only needs stat/read/write/delete; backends decide how blobs are laid out.

pub mod fs;
pub mod memory;
pub mod s3;

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// `<testID>.in` / `<testID>.out`
    Tests,
    /// `<subtestID>`: contestant output for one subtest
    Subtests,
    /// `<problemID>.bin`
    Checkers,
    /// `<submissionID>.bin`
    Compilations,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Tests => "tests",
            Bucket::Subtests => "subtests",
            Bucket::Checkers => "checkers",
            Bucket::Compilations => "compilations",
        }
    }

    pub fn all() -> [Bucket; 4] {
        [
            Bucket::Tests,
            Bucket::Subtests,
            Bucket::Checkers,
            Bucket::Compilations,
        ]
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{bucket}/{key} does not exist")]
    NotFound { bucket: Bucket, key: String },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Last modification time of a blob
    async fn stat(&self, bucket: Bucket, key: &str) -> Result<SystemTime, StoreError>;

    async fn read(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Replace a blob. Readers never observe a partially written blob.
    async fn write(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Remove a blob; removing a missing blob is not an error
    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError>;
}

/// Keys are flat names; anything that could escape a bucket is rejected
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub fn test_input_key(test_id: i64) -> String {
    format!("{}.in", test_id)
}

pub fn test_output_key(test_id: i64) -> String {
    format!("{}.out", test_id)
}

pub fn subtest_key(subtest_id: i64) -> String {
    subtest_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("12.in").is_ok());
        assert!(validate_key("-4.bin").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("..").is_err());
    }

    #[test]
    fn test_keys() {
        assert_eq!(test_input_key(3), "3.in");
        assert_eq!(test_output_key(3), "3.out");
        assert_eq!(subtest_key(42), "42");
    }
}
