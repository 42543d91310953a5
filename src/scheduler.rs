//! Box scheduler - bounded pool of sandbox slots
//!
//! Every untrusted command goes through here. The pool size is the upper
//! bound on concurrent executions; callers wait (FIFO, via the semaphore)
//! until a slot is free. Slots are numbered from the worker's box id base so
//! several workers on one host never share an isolate box.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::sandbox::{RunConfig, RunStats, Sandbox, SandboxBackend, SandboxError};
use crate::storage::{ArtifactStore, Bucket};

/// A file that lives in the artifact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketFile {
    pub bucket: Bucket,
    pub key: String,
    pub mode: u32,
}

impl BucketFile {
    pub fn new(bucket: Bucket, key: impl Into<String>, mode: u32) -> Self {
        Self {
            bucket,
            key: key.into(),
            mode,
        }
    }
}

/// Raw bytes staged into the box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

impl ByteFile {
    pub fn new(data: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            data: data.into(),
            mode,
        }
    }
}

/// One command together with everything it reads and produces.
/// Map keys are in-box paths (`/box/...`).
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub input_bucket_files: HashMap<String, BucketFile>,
    pub input_byte_files: HashMap<String, ByteFile>,
    pub command: Vec<String>,
    pub run_config: RunConfig,
    /// Files returned in `ExecResponse::files`
    pub output_byte_files: Vec<String>,
    /// Files copied to the store after the run (the mode is ignored)
    pub output_bucket_files: HashMap<String, BucketFile>,
}

#[derive(Debug, Clone)]
pub struct ExecResponse {
    pub stats: RunStats,
    /// Requested output files that exist after the run
    pub files: HashMap<String, Vec<u8>>,
    /// In-box paths of output files that were written to the store
    pub stored: Vec<String>,
}

impl ExecResponse {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

/// Returns its box id to the free list when dropped
struct Slot {
    box_id: u32,
    free_boxes: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free_boxes.lock() {
            free.push(self.box_id);
        }
    }
}

/// Exclusive use of one sandbox until released or dropped
pub struct SandboxLease {
    sandbox: Option<Box<dyn Sandbox>>,
    slot: Slot,
}

impl SandboxLease {
    pub fn box_id(&self) -> u32 {
        self.slot.box_id
    }

    pub fn sandbox(&self) -> Result<&dyn Sandbox, SandboxError> {
        self.sandbox.as_deref().ok_or(SandboxError::PoolClosed)
    }

    /// Tear the sandbox down and give the slot back
    pub async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            if let Err(e) = sandbox.close().await {
                warn!(box_id = self.slot.box_id, "Failed to clean up sandbox: {}", e);
            }
        }
    }
}

pub struct BoxScheduler {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn ArtifactStore>,
    permits: Arc<Semaphore>,
    free_boxes: Arc<Mutex<Vec<u32>>>,
    size: usize,
}

impl BoxScheduler {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn ArtifactStore>,
        base_box_id: u32,
        size: usize,
    ) -> Self {
        let size = size.max(1);
        // Popped from the back, so the lowest ids are handed out first
        let free_boxes = (0..size as u32).rev().map(|i| base_box_id + i).collect();
        debug!(
            "Box scheduler using {} {} boxes starting at {}",
            size,
            backend.name(),
            base_box_id
        );

        Self {
            backend,
            store,
            permits: Arc::new(Semaphore::new(size)),
            free_boxes: Arc::new(Mutex::new(free_boxes)),
            size,
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Wait for a free slot and open a fresh sandbox in it
    pub async fn acquire(&self) -> Result<SandboxLease, SandboxError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;

        let box_id = self
            .free_boxes
            .lock()
            .map_err(|_| SandboxError::PoolClosed)?
            .pop()
            .ok_or(SandboxError::PoolClosed)?;

        let slot = Slot {
            box_id,
            free_boxes: self.free_boxes.clone(),
            _permit: permit,
        };
        let sandbox = self.backend.open(box_id).await?;

        Ok(SandboxLease {
            sandbox: Some(sandbox),
            slot,
        })
    }

    /// Run one request in its own sandbox
    pub async fn run(&self, request: &ExecRequest) -> Result<ExecResponse, SandboxError> {
        let lease = self.acquire().await?;
        let result = self.run_in(lease.sandbox()?, request).await;
        lease.release().await;
        result
    }

    async fn run_in(&self, sandbox: &dyn Sandbox, request: &ExecRequest) -> Result<ExecResponse, SandboxError> {
        for (path, file) in &request.input_bucket_files {
            let data = self.store.read(file.bucket, &file.key).await?;
            sandbox.write_file(path, &data, file.mode).await?;
        }
        for (path, file) in &request.input_byte_files {
            sandbox.write_file(path, &file.data, file.mode).await?;
        }

        let stats = sandbox.run_command(&request.command, &request.run_config).await?;

        let mut files = HashMap::new();
        for path in &request.output_byte_files {
            match sandbox.read_file(path).await {
                Ok(data) => {
                    files.insert(path.clone(), data);
                }
                Err(SandboxError::FileNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut stored = Vec::new();
        for (path, file) in &request.output_bucket_files {
            match sandbox.read_file(path).await {
                Ok(data) => {
                    self.store.write(file.bucket, &file.key, &data).await?;
                    stored.push(path.clone());
                }
                Err(SandboxError::FileNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(ExecResponse { stats, files, stored })
    }

    /// Stop admitting work. Waiting and future requests fail with `PoolClosed`.
    pub fn close(&self) {
        self.permits.close();
    }
}
