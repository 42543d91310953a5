//! Sandbox configuration
//!
//! Fixed limits for trusted helper work (compilation, checkers) and the
//! worker id used to keep box ids of several workers on one host apart.

use std::sync::OnceLock;
use tracing::warn;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u32,
    /// Compile memory limit in MB (default: 2048MB)
    pub compile_memory_limit_mb: u32,
    /// Checker wall time limit in milliseconds (default: 20000ms = 20s)
    pub checker_time_limit_ms: u32,
    /// Checker memory limit in MB (default: 512MB)
    pub checker_memory_limit_mb: u32,
    /// Worker ID for box ID allocation (0-9)
    pub worker_id: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            checker_time_limit_ms: 20_000,
            checker_memory_limit_mb: 512,
            worker_id: 0,
        }
    }
}

impl SandboxConfig {
    /// Create config with a specific worker_id
    pub fn with_worker_id(worker_id: u32) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }

    pub fn compile_time_limit_secs(&self) -> f64 {
        self.compile_time_limit_ms as f64 / 1000.0
    }

    pub fn compile_memory_limit_kb(&self) -> u64 {
        self.compile_memory_limit_mb as u64 * 1024
    }

    pub fn checker_time_limit_secs(&self) -> f64 {
        self.checker_time_limit_ms as f64 / 1000.0
    }

    pub fn checker_memory_limit_kb(&self) -> u64 {
        self.checker_memory_limit_mb as u64 * 1024
    }
}

/// Global sandbox configuration
static SANDBOX_CONFIG: OnceLock<SandboxConfig> = OnceLock::new();

/// Initialize sandbox configuration with dynamically assigned worker_id
pub fn init_config(worker_id: u32) -> anyhow::Result<()> {
    let sandbox_config = SandboxConfig::with_worker_id(worker_id);

    SANDBOX_CONFIG
        .set(sandbox_config)
        .map_err(|_| anyhow::anyhow!("Sandbox configuration already initialized"))?;

    Ok(())
}

/// Get sandbox configuration
pub fn get_config() -> &'static SandboxConfig {
    SANDBOX_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<SandboxConfig> = OnceLock::new();

        DEFAULT.get_or_init(|| {
            warn!("Sandbox configuration not initialized, using default");
            SandboxConfig::default()
        })
    })
}

/// Box ids owned by one worker
pub const BOXES_PER_WORKER: usize = 1000;

/// First box id of a worker's range.
/// Isolate only supports box IDs 0-9999, so each worker (0-9) gets a range of 1000 box IDs.
pub fn box_id_base(worker_id: u32) -> u32 {
    (worker_id % 10) * BOXES_PER_WORKER as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_id_base() {
        assert_eq!(box_id_base(0), 0);
        assert_eq!(box_id_base(3), 3000);
        assert_eq!(box_id_base(13), 3000);
    }

    #[test]
    fn test_worker_box_ranges_are_disjoint() {
        for worker in 0..9 {
            let last = box_id_base(worker) + BOXES_PER_WORKER as u32 - 1;
            assert!(last < box_id_base(worker + 1));
        }
        // Isolate rejects box ids from 10000 on
        assert!(box_id_base(9) + BOXES_PER_WORKER as u32 - 1 <= 9999);
    }

    #[test]
    fn test_limits_in_sandbox_units() {
        let config = SandboxConfig::default();
        assert_eq!(config.compile_memory_limit_kb(), 2048 * 1024);
        assert_eq!(config.checker_time_limit_secs(), 20.0);
    }
}
