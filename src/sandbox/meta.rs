//! Isolate meta file parser
//!
//! Parses the meta file output from isolate into backend-neutral run stats.

/// Raw execution status of a sandboxed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded
    TimedOut,
    /// Killed by signal (crash)
    Signaled(i32),
    /// Runtime error (non-zero exit)
    RuntimeError,
    /// Internal error in the sandbox
    InternalError,
}

/// What the sandbox measured for one command
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// CPU time used in seconds
    pub time: f64,
    /// Wall clock time in seconds
    pub wall_time: f64,
    /// Peak memory in KB (from cg-mem or max-rss)
    pub memory: u64,
    /// Exit code of the process
    pub exit_code: i32,
    pub status: RunStatus,
    /// Sandbox-provided explanation, if any
    pub message: String,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            time: 0.0,
            wall_time: 0.0,
            memory: 0,
            exit_code: 0,
            status: RunStatus::Ok,
            message: String::new(),
        }
    }
}

impl RunStats {
    /// Exited normally with status 0
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Ok && self.exit_code == 0
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> RunStats {
    let mut stats = RunStats::default();
    let mut status_str = String::new();
    let mut signal = None;
    let mut killed = false;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    stats.time = t;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    stats.wall_time = t;
                }
            }
            "cg-mem" | "max-rss" => {
                // cg-mem for cgroups, max-rss for non-cgroups (both in KB)
                if let Ok(m) = value.parse::<u64>() {
                    stats.memory = stats.memory.max(m);
                }
            }
            "status" => status_str = value.to_string(),
            "exitcode" => stats.exit_code = value.parse().unwrap_or(0),
            "exitsig" => signal = value.parse::<i32>().ok(),
            "killed" => killed = value == "1",
            "message" => stats.message = value.to_string(),
            _ => {}
        }
    }

    stats.status = match (signal, status_str.as_str()) {
        (_, "TO") => RunStatus::TimedOut,
        (Some(sig), _) => RunStatus::Signaled(sig),
        (None, "SG") => RunStatus::Signaled(0),
        (_, "XX") => RunStatus::InternalError,
        (_, "RE") => RunStatus::RuntimeError,
        (_, "") if stats.exit_code == 0 && !killed => RunStatus::Ok,
        _ => RunStatus::RuntimeError,
    };

    stats
}
