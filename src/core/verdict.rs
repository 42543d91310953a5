use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of running a contestant's program on one test, before checking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Exited cleanly; the checker decides the score
    Ok,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Non-zero exit code
    RuntimeError(i32),
    /// Killed by a signal
    Signaled(i32),
    /// Exited cleanly without producing the output file
    MissingOutput,
    /// Sandbox or store failure while running this test
    InternalError,
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => write!(f, "Ok"),
            Verdict::TimeLimitExceeded => write!(f, "Time limit exceeded"),
            Verdict::MemoryLimitExceeded => write!(f, "Memory limit exceeded"),
            Verdict::RuntimeError(code) => {
                write!(f, "Runtime error: exit code {}", code)
            }
            Verdict::Signaled(sig) => match nix::sys::signal::Signal::try_from(*sig) {
                Ok(signal) => write!(f, "Runtime error: killed by {}", signal.as_str()),
                Err(_) => write!(f, "Runtime error: killed by signal {}", sig),
            },
            Verdict::MissingOutput => write!(f, "Missing output file"),
            Verdict::InternalError => write!(f, "Internal grader error"),
        }
    }
}
