//! Process identities
//!
//! A pid alone is recycled by the kernel; `(pid, start)` identifies one
//! incarnation of a process. Catch-up locks are keyed on these pairs so a
//! restarted worker or volume router no longer matches a stale entry.

use crate::common::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Start time in clock ticks since boot
    pub start: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start: u64) -> Self {
        Self { pid, start }
    }

    /// Identity of the running process
    pub fn current() -> Result<Self> {
        Self::of_pid(std::process::id())
    }

    /// Identity of an arbitrary local process
    pub fn of_pid(pid: u32) -> Result<Self> {
        let process = procfs::process::Process::new(pid as i32)
            .map_err(|e| crate::Error::NotFound(format!("process {}: {}", pid, e)))?;
        let stat = process
            .stat()
            .map_err(|e| crate::Error::Internal(format!("stat of process {}: {}", pid, e)))?;
        Ok(Self {
            pid,
            start: stat.starttime,
        })
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_identity_is_stable() {
        let first = ProcessIdentity::current().unwrap();
        let second = ProcessIdentity::current().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.pid, std::process::id());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessIdentity::new(42, 1000).to_string(), "42@1000");
    }
}
