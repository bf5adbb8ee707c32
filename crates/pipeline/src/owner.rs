use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// The process running a job.
///
/// The start time is kept next to the pid so a recycled pid is not taken
/// for the original owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOwner {
    pub pid: u32,
    /// Process start time, seconds since the Unix epoch
    pub started_at: u64,
}

impl JobOwner {
    /// Identify this process; None where the platform cannot report it
    pub fn current() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        Self::lookup(pid)
    }

    /// Whether the owning process is still running
    pub fn is_alive(&self) -> bool {
        Self::lookup(Pid::from_u32(self.pid))
            .map(|found| found == *self)
            .unwrap_or(false)
    }

    fn lookup(pid: Pid) -> Option<Self> {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
        system.process(pid).map(|process| JobOwner {
            pid: pid.as_u32(),
            started_at: process.start_time(),
        })
    }
}
