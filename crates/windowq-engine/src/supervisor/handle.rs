//! Implementation of process handles.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use sysinfo::Pid;
use sysinfo::ProcessStatus;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tokio::process::Child;
use tracing::debug;
use tracing::warn;

/// A capability for observing a job process.
pub trait ProcessHandle: Send + fmt::Debug {
    /// Gets the process id.
    fn pid(&self) -> u32;

    /// Determines if the process is still running.
    ///
    /// This never blocks.
    fn is_alive(&mut self) -> bool;
}

/// A handle to a process spawned by this scheduler session.
///
/// Checking liveness reaps the process once it has exited.
#[derive(Debug)]
pub struct ChildHandle {
    /// The process id.
    pid: u32,
    /// The child process; `None` once it has been reaped.
    child: Option<Child>,
}

impl ChildHandle {
    /// Constructs a handle for a spawned child.
    ///
    /// Returns `None` if the child has already been reaped.
    pub fn new(child: Child) -> Option<Self> {
        Some(Self {
            pid: child.id()?,
            child: Some(child),
        })
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        let Some(child) = &mut self.child else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "job process has exited");
                self.child = None;
                false
            }
            Err(e) => {
                warn!(pid = self.pid, "failed to query job process: {e}");
                self.child = None;
                false
            }
        }
    }
}

/// The slack, in seconds, allowed between a process's start time and the
/// recorded start of its job.
const START_TIME_TOLERANCE_SECS: i64 = 5;

/// A handle to a process started by a previous scheduler session.
///
/// The process cannot be reaped, so liveness is checked by process id. A
/// zombie counts as exited, as does a process that started after the job was
/// recorded (the pid was reused).
pub struct PidHandle {
    /// The process id.
    pid: u32,
    /// When the job was recorded as started.
    started: DateTime<Utc>,
    /// The system information used to query the process.
    system: System,
}

impl PidHandle {
    /// Constructs a handle for the given process id and recorded start time.
    pub fn new(pid: u32, started: DateTime<Utc>) -> Self {
        Self {
            pid,
            started,
            system: System::new(),
        }
    }
}

impl fmt::Debug for PidHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidHandle")
            .field("pid", &self.pid)
            .field("started", &self.started)
            .finish()
    }
}

impl ProcessHandle for PidHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        // A zero pid is never a job process
        if self.pid == 0 {
            return false;
        }

        let pid = Pid::from_u32(self.pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = self.system.process(pid) else {
            return false;
        };

        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }

        let process_start = i64::try_from(process.start_time()).unwrap_or(i64::MAX);
        if process_start > self.started.timestamp() + START_TIME_TOLERANCE_SECS {
            warn!(
                pid = self.pid,
                started = %self.started,
                "process id was reused by a process started after the job; treating the job as \
                 exited"
            );
            return false;
        }

        true
    }
}

#[cfg(all(test, unix))]
mod test {
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::process::Command;

    use super::*;

    #[tokio::test]
    async fn child_handle_reaps() {
        let child = Command::new("sh")
            .args(["-c", "sleep 0.2"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let mut handle = ChildHandle::new(child).unwrap();
        assert!(handle.is_alive());

        let mut by_pid = PidHandle::new(handle.pid(), Utc::now());
        assert!(by_pid.is_alive());

        let mut exited = false;
        for _ in 0..100 {
            if !handle.is_alive() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(exited, "process should exit");
        assert!(!handle.is_alive());
        assert!(!by_pid.is_alive());
    }

    #[test]
    fn unknown_pid_is_not_alive() {
        assert!(!PidHandle::new(0, Utc::now()).is_alive());
        assert!(!PidHandle::new(u32::MAX - 1, Utc::now()).is_alive());
    }

    #[tokio::test]
    async fn reused_pid_is_not_alive() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 5"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        // A job recorded an hour ago cannot be this process
        let mut stale = PidHandle::new(pid, Utc::now() - chrono::Duration::hours(1));
        assert!(!stale.is_alive());

        let mut current = PidHandle::new(pid, Utc::now());
        assert!(current.is_alive());

        child.kill().await.unwrap();
    }
}
