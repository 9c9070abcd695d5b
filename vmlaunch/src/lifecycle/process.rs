//! Handles for the child processes a launch supervises.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::util::{is_group_alive, is_process_alive, signal_group, signal_process};

/// What a supervised process is for. Declaration order is shutdown order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    Boot,
    SshTunnel,
    VncTunnel,
}

impl ProcessRole {
    pub const ALL: [ProcessRole; 3] = [
        ProcessRole::Boot,
        ProcessRole::SshTunnel,
        ProcessRole::VncTunnel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Boot => "boot",
            ProcessRole::SshTunnel => "ssh-tunnel",
            ProcessRole::VncTunnel => "vnc-tunnel",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable {role, pid} pair, as written to the run-state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub role: ProcessRole,
    pub pid: u32,
    /// `pid` was spawned as the leader of its own process group.
    #[serde(default)]
    pub process_group: bool,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Shell-style exit code: the process's own code, or 128+N when it was
    /// killed by signal N.
    pub fn shell_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }

    pub fn into_boot_error(self) -> LauncherError {
        LauncherError::BootExited {
            code: self.code,
            signal: self.signal,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A supervised process.
///
/// Spawned processes keep their `Child` so liveness checks also reap them.
/// Processes recovered from a run-state file are managed by PID only.
///
/// A process spawned as a group leader is signalled as a whole group, and
/// counts as alive while any member of the group remains.
#[derive(Debug)]
pub struct TrackedProcess {
    role: ProcessRole,
    pid: u32,
    process_group: bool,
    child: Option<Child>,
    exit: Option<ExitInfo>,
}

impl TrackedProcess {
    pub fn from_child(role: ProcessRole, child: Child) -> LauncherResult<Self> {
        let pid = child.id().ok_or_else(|| {
            LauncherError::Spawn(format!("{} exited before its pid was read", role))
        })?;
        Ok(Self {
            role,
            pid,
            process_group: false,
            child: Some(child),
            exit: None,
        })
    }

    pub fn from_pid(role: ProcessRole, pid: u32) -> Self {
        Self {
            role,
            pid,
            process_group: false,
            child: None,
            exit: None,
        }
    }

    /// Mark the process as leader of a group whose ID equals its PID, as
    /// set up by `process_group(0)` at spawn time.
    pub fn group_leader(mut self) -> Self {
        self.process_group = true;
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn record(&self) -> ProcessRecord {
        ProcessRecord {
            role: self.role,
            pid: self.pid,
            process_group: self.process_group,
        }
    }

    /// Exit information if the process has ended, `None` while it runs.
    ///
    /// Without a `Child` handle the exit status is unknowable, so a vanished
    /// PID reports as exited with no code or signal.
    pub fn try_exit(&mut self) -> Option<ExitInfo> {
        if let Some(exit) = self.exit {
            return Some(exit);
        }

        let exit = match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(ExitInfo::from(status)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(role = %self.role, pid = self.pid, error = %e, "try_wait failed");
                    None
                }
            },
            None => (!is_process_alive(self.pid)).then_some(ExitInfo {
                code: None,
                signal: None,
            }),
        };

        self.exit = exit;
        exit
    }

    /// Whether anything started under this handle is still running.
    ///
    /// The leader is reaped first so a dead leader does not keep its group
    /// visible as a zombie.
    pub fn is_alive(&mut self) -> bool {
        let leader_running = self.try_exit().is_none();
        leader_running || (self.process_group && is_group_alive(self.pid))
    }

    /// Send `signal`. Returns false only when delivery failed outright.
    pub fn signal(&self, signal: Signal) -> bool {
        if self.process_group {
            signal_group(self.pid, signal)
        } else {
            signal_process(self.pid, signal)
        }
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> LauncherResult<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let Some(child) = self.child.as_mut() else {
            return Err(LauncherError::Internal(format!(
                "cannot wait on {} (pid {}) without a child handle",
                self.role, self.pid
            )));
        };

        let status = child.wait().await.map_err(|e| {
            LauncherError::Internal(format!("Failed to wait for {}: {}", self.role, e))
        })?;
        let exit = ExitInfo::from(status);
        self.exit = Some(exit);
        Ok(exit)
    }
}
