//! Ownership and teardown of every process a launch starts.
//!
//! ```text
//! Running ──(signal | boot exit | error | drop)──→ ShuttingDown ──→ Terminated
//! ```
//!
//! Shutdown is two-phase: SIGTERM to every live process in role order
//! (boot, SSH tunnel, VNC tunnel), a grace pause, then SIGKILL to whatever
//! is still alive. Handles are cleared afterwards, so shutting down again
//! signals nothing.

mod lock;
mod process;
mod state;

pub use lock::LaunchLock;
pub use process::{ExitInfo, ProcessRecord, ProcessRole, TrackedProcess};
pub use state::{RunState, RunStateFile};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    ShuttingDown,
    Terminated,
}

/// The three process slots, one per role.
#[derive(Debug, Default)]
pub struct ProcessSet {
    boot: Option<TrackedProcess>,
    ssh_tunnel: Option<TrackedProcess>,
    vnc_tunnel: Option<TrackedProcess>,
}

impl ProcessSet {
    pub fn get(&self, role: ProcessRole) -> Option<&TrackedProcess> {
        match role {
            ProcessRole::Boot => self.boot.as_ref(),
            ProcessRole::SshTunnel => self.ssh_tunnel.as_ref(),
            ProcessRole::VncTunnel => self.vnc_tunnel.as_ref(),
        }
    }

    pub fn get_mut(&mut self, role: ProcessRole) -> Option<&mut TrackedProcess> {
        self.slot(role).as_mut()
    }

    fn slot(&mut self, role: ProcessRole) -> &mut Option<TrackedProcess> {
        match role {
            ProcessRole::Boot => &mut self.boot,
            ProcessRole::SshTunnel => &mut self.ssh_tunnel,
            ProcessRole::VncTunnel => &mut self.vnc_tunnel,
        }
    }

    /// Records of every tracked process, in shutdown order.
    pub fn records(&self) -> Vec<ProcessRecord> {
        ProcessRole::ALL
            .iter()
            .filter_map(|role| self.get(*role).map(TrackedProcess::record))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.boot.is_none() && self.ssh_tunnel.is_none() && self.vnc_tunnel.is_none()
    }

    fn clear(&mut self) {
        self.boot = None;
        self.ssh_tunnel = None;
        self.vnc_tunnel = None;
    }
}

/// What a shutdown pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sent SIGTERM in the first phase.
    pub terminated: Vec<ProcessRecord>,
    /// Still alive after the grace period and sent SIGKILL.
    pub killed: Vec<ProcessRecord>,
}

impl ShutdownReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.killed.is_empty()
    }
}

/// Sole owner of the launch's child processes.
pub struct LifecycleController {
    processes: ProcessSet,
    clock: Arc<dyn Clock>,
    grace: Duration,
    state: ControllerState,
    run_state: Option<(RunStateFile, PathBuf)>,
}

impl LifecycleController {
    pub fn new(clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            processes: ProcessSet::default(),
            clock,
            grace,
            state: ControllerState::Running,
            run_state: None,
        }
    }

    /// Mirror tracked processes into `file` so other invocations can find
    /// them. The file is removed once shutdown completes.
    pub fn with_run_state(mut self, file: RunStateFile, project_dir: PathBuf) -> Self {
        self.run_state = Some((file, project_dir));
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        self.processes.records()
    }

    /// Take ownership of `process`. A role can only be filled once.
    pub fn track(&mut self, process: TrackedProcess) -> LauncherResult<()> {
        if self.state != ControllerState::Running {
            return Err(LauncherError::Internal(format!(
                "cannot track {} after shutdown started",
                process.role()
            )));
        }

        let role = process.role();
        let slot = self.processes.slot(role);
        if slot.is_some() {
            return Err(LauncherError::Internal(format!("{} is already tracked", role)));
        }

        tracing::debug!(role = %role, pid = process.pid(), "Tracking process");
        *slot = Some(process);
        self.persist();
        Ok(())
    }

    pub fn boot_mut(&mut self) -> Option<&mut TrackedProcess> {
        self.processes.get_mut(ProcessRole::Boot)
    }

    /// Block until the boot process exits on its own.
    pub async fn wait_boot(&mut self) -> LauncherResult<ExitInfo> {
        match self.boot_mut() {
            Some(boot) => boot.wait().await,
            None => Err(LauncherError::Internal("no boot process is tracked".into())),
        }
    }

    /// Two-phase shutdown of everything tracked. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if self.state == ControllerState::Terminated {
            return ShutdownReport::default();
        }
        self.state = ControllerState::ShuttingDown;

        let terminated = self.signal_alive(Signal::SIGTERM);
        if !terminated.is_empty() {
            self.clock.sleep(self.grace).await;
        }
        let killed = self.signal_alive(Signal::SIGKILL);

        self.finish(ShutdownReport { terminated, killed })
    }

    /// Same as [`shutdown`](Self::shutdown), sleeping on the current thread.
    /// Used where no async context is available, such as `Drop`.
    pub fn shutdown_blocking(&mut self) -> ShutdownReport {
        if self.state == ControllerState::Terminated {
            return ShutdownReport::default();
        }
        self.state = ControllerState::ShuttingDown;

        let terminated = self.signal_alive(Signal::SIGTERM);
        if !terminated.is_empty() {
            std::thread::sleep(self.grace);
        }
        let killed = self.signal_alive(Signal::SIGKILL);

        self.finish(ShutdownReport { terminated, killed })
    }

    fn signal_alive(&mut self, signal: Signal) -> Vec<ProcessRecord> {
        let mut signalled = Vec::new();
        for role in ProcessRole::ALL {
            let Some(process) = self.processes.get_mut(role) else {
                continue;
            };
            if !process.is_alive() {
                continue;
            }

            tracing::info!(role = %role, pid = process.pid(), %signal, "Signalling process");
            if process.signal(signal) {
                signalled.push(process.record());
            }
        }
        signalled
    }

    fn finish(&mut self, report: ShutdownReport) -> ShutdownReport {
        // No reap after SIGKILL; dropped tokio children are reaped in the background
        self.processes.clear();
        if let Some((file, _)) = &self.run_state {
            file.remove();
        }
        self.state = ControllerState::Terminated;

        tracing::info!(
            terminated = report.terminated.len(),
            killed = report.killed.len(),
            "Shutdown complete"
        );
        report
    }

    fn persist(&self) {
        let Some((file, project_dir)) = &self.run_state else {
            return;
        };

        let state = RunState {
            launcher_pid: std::process::id(),
            project_dir: project_dir.clone(),
            processes: self.processes.records(),
        };
        if let Err(e) = file.write(&state) {
            tracing::warn!(error = %e, "Failed to record run state");
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if self.state == ControllerState::Terminated || self.processes.is_empty() {
            return;
        }

        tracing::warn!("Lifecycle controller dropped while processes were running, cleaning up");
        // Last resort only. Sleeps out the grace period on this thread, which
        // may be a runtime worker; normal exits go through `shutdown` first.
        self.shutdown_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use tokio::process::Command;

    fn spawn(role: ProcessRole, script: &str) -> TrackedProcess {
        let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
        TrackedProcess::from_child(role, child).unwrap()
    }

    fn spawn_group_leader(role: ProcessRole, script: &str) -> TrackedProcess {
        let child = Command::new("sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap();
        TrackedProcess::from_child(role, child).unwrap().group_leader()
    }

    fn controller() -> LifecycleController {
        LifecycleController::new(Arc::new(TokioClock), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn shutdown_terminates_in_role_order() {
        let mut ctl = controller();
        ctl.track(spawn(ProcessRole::VncTunnel, "exec sleep 30")).unwrap();
        ctl.track(spawn(ProcessRole::Boot, "exec sleep 30")).unwrap();
        ctl.track(spawn(ProcessRole::SshTunnel, "exec sleep 30")).unwrap();

        let report = ctl.shutdown().await;
        let roles: Vec<_> = report.terminated.iter().map(|r| r.role).collect();
        assert_eq!(roles, ProcessRole::ALL.to_vec());
        assert!(report.killed.is_empty());
        assert_eq!(ctl.state(), ControllerState::Terminated);
        assert!(ctl.records().is_empty());
    }

    #[tokio::test]
    async fn shutdown_kills_group_members_that_outlive_the_leader() {
        let mut ctl = controller();
        let mut boot = spawn_group_leader(
            ProcessRole::Boot,
            "sh -c 'trap \"\" TERM; while true; do sleep 1; done' &\nwait",
        );
        assert!(boot.is_alive());
        ctl.track(boot).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = ctl.shutdown().await;
        assert_eq!(report.terminated.len(), 1);
        // Leader died on SIGTERM, the stubborn background shell kept the group alive
        assert_eq!(report.killed.len(), 1);
        assert_eq!(report.killed[0].role, ProcessRole::Boot);
        assert!(report.killed[0].process_group);
    }

    #[tokio::test]
    async fn shutdown_escalates_to_sigkill() {
        let mut ctl = controller();
        ctl.track(spawn(ProcessRole::Boot, "trap '' TERM; while true; do sleep 1; done"))
            .unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = ctl.shutdown().await;
        assert_eq!(report.terminated.len(), 1);
        assert_eq!(report.killed.len(), 1);
        assert_eq!(report.killed[0].role, ProcessRole::Boot);
    }

    #[tokio::test]
    async fn second_shutdown_signals_nothing() {
        let mut ctl = controller();
        ctl.track(spawn(ProcessRole::Boot, "exec sleep 30")).unwrap();

        let first = ctl.shutdown().await;
        assert!(!first.is_empty());

        let second = ctl.shutdown().await;
        assert!(second.is_empty());
        assert!(ctl.shutdown_blocking().is_empty());
    }

    #[tokio::test]
    async fn exited_processes_are_not_signalled() {
        let mut ctl = controller();
        let mut done = spawn(ProcessRole::SshTunnel, "exit 0");
        done.wait().await.unwrap();
        ctl.track(done).unwrap();

        let report = ctl.shutdown().await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn track_rejects_duplicate_role_and_late_tracking() {
        let mut ctl = controller();
        ctl.track(spawn(ProcessRole::Boot, "exec sleep 30")).unwrap();
        let dup = spawn(ProcessRole::Boot, "exec sleep 30");
        let dup_pid = dup.pid();
        assert!(ctl.track(dup).is_err());
        crate::util::signal_process(dup_pid, Signal::SIGKILL);

        ctl.shutdown().await;
        let late = spawn(ProcessRole::VncTunnel, "exit 0");
        assert!(ctl.track(late).is_err());
    }

    #[tokio::test]
    async fn run_state_follows_tracking_and_is_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = RunStateFile::new(dir.path().join("launcher.json"));
        let mut ctl = controller().with_run_state(file.clone(), PathBuf::from("vm"));

        let boot = spawn(ProcessRole::Boot, "exec sleep 30");
        let boot_pid = boot.pid();
        ctl.track(boot).unwrap();

        let state = file.read().unwrap().unwrap();
        assert_eq!(state.launcher_pid, std::process::id());
        assert_eq!(
            state.processes,
            vec![ProcessRecord {
                role: ProcessRole::Boot,
                pid: boot_pid,
                process_group: false,
            }]
        );

        ctl.shutdown().await;
        assert!(file.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_cleans_up_running_processes() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = RunStateFile::new(dir.path().join("launcher.json"));
        {
            let mut ctl = controller().with_run_state(file.clone(), PathBuf::from("vm"));
            ctl.track(spawn(ProcessRole::Boot, "exec sleep 30")).unwrap();
        }
        assert!(file.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_boot_without_boot_is_error() {
        let mut ctl = controller();
        assert!(ctl.wait_boot().await.is_err());
    }
}
