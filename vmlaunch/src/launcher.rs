//! Launch orchestration.
//!
//! ## Stages
//!
//! ```text
//! 1. Prerequisites ──→ 2. Archive ──→ 3. Boot ──→ 4. Readiness ──→ 5. Tunnels ──→ wait
//! ```
//!
//! Every stage runs once, in order. From stage 3 on the spawned processes
//! belong to a [`LifecycleController`], and every way out of [`Launcher::run`]
//! (error, signal, boot exit) passes through its shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vmlaunch_shared::constants::home;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::archive::{ArchivePreparer, PrepareOutcome};
use crate::boot::VmLauncher;
use crate::clock::{Clock, TokioClock};
use crate::host_check::{HostReport, check_prerequisites};
use crate::lifecycle::{
    ExitInfo, LaunchLock, LifecycleController, ProcessRole, RunStateFile, ShutdownReport,
};
use crate::options::{LauncherOptions, PortForward};
use crate::readiness::{PortProbe, Readiness, ReadinessPoller, TcpProbe};
use crate::tunnel::TunnelManager;

/// Progress notifications, in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    PrerequisitesChecked(HostReport),
    ArchivePrepared(PrepareOutcome),
    BootStarted {
        pid: u32,
    },
    WaitingForVm {
        elapsed: Duration,
        ceiling: Duration,
    },
    VmReady {
        elapsed: Duration,
    },
    VmNotReady {
        ceiling: Duration,
    },
    TunnelStarted {
        role: ProcessRole,
        pid: u32,
        forward: PortForward,
    },
    Running {
        vnc_url: String,
        ssh_command: String,
    },
    ShuttingDown,
    Stopped(ShutdownReport),
}

/// How a launch that got past setup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// SIGINT/SIGTERM (or another cancellation) ended the launch.
    Interrupted,
    /// The boot process exited on its own after the launch completed.
    BootExited(ExitInfo),
}

impl LaunchOutcome {
    /// Process exit code for the launcher itself.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Interrupted => 0,
            LaunchOutcome::BootExited(exit) => exit.shell_code(),
        }
    }
}

type Observer = Arc<dyn Fn(&LaunchEvent) + Send + Sync>;

pub struct Launcher {
    options: LauncherOptions,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn PortProbe>,
    observer: Observer,
    home_dir: Option<PathBuf>,
}

impl Launcher {
    pub fn new(options: LauncherOptions) -> Self {
        Self {
            options,
            clock: Arc::new(TokioClock),
            probe: Arc::new(TcpProbe),
            observer: Arc::new(|_| {}),
            home_dir: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_observer(mut self, observer: impl Fn(&LaunchEvent) + Send + Sync + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Hold the launch lock and publish run state under `home_dir`.
    pub fn with_home(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    pub fn options(&self) -> &LauncherOptions {
        &self.options
    }

    fn emit(&self, event: LaunchEvent) {
        tracing::trace!(?event, "Launch event");
        (self.observer)(&event);
    }

    /// Run only the archive stage.
    pub fn prepare(&self) -> LauncherResult<PrepareOutcome> {
        self.options.validate()?;
        let outcome = ArchivePreparer::from_options(&self.options).prepare()?;
        self.emit(LaunchEvent::ArchivePrepared(outcome.clone()));
        Ok(outcome)
    }

    /// Run a full launch until the boot process exits or `cancel` fires.
    ///
    /// Errors before the boot process starts leave nothing running. Errors
    /// after it starts (a premature boot exit) shut everything down first.
    pub async fn run(&self, cancel: CancellationToken) -> LauncherResult<LaunchOutcome> {
        self.options.validate()?;

        let report = check_prerequisites(&self.options)?;
        self.emit(LaunchEvent::PrerequisitesChecked(report));

        let _lock = match &self.home_dir {
            Some(home_dir) => Some(LaunchLock::acquire(home_dir)?),
            None => None,
        };

        let preparer = ArchivePreparer::from_options(&self.options);
        let prepared = tokio::select! {
            result = tokio::task::spawn_blocking(move || preparer.prepare()) => {
                result.map_err(|e| {
                    LauncherError::Internal(format!("archive task failed: {}", e))
                })??
            }
            _ = cancel.cancelled() => {
                tracing::info!("Cancelled during archive preparation");
                return Ok(LaunchOutcome::Interrupted);
            }
        };
        self.emit(LaunchEvent::ArchivePrepared(prepared));

        let vm = VmLauncher::from_options(&self.options);
        vm.verify()?;

        let mut controller =
            LifecycleController::new(Arc::clone(&self.clock), self.options.shutdown_grace());
        if let Some(home_dir) = &self.home_dir {
            controller = controller.with_run_state(
                RunStateFile::new(home_dir.join(home::STATE_FILE)),
                self.options.project_dir.clone(),
            );
        }

        let boot = vm.spawn()?;
        self.emit(LaunchEvent::BootStarted { pid: boot.pid() });
        controller.track(boot)?;

        let result = self.supervise(&mut controller, &cancel).await;
        match &result {
            Ok(outcome) => tracing::info!(?outcome, "Launch ended"),
            Err(e) => tracing::error!(error = %e, "Launch failed"),
        }

        self.emit(LaunchEvent::ShuttingDown);
        let report = controller.shutdown().await;
        self.emit(LaunchEvent::Stopped(report));

        result
    }

    async fn supervise(
        &self,
        controller: &mut LifecycleController,
        cancel: &CancellationToken,
    ) -> LauncherResult<LaunchOutcome> {
        let poller = ReadinessPoller::new(
            &self.options.ssh_target,
            &self.options.poll,
            Arc::clone(&self.clock),
            Arc::clone(&self.probe),
        );
        let progress = |elapsed, ceiling| self.emit(LaunchEvent::WaitingForVm { elapsed, ceiling });

        let readiness = {
            let boot = controller
                .boot_mut()
                .ok_or_else(|| LauncherError::Internal("boot process is not tracked".into()))?;
            tokio::select! {
                result = poller.wait(boot, &progress) => result?,
                _ = cancel.cancelled() => return Ok(LaunchOutcome::Interrupted),
            }
        };

        match readiness {
            Readiness::Ready { elapsed } => self.emit(LaunchEvent::VmReady { elapsed }),
            Readiness::TimedOut { ceiling } => self.emit(LaunchEvent::VmNotReady { ceiling }),
        }

        let tunnels = TunnelManager::from_options(&self.options);
        for (spec, process) in tunnels.start_all() {
            let pid = process.pid();
            controller.track(process)?;
            self.emit(LaunchEvent::TunnelStarted {
                role: spec.role,
                pid,
                forward: spec.forward,
            });
        }

        self.emit(LaunchEvent::Running {
            vnc_url: self.options.vnc_url(),
            ssh_command: self.options.ssh_command(),
        });

        tokio::select! {
            exit = controller.wait_boot() => Ok(LaunchOutcome::BootExited(exit?)),
            _ = cancel.cancelled() => Ok(LaunchOutcome::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(LaunchOutcome::Interrupted.exit_code(), 0);
        assert_eq!(
            LaunchOutcome::BootExited(ExitInfo {
                code: Some(4),
                signal: None
            })
            .exit_code(),
            4
        );
        assert_eq!(
            LaunchOutcome::BootExited(ExitInfo {
                code: None,
                signal: Some(9)
            })
            .exit_code(),
            137
        );
    }
}
