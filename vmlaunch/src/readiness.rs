//! Readiness polling: wait for the VM's SSH port while watching the boot
//! process.
//!
//! The loop sleeps `interval` between attempts and gives up after `ceiling`
//! of accumulated sleep; time spent inside connection attempts is not
//! counted. Giving up is not an error: the caller starts tunnels anyway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use vmlaunch_shared::errors::LauncherResult;

use crate::clock::Clock;
use crate::lifecycle::{ExitInfo, TrackedProcess};
use crate::options::PollOptions;

/// One TCP reachability check.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// `true` if a connection to `target` completed within `timeout`.
    async fn probe(&self, target: &str, timeout: Duration) -> bool;
}

/// Plain TCP connect, the connection is dropped immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn probe(&self, target: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::trace!(target, error = %e, "Connect failed");
                false
            }
            Err(_) => {
                tracing::trace!(target, "Connect timed out");
                false
            }
        }
    }
}

/// Something whose premature exit aborts the wait.
pub trait Liveness {
    fn exited(&mut self) -> Option<ExitInfo>;
}

impl Liveness for TrackedProcess {
    fn exited(&mut self) -> Option<ExitInfo> {
        self.try_exit()
    }
}

/// Outcome of a completed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The port accepted a connection after `elapsed` of polling.
    Ready { elapsed: Duration },
    /// The ceiling passed without a successful connection.
    TimedOut { ceiling: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Progress callback: `(elapsed, ceiling)` after every wait.
pub type ProgressFn<'a> = dyn Fn(Duration, Duration) + Send + Sync + 'a;

pub struct ReadinessPoller {
    target: String,
    interval: Duration,
    ceiling: Duration,
    connect_timeout: Duration,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn PortProbe>,
}

impl ReadinessPoller {
    pub fn new(
        target: impl Into<String>,
        poll: &PollOptions,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            target: target.into(),
            interval: poll.interval(),
            ceiling: poll.ceiling(),
            connect_timeout: poll.connect_timeout(),
            clock,
            probe,
        }
    }

    /// Poll until the target accepts a connection or the ceiling passes.
    ///
    /// Each round checks `boot` first; if it has exited the wait fails with
    /// [`LauncherError::BootExited`](vmlaunch_shared::LauncherError::BootExited)
    /// before any further probing.
    pub async fn wait<L: Liveness + ?Sized>(
        &self,
        boot: &mut L,
        progress: &ProgressFn<'_>,
    ) -> LauncherResult<Readiness> {
        let mut elapsed = Duration::ZERO;

        tracing::info!(
            target = %self.target,
            interval_secs = self.interval.as_secs(),
            ceiling_secs = self.ceiling.as_secs(),
            "Waiting for VM to accept connections"
        );

        while elapsed < self.ceiling {
            if let Some(exit) = boot.exited() {
                tracing::error!(?exit, "Boot process exited while waiting for the VM");
                return Err(exit.into_boot_error());
            }

            if self.probe.probe(&self.target, self.connect_timeout).await {
                tracing::info!(
                    target = %self.target,
                    elapsed_secs = elapsed.as_secs(),
                    "VM is accepting connections"
                );
                return Ok(Readiness::Ready { elapsed });
            }

            self.clock.sleep(self.interval).await;
            elapsed += self.interval;
            progress(elapsed, self.ceiling);
        }

        tracing::warn!(
            target = %self.target,
            ceiling_secs = self.ceiling.as_secs(),
            "VM did not accept connections in time, continuing anyway"
        );
        Ok(Readiness::TimedOut {
            ceiling: self.ceiling,
        })
    }
}
