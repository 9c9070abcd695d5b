//! Host-to-device port forwards.
//!
//! Two instances of the forwarding tool, `<tool> <local> <device>`, one for
//! SSH and one for VNC. They are started whether or not the VM answered in
//! time, never retried, and never liveness-checked; a tunnel that fails to
//! start is logged and skipped.

use std::process::Stdio;

use tokio::process::Command;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::lifecycle::{ProcessRole, TrackedProcess};
use crate::options::{LauncherOptions, PortForward};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSpec {
    pub role: ProcessRole,
    pub forward: PortForward,
}

pub struct TunnelManager {
    tool: String,
    tunnels: [TunnelSpec; 2],
}

impl TunnelManager {
    pub fn new(tool: impl Into<String>, ssh: PortForward, vnc: PortForward) -> Self {
        Self {
            tool: tool.into(),
            tunnels: [
                TunnelSpec {
                    role: ProcessRole::SshTunnel,
                    forward: ssh,
                },
                TunnelSpec {
                    role: ProcessRole::VncTunnel,
                    forward: vnc,
                },
            ],
        }
    }

    pub fn from_options(options: &LauncherOptions) -> Self {
        Self::new(&options.tunnel_tool, options.ssh_tunnel, options.vnc_tunnel)
    }

    pub fn tunnels(&self) -> &[TunnelSpec] {
        &self.tunnels
    }

    /// Spawn one forward.
    pub fn spawn(&self, spec: &TunnelSpec) -> LauncherResult<TrackedProcess> {
        let mut cmd = Command::new(&self.tool);
        cmd.arg(spec.forward.local.to_string())
            .arg(spec.forward.device.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            LauncherError::Spawn(format!(
                "Failed to spawn {} for {} ({} -> {}): {}",
                self.tool, spec.role, spec.forward.local, spec.forward.device, e
            ))
        })?;

        let process = TrackedProcess::from_child(spec.role, child)?.group_leader();
        tracing::info!(
            role = %spec.role,
            pid = process.pid(),
            local = spec.forward.local,
            device = spec.forward.device,
            "Tunnel started"
        );
        Ok(process)
    }

    /// Spawn both forwards, SSH first. Failures are logged, not returned.
    pub fn start_all(&self) -> Vec<(TunnelSpec, TrackedProcess)> {
        self.tunnels
            .iter()
            .filter_map(|spec| match self.spawn(spec) {
                Ok(process) => Some((*spec, process)),
                Err(e) => {
                    tracing::warn!(role = %spec.role, error = %e, "Tunnel did not start");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn default_forwards() {
        let manager = TunnelManager::from_options(&LauncherOptions::default());
        let ports: Vec<_> = manager
            .tunnels()
            .iter()
            .map(|t| (t.role, t.forward.local, t.forward.device))
            .collect();
        assert_eq!(
            ports,
            vec![
                (ProcessRole::SshTunnel, 22222, 22222),
                (ProcessRole::VncTunnel, 5901, 5901),
            ]
        );
    }

    #[tokio::test]
    async fn start_all_skips_unspawnable_tool() {
        let manager = TunnelManager::new(
            "/nonexistent/iproxy",
            PortForward::symmetric(22222),
            PortForward::symmetric(5901),
        );
        assert!(manager.start_all().is_empty());
    }

    #[tokio::test]
    async fn tool_receives_port_arguments() {
        // `sleep <local> <device>` stays up long enough to be observed
        let manager = TunnelManager::new(
            "sleep",
            PortForward { local: 30, device: 31 },
            PortForward { local: 32, device: 33 },
        );
        let started = manager.start_all();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1.role(), ProcessRole::SshTunnel);
        assert_eq!(started[1].0.forward, PortForward { local: 32, device: 33 });

        for (_, mut process) in started {
            assert!(process.is_alive());
            process.signal(Signal::SIGKILL);
            process.wait().await.unwrap();
        }
    }
}
