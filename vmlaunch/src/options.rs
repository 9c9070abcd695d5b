//! Configuration for a launch.
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields the stock layout: `vm/` unpacked from `vm.tar.zst`, `boot.sh`
//! inside it, SSH readiness on `192.168.65.32:22222`, and `iproxy` tunnels
//! for 22222 and 5901.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmlaunch_shared::constants::{files, network, timing};
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

// ============================================================================
// Launcher Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LauncherOptions {
    /// Directory the image archive unpacks into. Its presence means the
    /// archive stage is skipped.
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    /// Image archive. Defaults to `<project_dir>.tar.zst` next to the
    /// project directory.
    #[serde(default)]
    pub archive: Option<PathBuf>,

    /// Boot entry point, relative to `project_dir`.
    #[serde(default = "default_boot_script")]
    pub boot_script: String,

    /// Extra arguments passed to the boot entry point.
    #[serde(default)]
    pub boot_args: Vec<String>,

    /// `host:port` probed to decide the VM is up.
    #[serde(default = "default_ssh_target")]
    pub ssh_target: String,

    #[serde(default)]
    pub poll: PollOptions,

    /// Port forwarding tool, resolved on `PATH` unless it contains a `/`.
    #[serde(default = "default_tunnel_tool")]
    pub tunnel_tool: String,

    #[serde(default = "default_ssh_tunnel")]
    pub ssh_tunnel: PortForward,

    #[serde(default = "default_vnc_tunnel")]
    pub vnc_tunnel: PortForward,

    /// Pause between SIGTERM and SIGKILL during shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Keep the primary archive after a successful extraction.
    ///
    /// Default: false (the archive is removed to reclaim disk space, even
    /// when it was supplied by the user rather than merged from fragments)
    #[serde(default)]
    pub keep_archive: bool,
}

/// Readiness polling budget.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollOptions {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_poll_ceiling_secs")]
    pub ceiling_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// One forwarded TCP port: `local` on the host, `device` on the VM.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub local: u16,
    pub device: u16,
}

impl PortForward {
    pub const fn symmetric(port: u16) -> Self {
        Self {
            local: port,
            device: port,
        }
    }
}

// Default value functions

fn default_project_dir() -> PathBuf {
    PathBuf::from(files::PROJECT_DIR)
}

fn default_boot_script() -> String {
    files::BOOT_SCRIPT.to_string()
}

fn default_ssh_target() -> String {
    network::SSH_TARGET.to_string()
}

fn default_tunnel_tool() -> String {
    network::TUNNEL_TOOL.to_string()
}

fn default_ssh_tunnel() -> PortForward {
    PortForward::symmetric(network::SSH_PORT)
}

fn default_vnc_tunnel() -> PortForward {
    PortForward::symmetric(network::VNC_PORT)
}

fn default_shutdown_grace_secs() -> u64 {
    timing::SHUTDOWN_GRACE_SECS
}

fn default_poll_interval_secs() -> u64 {
    timing::POLL_INTERVAL_SECS
}

fn default_poll_ceiling_secs() -> u64 {
    timing::POLL_CEILING_SECS
}

fn default_connect_timeout_secs() -> u64 {
    timing::CONNECT_TIMEOUT_SECS
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            ceiling_secs: default_poll_ceiling_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PollOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for LauncherOptions {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            archive: None,
            boot_script: default_boot_script(),
            boot_args: Vec::new(),
            ssh_target: default_ssh_target(),
            poll: PollOptions::default(),
            tunnel_tool: default_tunnel_tool(),
            ssh_tunnel: default_ssh_tunnel(),
            vnc_tunnel: default_vnc_tunnel(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            keep_archive: false,
        }
    }
}

impl LauncherOptions {
    /// Load options from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> LauncherResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LauncherError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        // An empty document deserializes to null, not to a mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content).map_err(|e| {
            LauncherError::Config(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Primary archive path: explicit, or `<project_dir>.tar.zst`.
    pub fn archive_path(&self) -> PathBuf {
        if let Some(archive) = &self.archive {
            return archive.clone();
        }

        let mut name = self
            .project_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| files::PROJECT_DIR.into());
        name.push(files::ARCHIVE_SUFFIX);
        self.project_dir.with_file_name(name)
    }

    pub fn boot_script_path(&self) -> PathBuf {
        self.project_dir.join(&self.boot_script)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Reject combinations that would make the launch meaningless.
    pub fn validate(&self) -> LauncherResult<()> {
        if self.poll.interval_secs == 0 {
            return Err(LauncherError::Config(
                "poll interval must be at least one second".into(),
            ));
        }

        if self.ssh_tunnel.local == self.vnc_tunnel.local {
            return Err(LauncherError::Config(format!(
                "SSH and VNC tunnels both bind local port {}",
                self.ssh_tunnel.local
            )));
        }

        if self.boot_script.is_empty() {
            return Err(LauncherError::Config("boot script must not be empty".into()));
        }

        if !self.ssh_target.contains(':') {
            return Err(LauncherError::Config(format!(
                "SSH target '{}' must be host:port",
                self.ssh_target
            )));
        }

        Ok(())
    }

    /// `vnc://` URL of the local VNC forward.
    pub fn vnc_url(&self) -> String {
        format!("vnc://127.0.0.1:{}", self.vnc_tunnel.local)
    }

    /// Command that reaches the VM through the local SSH forward.
    pub fn ssh_command(&self) -> String {
        format!("ssh -p {} root@127.0.0.1", self.ssh_tunnel.local)
    }
}
