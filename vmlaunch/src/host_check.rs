//! Host prerequisite detection.
//!
//! Runs before anything touches the filesystem or spawns a process, and
//! reports every missing tool at once rather than the first one found.
//! Decompression happens in-process, so the only external tool a launch
//! needs up front is the port forwarder.

use std::path::PathBuf;

use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::options::LauncherOptions;
use crate::util::find_binary;

/// One required external tool and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCheck {
    pub name: String,
    pub purpose: &'static str,
    pub path: Option<PathBuf>,
}

impl ToolCheck {
    pub fn found(&self) -> bool {
        self.path.is_some()
    }
}

/// Result of checking every prerequisite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub tools: Vec<ToolCheck>,
}

impl HostReport {
    pub fn missing(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| !t.found())
            .map(|t| t.name.clone())
            .collect()
    }

    /// Turn the report into an error listing every missing tool.
    pub fn into_result(self) -> LauncherResult<Self> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(self)
        } else {
            Err(LauncherError::MissingPrerequisite(missing))
        }
    }
}

fn required_tools(options: &LauncherOptions) -> Vec<(String, &'static str)> {
    vec![(options.tunnel_tool.clone(), "port forwarding (SSH and VNC tunnels)")]
}

/// Look up every required tool without failing.
pub fn inspect_host(options: &LauncherOptions) -> HostReport {
    let tools = required_tools(options)
        .into_iter()
        .map(|(name, purpose)| {
            let path = find_binary(&name).ok();
            if path.is_none() {
                tracing::debug!(tool = %name, "Required tool not found");
            }
            ToolCheck {
                name,
                purpose,
                path,
            }
        })
        .collect();

    HostReport { tools }
}

/// Fail with [`LauncherError::MissingPrerequisite`] unless every required
/// tool is available.
pub fn check_prerequisites(options: &LauncherOptions) -> LauncherResult<HostReport> {
    inspect_host(options).into_result()
}
