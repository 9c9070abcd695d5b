//! Error taxonomy for the launcher.
//!
//! Variants follow how a failure is handled rather than where it happened:
//! everything except [`LauncherError::BootExited`] aborts before or during
//! setup, while `BootExited` is raised by the readiness poller once the VM
//! is already running.

use thiserror::Error;

/// Result alias used across the workspace.
pub type LauncherResult<T> = Result<T, LauncherError>;

#[derive(Debug, Error)]
pub enum LauncherError {
    /// One or more external tools could not be found.
    #[error("missing prerequisites: {}", .0.join(", "))]
    MissingPrerequisite(Vec<String>),

    /// Neither the project directory nor an archive to build it from exists.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Merging, decompressing or unpacking the image archive failed.
    #[error("extraction failed: {0}")]
    Extract(String),

    /// A child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The boot process exited while we were still waiting for the VM.
    #[error("boot process exited prematurely ({})", describe_exit(*.code, *.signal))]
    BootExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// Invalid options or configuration file.
    #[error("config: {0}")]
    Config(String),

    /// Run-state or lock file problems.
    #[error("storage: {0}")]
    Storage(String),

    /// The archive uses a format we cannot decode.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal: {0}")]
    Internal(String),
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}
