//! Run-state file: who is running, so `vmlaunch stop` and `status` can find
//! a launch from another terminal.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use super::process::ProcessRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// PID of the supervising launcher itself.
    pub launcher_pid: u32,
    pub project_dir: PathBuf,
    #[serde(default)]
    pub processes: Vec<ProcessRecord>,
}

#[derive(Debug, Clone)]
pub struct RunStateFile {
    path: PathBuf,
}

impl RunStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents. Written to a sibling temp file first and
    /// renamed, so readers never see a torn write.
    pub fn write(&self, state: &RunState) -> LauncherResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LauncherError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| LauncherError::Internal(format!("Failed to serialize run state: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| {
            LauncherError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            LauncherError::Storage(format!(
                "Failed to move run state into {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// `Ok(None)` when no launch has recorded itself.
    pub fn read(&self) -> LauncherResult<Option<RunState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LauncherError::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            LauncherError::Storage(format!(
                "Invalid run state in {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove run state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ProcessRole;
    use tempfile::TempDir;

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let file = RunStateFile::new(dir.path().join("nested/launcher.json"));
        let state = RunState {
            launcher_pid: 10,
            project_dir: PathBuf::from("vm"),
            processes: vec![
                ProcessRecord {
                    role: ProcessRole::Boot,
                    pid: 11,
                    process_group: true,
                },
                ProcessRecord {
                    role: ProcessRole::SshTunnel,
                    pid: 12,
                    process_group: true,
                },
            ],
        };

        file.write(&state).unwrap();
        assert_eq!(file.read().unwrap(), Some(state));
        assert!(!file.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_reads_none_and_removes_quietly() {
        let dir = TempDir::new().unwrap();
        let file = RunStateFile::new(dir.path().join("launcher.json"));
        assert_eq!(file.read().unwrap(), None);
        file.remove();
    }

    #[test]
    fn garbage_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("launcher.json");
        fs::write(&path, "{not json").unwrap();
        let err = RunStateFile::new(path).read().unwrap_err();
        assert!(matches!(err, LauncherError::Storage(_)));
    }
}
