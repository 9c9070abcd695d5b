//! Subprocess spawning for the VM boot entry point.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::lifecycle::{ProcessRole, TrackedProcess};
use crate::options::LauncherOptions;
use crate::util::is_executable;

/// Starts the boot script. The script runs until the VM shuts down and
/// exits non-zero on failure; its output is passed straight through.
pub struct VmLauncher {
    project_dir: PathBuf,
    script: PathBuf,
    args: Vec<String>,
}

impl VmLauncher {
    pub fn new(project_dir: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            script: script.into(),
            args: Vec::new(),
        }
    }

    pub fn from_options(options: &LauncherOptions) -> Self {
        Self::new(&options.project_dir, &options.boot_script).with_args(options.boot_args.clone())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn script_path(&self) -> PathBuf {
        self.project_dir.join(&self.script)
    }

    /// Fail with `MissingInput` unless the boot script exists and is
    /// executable.
    pub fn verify(&self) -> LauncherResult<()> {
        let script = self.script_path();
        if !script.exists() {
            return Err(LauncherError::MissingInput(format!(
                "boot script {} not found",
                script.display()
            )));
        }
        if !is_executable(&script) {
            return Err(LauncherError::MissingInput(format!(
                "boot script {} is not executable",
                script.display()
            )));
        }
        Ok(())
    }

    /// Spawn the boot script from inside the project directory and return
    /// immediately.
    pub fn spawn(&self) -> LauncherResult<TrackedProcess> {
        self.verify()?;

        let mut cmd = Command::new(absolute(&self.script_path()));
        cmd.args(&self.args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            // Own process group: terminal Ctrl+C reaches only the launcher,
            // and shutdown signals the whole group, background jobs included
            .process_group(0);

        let spawn_start = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            let err_msg = format!(
                "Failed to spawn boot script {}: {}",
                self.script_path().display(),
                e
            );
            tracing::error!("{}", err_msg);
            LauncherError::Spawn(err_msg)
        })?;

        let process = TrackedProcess::from_child(ProcessRole::Boot, child)?.group_leader();
        tracing::info!(
            pid = process.pid(),
            script = %self.script_path().display(),
            spawn_duration_ms = spawn_start.elapsed().as_millis(),
            "Boot process spawned"
        );
        Ok(process)
    }
}

/// `current_dir` applies before exec, so a relative program path would be
/// resolved twice.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str, mode: u32) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn verify_reports_missing_and_non_executable() {
        let dir = TempDir::new().unwrap();
        let launcher = VmLauncher::new(dir.path(), "boot.sh");
        assert!(matches!(
            launcher.verify(),
            Err(LauncherError::MissingInput(_))
        ));

        write_script(dir.path(), "boot.sh", "#!/bin/sh\n", 0o644);
        let err = launcher.verify().unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[tokio::test]
    async fn spawn_runs_in_project_dir_with_args() {
        let dir = TempDir::new().unwrap();
        write_script(
            dir.path(),
            "boot.sh",
            "#!/bin/sh\n[ -f ./marker ] || exit 10\n[ \"$1\" = \"--headless\" ] || exit 11\nexit 0\n",
            0o755,
        );
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let launcher =
            VmLauncher::new(dir.path(), "boot.sh").with_args(vec!["--headless".to_string()]);
        let mut process = launcher.spawn().unwrap();
        assert_eq!(process.role(), ProcessRole::Boot);

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    }
}
