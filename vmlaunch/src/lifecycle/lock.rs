//! Single-launch lock.
//!
//! Two launchers sharing a home directory would fight over the same tunnel
//! ports and run-state file, so a launch holds an exclusive `flock` on
//! `<home>/.lock` for its whole lifetime.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use vmlaunch_shared::constants::home;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

/// Held for the lifetime of a launch. Released on drop, or by the OS when
/// the process dies.
#[derive(Debug)]
pub struct LaunchLock {
    file: File,
    path: PathBuf,
}

impl LaunchLock {
    /// Attempt to acquire the lock without blocking.
    ///
    /// # Returns
    /// * `Ok(LaunchLock)` - Lock acquired
    /// * `Err(...)` - Another launch holds it, or the file could not be opened
    pub fn acquire(home_dir: &Path) -> LauncherResult<Self> {
        Self::try_acquire(home_dir)?.ok_or_else(|| {
            LauncherError::Storage(format!(
                "Another launch is already running with home directory: {}\n\
                 Stop it first with `vmlaunch stop`.",
                home_dir.display()
            ))
        })
    }

    /// Like [`acquire`](Self::acquire), but a lock held by a live launch is
    /// reported as `Ok(None)` instead of an error.
    pub fn try_acquire(home_dir: &Path) -> LauncherResult<Option<Self>> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| LauncherError::Storage(format!("failed to create home dir: {}", e)))?;

        let lock_path = home_dir.join(home::LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| LauncherError::Storage(format!("failed to open lock file: {}", e)))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(LauncherError::Storage(format!(
                "failed to acquire lock: {}",
                err
            )));
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired launch lock");

        Ok(Some(Self {
            file,
            path: lock_path,
        }))
    }
}

impl Drop for LaunchLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock_path = %self.path.display(), "Released launch lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_file_location() {
        let temp_dir = TempDir::new().unwrap();
        let _lock = LaunchLock::acquire(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join(".lock").is_file());
    }

    #[test]
    fn test_lock_prevents_second_launch() {
        let temp_dir = TempDir::new().unwrap();
        let _first = LaunchLock::acquire(temp_dir.path()).unwrap();

        let err = LaunchLock::acquire(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("Another launch"));
    }

    #[test]
    fn test_try_acquire_reports_held_lock() {
        let temp_dir = TempDir::new().unwrap();
        let first = LaunchLock::try_acquire(temp_dir.path()).unwrap();
        assert!(first.is_some());
        assert!(LaunchLock::try_acquire(temp_dir.path()).unwrap().is_none());

        drop(first);
        assert!(LaunchLock::try_acquire(temp_dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        {
            let _lock = LaunchLock::acquire(temp_dir.path()).unwrap();
        }
        let _again = LaunchLock::acquire(temp_dir.path()).unwrap();
    }

    #[test]
    fn test_lock_creates_missing_home() {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path().join("a/b");
        let _lock = LaunchLock::acquire(&home).unwrap();
        assert!(home.join(".lock").exists());
    }
}
