//! PID-level helpers for processes we do not hold a `Child` handle for.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpgid, getpgrp};

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`, which delivers no signal. `EPERM` means the process
/// exists but belongs to someone else, so it still counts as alive.
///
/// # Returns
/// * `true` - Process exists (zombies included)
/// * `false` - Process does not exist
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `signal` to `pid`.
///
/// # Returns
/// * `true` - Signal was delivered, or the process is already gone
/// * `false` - Delivery failed for another reason (permission denied)
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(e) => {
            tracing::warn!(pid, %signal, error = %e, "Failed to signal process");
            false
        }
    }
}

/// Group IDs we must never signal as a whole: init's and our own.
fn is_protected_group(pgid: u32) -> bool {
    pgid <= 1 || pgid > i32::MAX as u32 || pgid as i32 == getpgrp().as_raw()
}

/// Check if any process in group `pgid` exists, zombies included.
pub fn is_group_alive(pgid: u32) -> bool {
    if is_protected_group(pgid) {
        return false;
    }

    match kill(Pid::from_raw(-(pgid as i32)), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `signal` to every process in group `pgid`.
///
/// # Returns
/// * `true` - Signal was delivered, or the group is already empty
/// * `false` - The group is protected or delivery failed
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    if is_protected_group(pgid) {
        tracing::warn!(pgid, %signal, "Refusing to signal protected process group");
        return false;
    }

    match kill(Pid::from_raw(-(pgid as i32)), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(e) => {
            tracing::warn!(pgid, %signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// Process group of `pid`, `None` if the process does not exist.
pub fn process_group_of(pid: u32) -> Option<u32> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    getpgid(Some(Pid::from_raw(pid as i32)))
        .ok()
        .map(|pgid| pgid.as_raw() as u32)
}

/// Whether `pid` still identifies a process group a launch created.
///
/// Every supervised child is spawned as the leader of its own group, so a
/// recorded PID is trusted only while it still leads a group of the same
/// ID, or, once the leader is gone, while that group still has members.
/// A recycled PID that landed in some other group is rejected.
pub fn is_own_group_leader(pid: u32) -> bool {
    if is_protected_group(pid) {
        return false;
    }
    match process_group_of(pid) {
        Some(pgid) => pgid == pid,
        None => is_group_alive(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        // 0 and values past i32::MAX have special meaning for kill()
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_signal_process_gone_is_ok() {
        assert!(signal_process(999999999, Signal::SIGTERM));
    }

    #[test]
    fn test_signal_process_rejects_group_pids() {
        assert!(!signal_process(0, Signal::SIGTERM));
        assert!(!signal_process(u32::MAX, Signal::SIGKILL));
    }

    #[test]
    fn test_own_group_is_protected() {
        let own = getpgrp().as_raw() as u32;
        assert!(!is_group_alive(own));
        assert!(!signal_group(own, Signal::SIGTERM));
        assert!(!signal_group(1, Signal::SIGTERM));
    }

    #[test]
    fn test_group_leader_detection() {
        use std::os::unix::process::CommandExt;

        let mut leader = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let mut member = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        assert_eq!(process_group_of(leader.id()), Some(leader.id()));
        assert!(is_own_group_leader(leader.id()));
        assert!(is_group_alive(leader.id()));
        // Inherited our group, so it leads nothing
        assert!(!is_own_group_leader(member.id()));

        assert!(signal_group(leader.id(), Signal::SIGKILL));
        leader.wait().unwrap();
        assert!(!is_group_alive(leader.id()));

        member.kill().unwrap();
        member.wait().unwrap();
        assert!(!is_own_group_leader(member.id()));
    }
}
