use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use vmlaunch::clock::TokioClock;
use vmlaunch::lifecycle::{LaunchLock, LifecycleController, RunState, RunStateFile, TrackedProcess};
use vmlaunch::util::{is_own_group_leader, is_process_alive, signal_process};
use vmlaunch_shared::constants::home;

use crate::cli::{GlobalFlags, LaunchFlags};

/// How long to wait for a signalled launcher to finish its own shutdown.
const LAUNCHER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn execute(global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options(&LaunchFlags::default())?;
    let home_dir = global.home_dir();
    let file = RunStateFile::new(home_dir.join(home::STATE_FILE));

    let Some(state) = file.read()? else {
        println!("No launch is running");
        return Ok(());
    };

    // A running launcher holds the lock for its whole lifetime, so a free
    // lock means the recorded launcher PID is stale and must not be signalled
    match LaunchLock::try_acquire(&home_dir)? {
        None => stop_launcher(state.launcher_pid).await,
        Some(_lock) => stop_leftovers(&file, &state, options.shutdown_grace()).await,
    }
}

/// Ask the live launcher to run its own shutdown and wait for it to exit.
async fn stop_launcher(launcher_pid: u32) -> anyhow::Result<()> {
    if launcher_pid == std::process::id() || !is_process_alive(launcher_pid) {
        anyhow::bail!(
            "a launch holds the lock, but the recorded launcher (pid {}) is not running",
            launcher_pid
        );
    }

    signal_process(launcher_pid, Signal::SIGTERM);
    println!("Sent SIGTERM to launcher (pid {})", launcher_pid);

    let deadline = tokio::time::Instant::now() + LAUNCHER_EXIT_TIMEOUT;
    while is_process_alive(launcher_pid) {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "launcher (pid {}) still running after {}s",
                launcher_pid,
                LAUNCHER_EXIT_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Stopped");
    Ok(())
}

/// Stop processes a dead launcher left behind.
///
/// Only records that still identify the process group the launch created
/// are signalled. A PID the kernel has since handed to something else is
/// skipped.
async fn stop_leftovers(
    file: &RunStateFile,
    state: &RunState,
    grace: Duration,
) -> anyhow::Result<()> {
    tracing::info!(
        launcher_pid = state.launcher_pid,
        "Launcher is gone, stopping recorded processes directly"
    );

    let mut controller = LifecycleController::new(Arc::new(TokioClock), grace);
    for record in &state.processes {
        if !record.process_group || !is_own_group_leader(record.pid) {
            tracing::warn!(
                role = %record.role,
                pid = record.pid,
                "Recorded process no longer belongs to this launch, leaving it alone"
            );
            println!(
                "Skipped {} (pid {}): not started by this launch",
                record.role, record.pid
            );
            continue;
        }
        controller.track(TrackedProcess::from_pid(record.role, record.pid).group_leader())?;
    }

    let report = controller.shutdown().await;
    file.remove();

    for record in &report.terminated {
        println!("Stopped {} (pid {})", record.role, record.pid);
    }
    if !report.killed.is_empty() {
        let killed: Vec<_> = report.killed.iter().map(|r| r.role.as_str()).collect();
        eprintln!("Warning: force-killed {}", killed.join(", "));
    }
    if report.terminated.is_empty() {
        println!("Removed stale run state");
    }
    Ok(())
}
