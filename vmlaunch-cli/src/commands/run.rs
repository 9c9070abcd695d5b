use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use vmlaunch::archive::PrepareOutcome;
use vmlaunch::lifecycle::ProcessRole;
use vmlaunch::{LaunchEvent, Launcher};

use crate::cli::{GlobalFlags, RunArgs};

const STAGES: usize = 5;

pub async fn execute(args: RunArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let mut options = global.load_options(&args.launch)?;
    if !args.boot_args.is_empty() {
        options.boot_args = args.boot_args;
    }

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let launcher = Launcher::new(options)
        .with_home(global.home_dir())
        .with_observer(print_event);

    let outcome = launcher.run(cancel).await?;
    Ok(outcome.exit_code())
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
///
/// The handlers stay installed for the whole run, so later signals must be
/// drained here or they would vanish without a trace while shutdown runs.
fn cancel_on_signal(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            on_signal(name, &cancel);
        }
    });
    Ok(())
}

/// Returns whether this signal started the shutdown.
fn on_signal(name: &'static str, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        tracing::warn!(signal = name, "Shutdown already in progress, waiting for children to stop");
        return false;
    }
    tracing::info!(signal = name, "Received signal, shutting down");
    cancel.cancel();
    true
}

fn step(n: usize, message: impl std::fmt::Display) {
    println!("[{}/{}] {}", n, STAGES, message);
}

fn print_event(event: &LaunchEvent) {
    match event {
        LaunchEvent::PrerequisitesChecked(report) => {
            let tools: Vec<_> = report.tools.iter().map(|t| t.name.as_str()).collect();
            step(1, format!("Host tools found: {}", tools.join(", ")));
        }
        LaunchEvent::ArchivePrepared(PrepareOutcome::AlreadyPresent) => {
            step(2, "VM image already unpacked");
        }
        LaunchEvent::ArchivePrepared(PrepareOutcome::Extracted {
            fragments_merged,
            entries,
            ..
        }) => {
            if *fragments_merged > 0 {
                step(
                    2,
                    format!(
                        "Merged {} fragments and unpacked {} entries",
                        fragments_merged, entries
                    ),
                );
            } else {
                step(2, format!("Unpacked {} entries", entries));
            }
        }
        LaunchEvent::BootStarted { pid } => step(3, format!("Booting VM (pid {})", pid)),
        LaunchEvent::WaitingForVm { elapsed, ceiling } => {
            println!(
                "      waiting for VM... {}s/{}s",
                elapsed.as_secs(),
                ceiling.as_secs()
            );
        }
        LaunchEvent::VmReady { elapsed } => {
            step(4, format!("VM is up after {}s", elapsed.as_secs()));
        }
        LaunchEvent::VmNotReady { ceiling } => {
            eprintln!(
                "Warning: VM did not answer within {}s, starting tunnels anyway",
                ceiling.as_secs()
            );
        }
        LaunchEvent::TunnelStarted { role, pid, forward } => {
            let name = match role {
                ProcessRole::SshTunnel => "SSH",
                ProcessRole::VncTunnel => "VNC",
                ProcessRole::Boot => "boot",
            };
            step(
                5,
                format!(
                    "{} tunnel localhost:{} -> device:{} (pid {})",
                    name, forward.local, forward.device, pid
                ),
            );
        }
        LaunchEvent::Running {
            vnc_url,
            ssh_command,
        } => {
            println!();
            println!("VM is running.");
            println!("  VNC: {}", vnc_url);
            println!("  SSH: {}", ssh_command);
            println!("Press Ctrl+C to stop.");
        }
        LaunchEvent::ShuttingDown => println!("Shutting down..."),
        LaunchEvent::Stopped(report) => {
            if !report.killed.is_empty() {
                let killed: Vec<_> = report.killed.iter().map(|r| r.role.as_str()).collect();
                eprintln!("Warning: force-killed {}", killed.join(", "));
            }
            println!("Stopped.");
        }
    }
}
