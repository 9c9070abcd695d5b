//! End-to-end launch scenarios with real child processes, a scripted port
//! probe and a fake clock.
//!
//! The boot script and tunnel tool are small shell scripts written into a
//! temp dir, so these tests need only `/bin/sh` and `sleep`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use vmlaunch::archive::PrepareOutcome;
use vmlaunch::lifecycle::{LaunchLock, ProcessRole, RunState, RunStateFile};
use vmlaunch::{LaunchEvent, LaunchOutcome, Launcher, LauncherError};
use vmlaunch_shared::constants::home;
use vmlaunch_test_utils::{
    EventLog, FakeClock, LaunchFixture, ScaledClock, ScriptedProbe, wait_for_pid_file,
    wait_until_gone,
};

/// Observer that records events and cancels the launch once it is fully up.
fn cancel_when_running(
    log: &EventLog,
    cancel: &CancellationToken,
) -> impl Fn(&LaunchEvent) + Send + Sync + 'static {
    let record = log.observer();
    let cancel = cancel.clone();
    move |event| {
        record(event);
        if matches!(event, LaunchEvent::Running { .. }) {
            cancel.cancel();
        }
    }
}

fn roles_started(log: &EventLog) -> Vec<ProcessRole> {
    log.events()
        .iter()
        .filter_map(|e| match e {
            LaunchEvent::BootStarted { .. } => Some(ProcessRole::Boot),
            LaunchEvent::TunnelStarted { role, .. } => Some(*role),
            _ => None,
        })
        .collect()
}

fn stopped_report(log: &EventLog) -> vmlaunch::lifecycle::ShutdownReport {
    log.events()
        .into_iter()
        .find_map(|e| match e {
            LaunchEvent::Stopped(report) => Some(report),
            _ => None,
        })
        .expect("no Stopped event")
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn ready_vm_gets_both_tunnels_and_stops_on_cancel() {
    let fixture = LaunchFixture::new().with_boot_script("exec sleep 30");
    let home_dir = fixture.home();
    let state_file = RunStateFile::new(home_dir.join(home::STATE_FILE));

    let log = EventLog::new();
    let cancel = CancellationToken::new();

    // Capture the run state as another invocation would see it
    let seen: Arc<Mutex<Option<RunState>>> = Arc::default();
    let observer = {
        let inner = cancel_when_running(&log, &cancel);
        let seen = Arc::clone(&seen);
        let state_file = state_file.clone();
        move |event: &LaunchEvent| {
            if matches!(event, LaunchEvent::Running { .. }) {
                *seen.lock() = state_file.read().unwrap();
            }
            inner(event);
        }
    };

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(FakeClock::new())
        .with_probe(ScriptedProbe::ready_after(2))
        .with_observer(observer)
        .with_home(&home_dir);

    let outcome = launcher.run(cancel).await.unwrap();
    assert_eq!(outcome, LaunchOutcome::Interrupted);
    assert_eq!(outcome.exit_code(), 0);

    assert_eq!(
        roles_started(&log),
        vec![ProcessRole::Boot, ProcessRole::SshTunnel, ProcessRole::VncTunnel]
    );
    assert!(log.events().contains(&LaunchEvent::VmReady {
        elapsed: Duration::from_secs(10)
    }));
    assert_eq!(log.count(|e| matches!(e, LaunchEvent::VmNotReady { .. })), 0);
    assert!(log.events().contains(&LaunchEvent::Running {
        vnc_url: "vnc://127.0.0.1:5901".into(),
        ssh_command: "ssh -p 22222 root@127.0.0.1".into(),
    }));

    let state = seen.lock().clone().expect("run state was not written");
    assert_eq!(state.launcher_pid, std::process::id());
    assert_eq!(state.processes.len(), 3);

    let report = stopped_report(&log);
    assert_eq!(report.terminated.len(), 3);
    // Boot first, tunnels after
    assert_eq!(report.terminated[0].role, ProcessRole::Boot);

    assert!(state_file.read().unwrap().is_none(), "run state left behind");
}

#[tokio::test]
async fn archive_is_prepared_before_boot() {
    let fixture = LaunchFixture::new().with_archive("exec sleep 30");
    let log = EventLog::new();
    let cancel = CancellationToken::new();

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(FakeClock::new())
        .with_probe(ScriptedProbe::always())
        .with_observer(cancel_when_running(&log, &cancel));

    let outcome = launcher.run(cancel).await.unwrap();
    assert_eq!(outcome, LaunchOutcome::Interrupted);

    let events = log.events();
    let prepared = events
        .iter()
        .position(|e| {
            matches!(
                e,
                LaunchEvent::ArchivePrepared(PrepareOutcome::Extracted {
                    archive_removed: true,
                    ..
                })
            )
        })
        .expect("archive was not extracted");
    let booted = events
        .iter()
        .position(|e| matches!(e, LaunchEvent::BootStarted { .. }))
        .expect("boot did not start");
    assert!(prepared < booted);
    assert!(!fixture.archive().exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn shutdown_reaches_processes_the_boot_script_backgrounds() {
    let fixture = LaunchFixture::new();
    let pid_file = fixture.project_dir().join("background.pid");
    let fixture = fixture.with_boot_script(&format!(
        "sleep 300 &\necho $! > {}\nwait",
        pid_file.display()
    ));
    let log = EventLog::new();
    let cancel = CancellationToken::new();

    let observer = {
        let inner = cancel_when_running(&log, &cancel);
        let pid_file = pid_file.clone();
        move |event: &LaunchEvent| {
            if matches!(event, LaunchEvent::Running { .. }) {
                wait_for_pid_file(&pid_file, Duration::from_secs(5));
            }
            inner(event);
        }
    };

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(FakeClock::new())
        .with_probe(ScriptedProbe::always())
        .with_observer(observer);

    let outcome = launcher.run(cancel).await.unwrap();
    assert_eq!(outcome, LaunchOutcome::Interrupted);

    let background = wait_for_pid_file(&pid_file, Duration::ZERO);
    assert!(
        wait_until_gone(background, Duration::from_secs(5)),
        "background pid {background} outlived the launch"
    );
    assert!(stopped_report(&log).terminated[0].process_group);
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn missing_input_fails_before_spawning_anything() {
    let fixture = LaunchFixture::new();
    let log = EventLog::new();

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(FakeClock::new())
        .with_probe(ScriptedProbe::always())
        .with_observer(log.observer())
        .with_home(fixture.home());

    let err = launcher.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LauncherError::MissingInput(_)), "got {err:?}");

    assert!(roles_started(&log).is_empty());
    assert_eq!(log.count(|e| matches!(e, LaunchEvent::Stopped(_))), 0);
    assert!(!fixture.project_dir().exists());
}

#[tokio::test]
async fn missing_tunnel_tool_fails_before_touching_the_archive() {
    let mut fixture = LaunchFixture::new().with_archive("exit 0");
    fixture.options.tunnel_tool = "no-such-forwarder-zz".into();

    let err = Launcher::new(fixture.options.clone())
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LauncherError::MissingPrerequisite(missing) => {
            assert_eq!(missing, vec!["no-such-forwarder-zz".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fixture.archive().exists());
    assert!(!fixture.project_dir().exists());
}

#[tokio::test]
async fn boot_exiting_early_fails_without_tunnels() {
    let fixture = LaunchFixture::new().with_boot_script("exit 3");
    let log = EventLog::new();

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(ScaledClock::new(Duration::from_millis(20)))
        .with_probe(ScriptedProbe::never())
        .with_observer(log.observer());

    let err = launcher.run(CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(
            err,
            LauncherError::BootExited {
                code: Some(3),
                signal: None
            }
        ),
        "got {err:?}"
    );

    assert_eq!(roles_started(&log), vec![ProcessRole::Boot]);
    assert_eq!(log.count(|e| matches!(e, LaunchEvent::Running { .. })), 0);
    // Already gone, so shutdown had nothing to signal
    assert!(stopped_report(&log).is_empty());
}

#[tokio::test]
async fn unready_vm_still_gets_tunnels_and_boot_exit_code_is_returned() {
    let fixture = LaunchFixture::new().with_boot_script("sleep 2\nexit 7");
    let clock = FakeClock::new();
    let log = EventLog::new();

    let launcher = Launcher::new(fixture.options.clone())
        .with_clock(clock.clone())
        .with_probe(ScriptedProbe::never())
        .with_observer(log.observer());

    let outcome = launcher.run(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        LaunchOutcome::BootExited(vmlaunch::lifecycle::ExitInfo {
            code: Some(7),
            signal: None
        })
    );
    assert_eq!(outcome.exit_code(), 7);

    assert_eq!(log.count(|e| matches!(e, LaunchEvent::WaitingForVm { .. })), 36);
    assert!(log.events().contains(&LaunchEvent::VmNotReady {
        ceiling: Duration::from_secs(180)
    }));
    assert_eq!(
        roles_started(&log),
        vec![ProcessRole::Boot, ProcessRole::SshTunnel, ProcessRole::VncTunnel]
    );

    // Tunnels were still up when the boot process ended
    let report = stopped_report(&log);
    let roles: Vec<_> = report.terminated.iter().map(|r| r.role).collect();
    assert_eq!(roles, vec![ProcessRole::SshTunnel, ProcessRole::VncTunnel]);
}

#[tokio::test]
async fn second_launch_on_same_home_is_refused() {
    let fixture = LaunchFixture::new().with_boot_script("exec sleep 30");
    let home_dir = fixture.home();
    let _held = LaunchLock::acquire(&home_dir).unwrap();
    let log = EventLog::new();

    let err = Launcher::new(fixture.options.clone())
        .with_observer(log.observer())
        .with_home(&home_dir)
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LauncherError::Storage(_)), "got {err:?}");
    assert!(err.to_string().contains("already running"));
    assert!(roles_started(&log).is_empty());
}

#[tokio::test]
async fn invalid_options_are_rejected_up_front() {
    let mut fixture = LaunchFixture::new().with_boot_script("exit 0");
    fixture.options.poll.interval_secs = 0;

    let err = Launcher::new(fixture.options.clone())
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::Config(_)));
}

#[test]
fn prepare_only_runs_the_archive_stage() {
    let fixture = LaunchFixture::new().with_archive("exit 0");
    let log = EventLog::new();

    let launcher = Launcher::new(fixture.options.clone()).with_observer(log.observer());
    assert!(matches!(
        launcher.prepare().unwrap(),
        PrepareOutcome::Extracted { .. }
    ));
    assert_eq!(launcher.prepare().unwrap(), PrepareOutcome::AlreadyPresent);

    assert!(fixture.boot_script().exists());
    assert!(roles_started(&log).is_empty());
    assert_eq!(log.count(|e| matches!(e, LaunchEvent::ArchivePrepared(_))), 2);
}
