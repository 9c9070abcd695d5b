//! Shared fixtures for vmlaunch tests: a fake clock, a scripted port probe,
//! and helpers that lay out project directories, archives and stand-in
//! executables in a temp dir.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use vmlaunch::clock::Clock;
use vmlaunch::options::{LauncherOptions, PollOptions, PortForward};
use vmlaunch::readiness::PortProbe;
use vmlaunch::LaunchEvent;

// ============================================================================
// Time
// ============================================================================

/// Clock that returns immediately and remembers every requested sleep.
#[derive(Debug, Default)]
pub struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        // let spawned children make progress between polls
        tokio::task::yield_now().await;
    }
}

/// Clock that really sleeps, but for a fixed short time regardless of the
/// requested duration. For tests that need a child process to get
/// somewhere between polls.
#[derive(Debug)]
pub struct ScaledClock {
    tick: Duration,
    sleeps: AtomicUsize,
}

impl ScaledClock {
    pub fn new(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            tick,
            sleeps: AtomicUsize::new(0),
        })
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Clock for ScaledClock {
    async fn sleep(&self, _duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.tick).await;
    }
}

// ============================================================================
// Probing
// ============================================================================

/// Port probe that fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct ScriptedProbe {
    succeed_after: Option<usize>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    /// Succeeds on probe number `failures + 1`.
    pub fn ready_after(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            succeed_after: Some(failures),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn always() -> Arc<Self> {
        Self::ready_after(0)
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            succeed_after: None,
            probes: AtomicUsize::new(0),
        })
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for ScriptedProbe {
    async fn probe(&self, _target: &str, _timeout: Duration) -> bool {
        let previous = self.probes.fetch_add(1, Ordering::SeqCst);
        matches!(self.succeed_after, Some(n) if previous >= n)
    }
}

// ============================================================================
// Filesystem fixtures
// ============================================================================

pub fn write_executable(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script parent");
    }
    fs::write(path, body).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
}

/// Build a zstd-compressed tar at `archive` holding `files` under
/// `top_dir/`.
pub fn write_tar_zst(archive: &Path, top_dir: &str, files: &[(&str, &[u8], u32)]) {
    let out = fs::File::create(archive).expect("create archive");
    let encoder = zstd::stream::Encoder::new(out, 3).expect("zstd encoder");
    let mut builder = tar::Builder::new(encoder);

    let mut dir_header = tar::Header::new_gnu();
    dir_header.set_entry_type(tar::EntryType::Directory);
    dir_header.set_mode(0o755);
    dir_header.set_size(0);
    dir_header.set_cksum();
    builder
        .append_data(&mut dir_header, format!("{top_dir}/"), std::io::empty())
        .expect("append dir");

    for (name, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{top_dir}/{name}"), *data)
            .expect("append file");
    }

    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish zstd");
}

/// Split `archive` into `parts` roughly equal fragments named
/// `<archive>.part_aa`, `.part_ab`, ... and remove the original. Returns
/// the fragment paths in name order.
pub fn split_into_fragments(archive: &Path, parts: usize) -> Vec<PathBuf> {
    let data = fs::read(archive).expect("read archive");
    let chunk = data.len().div_ceil(parts.max(1)).max(1);
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .expect("archive name");

    let fragments: Vec<PathBuf> = data
        .chunks(chunk)
        .enumerate()
        .map(|(i, bytes)| {
            let suffix = format!(
                "{}{}",
                (b'a' + (i / 26) as u8) as char,
                (b'a' + (i % 26) as u8) as char
            );
            let path = archive.with_file_name(format!("{name}.part_{suffix}"));
            fs::write(&path, bytes).expect("write fragment");
            path
        })
        .collect();

    fs::remove_file(archive).expect("remove archive");
    fragments
}

// ============================================================================
// Process inspection
// ============================================================================

/// Whether `pid` is running. Zombies waiting for a reaper count as gone.
pub fn is_running(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // State is the first field after the parenthesised command name
    match stat.rsplit_once(')') {
        Some((_, rest)) => !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')),
        None => false,
    }
}

/// Poll until `pid` stops running. Returns whether it did within `timeout`.
pub fn wait_until_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    !is_running(pid)
}

/// Poll until a script has written its PID file, then parse it.
pub fn wait_for_pid_file(path: &Path, timeout: Duration) -> u32 {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            return pid;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "{} was never written",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// A temp workspace with a project directory layout and options pointing
/// into it.
pub struct LaunchFixture {
    pub temp: TempDir,
    pub options: LauncherOptions,
}

impl LaunchFixture {
    /// Nothing on disk yet; tunnel tool is a stand-in that sleeps.
    pub fn new() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let root = temp.path();
        let tool = root.join("bin").join("fake-iproxy");
        write_executable(&tool, "#!/bin/sh\nexec sleep 300\n");

        let options = LauncherOptions {
            project_dir: root.join("vm"),
            tunnel_tool: tool.to_string_lossy().into_owned(),
            ssh_target: "127.0.0.1:1".to_string(),
            poll: PollOptions {
                interval_secs: 5,
                ceiling_secs: 180,
                connect_timeout_secs: 1,
            },
            ssh_tunnel: PortForward::symmetric(22222),
            vnc_tunnel: PortForward::symmetric(5901),
            shutdown_grace_secs: 2,
            ..Default::default()
        };

        Self { temp, options }
    }

    /// Create the project directory with `boot.sh` running `body`.
    pub fn with_boot_script(self, body: &str) -> Self {
        write_executable(&self.boot_script(), &format!("#!/bin/sh\n{body}\n"));
        self
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn home(&self) -> PathBuf {
        let home = self.root().join("home");
        fs::create_dir_all(&home).expect("create home");
        home
    }

    pub fn project_dir(&self) -> &Path {
        &self.options.project_dir
    }

    pub fn boot_script(&self) -> PathBuf {
        self.options.boot_script_path()
    }

    pub fn archive(&self) -> PathBuf {
        self.options.archive_path()
    }

    /// Write `vm.tar.zst` containing an executable `boot.sh` with `body`.
    pub fn with_archive(self, body: &str) -> Self {
        let script = format!("#!/bin/sh\n{body}\n");
        write_tar_zst(
            &self.archive(),
            "vm",
            &[("boot.sh", script.as_bytes(), 0o755)],
        );
        self
    }
}

impl Default for LaunchFixture {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Collects launch events for later assertions.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LaunchEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer closure to hand to `Launcher::with_observer`.
    pub fn observer(&self) -> impl Fn(&LaunchEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&LaunchEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}
