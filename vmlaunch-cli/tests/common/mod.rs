#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vmlaunch_test_utils::LaunchFixture;

/// A temp workspace (image layout, fake tunnel tool) plus an isolated home
/// directory for the binary under test.
pub struct TestContext {
    pub fixture: LaunchFixture,
    pub home: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        Self::from_fixture(LaunchFixture::new())
    }

    pub fn from_fixture(fixture: LaunchFixture) -> Self {
        let home = fixture.home();
        Self { fixture, home }
    }

    pub fn bin_path() -> &'static str {
        env!("CARGO_BIN_EXE_vmlaunch")
    }

    /// `vmlaunch --home <home>` with the environment scrubbed.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = Command::new(Self::bin_path());
        cmd.timeout(Duration::from_secs(60));
        cmd.env_remove("VMLAUNCH_HOME")
            .env_remove("VMLAUNCH_CONFIG")
            .env_remove("RUST_LOG");
        cmd.arg("--home").arg(&self.home);
        cmd
    }

    /// Flags pointing a launch at the fixture layout.
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--project-dir".into(),
            path_arg(self.fixture.project_dir()),
            "--tunnel-tool".into(),
            self.fixture.options.tunnel_tool.clone(),
        ]
    }

    pub fn state_file(&self) -> PathBuf {
        self.home.join("launcher.json")
    }
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
