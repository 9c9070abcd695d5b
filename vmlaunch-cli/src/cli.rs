use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use vmlaunch::LauncherOptions;
use vmlaunch::util::default_home_dir;

/// Unpack, boot and tunnel into a prebuilt VM image.
///
/// Without a subcommand, `vmlaunch` runs a launch.
#[derive(Parser, Debug)]
#[command(name = "vmlaunch", author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: LaunchFlags,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the image, boot it and open the SSH and VNC tunnels (default)
    Run(RunArgs),
    /// Only unpack the image archive (or its fragments)
    Prepare(LaunchFlags),
    /// Check that required host tools are installed
    Check(LaunchFlags),
    /// Stop a running launch
    Stop,
    /// Show the processes of a running launch
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// State directory for the lock, run-state file and logs
    #[arg(long, global = true, env = "VMLAUNCH_HOME", value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// YAML file with launcher options; flags override it
    #[arg(long, global = true, env = "VMLAUNCH_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalFlags {
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(default_home_dir)
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    /// Options from `--config` (or defaults) with `flags` applied on top.
    pub fn load_options(&self, flags: &LaunchFlags) -> anyhow::Result<LauncherOptions> {
        let mut options = match &self.config {
            Some(path) => LauncherOptions::from_yaml_file(path)?,
            None => LauncherOptions::default(),
        };
        flags.apply(&mut options);
        options.validate()?;
        Ok(options)
    }
}

/// Overrides for [`LauncherOptions`] shared by `run`, `prepare` and `check`.
#[derive(Args, Debug, Clone, Default)]
pub struct LaunchFlags {
    /// Directory the image unpacks into [default: vm]
    #[arg(long, value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Image archive [default: <project-dir>.tar.zst]
    #[arg(long, value_name = "FILE")]
    pub archive: Option<PathBuf>,

    /// Boot script inside the project directory [default: boot.sh]
    #[arg(long, value_name = "FILE")]
    pub boot_script: Option<String>,

    /// host:port that answers once the VM is up [default: 192.168.65.32:22222]
    #[arg(long, value_name = "HOST:PORT")]
    pub ssh_target: Option<String>,

    /// Port forwarding tool [default: iproxy]
    #[arg(long, value_name = "TOOL")]
    pub tunnel_tool: Option<String>,

    /// Seconds between readiness checks [default: 5]
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Seconds to wait for the VM before starting tunnels anyway [default: 180]
    #[arg(long, value_name = "SECS")]
    pub poll_timeout: Option<u64>,

    /// Keep the archive after extracting it
    #[arg(long)]
    pub keep_archive: bool,
}

impl LaunchFlags {
    pub fn apply(&self, options: &mut LauncherOptions) {
        if let Some(dir) = &self.project_dir {
            options.project_dir = dir.clone();
        }
        if let Some(archive) = &self.archive {
            options.archive = Some(archive.clone());
        }
        if let Some(script) = &self.boot_script {
            options.boot_script = script.clone();
        }
        if let Some(target) = &self.ssh_target {
            options.ssh_target = target.clone();
        }
        if let Some(tool) = &self.tunnel_tool {
            options.tunnel_tool = tool.clone();
        }
        if let Some(secs) = self.poll_interval {
            options.poll.interval_secs = secs;
        }
        if let Some(secs) = self.poll_timeout {
            options.poll.ceiling_secs = secs;
        }
        if self.keep_archive {
            options.keep_archive = true;
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub launch: LaunchFlags,

    /// Extra arguments passed to the boot script
    #[arg(last = true, value_name = "BOOT_ARGS")]
    pub boot_args: Vec<String>,
}
