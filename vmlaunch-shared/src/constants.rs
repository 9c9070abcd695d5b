//! Default values shared by the library and the CLI.

/// Filesystem defaults
pub mod files {
    /// Project directory created by the image archive
    pub const PROJECT_DIR: &str = "vm";

    /// Suffix appended to the project directory to name the archive
    pub const ARCHIVE_SUFFIX: &str = ".tar.zst";

    /// Split fragments are named `<archive>.part_<n>`
    pub const FRAGMENT_MARKER: &str = ".part_";

    /// Boot entry point inside the project directory
    pub const BOOT_SCRIPT: &str = "boot.sh";
}

/// Network defaults
pub mod network {
    /// Address probed for VM readiness (the guest's SSH port)
    pub const SSH_TARGET: &str = "192.168.65.32:22222";

    /// SSH forward, host side and device side
    pub const SSH_PORT: u16 = 22222;

    /// VNC forward, host side and device side
    pub const VNC_PORT: u16 = 5901;

    /// Default forwarding tool (libimobiledevice)
    pub const TUNNEL_TOOL: &str = "iproxy";
}

/// Timing defaults, in seconds
pub mod timing {
    pub const POLL_INTERVAL_SECS: u64 = 5;
    pub const POLL_CEILING_SECS: u64 = 180;
    pub const CONNECT_TIMEOUT_SECS: u64 = 2;
    pub const SHUTDOWN_GRACE_SECS: u64 = 2;
}

/// Runtime home layout
pub mod home {
    /// Environment variable overriding the home directory
    pub const ENV_VAR: &str = "VMLAUNCH_HOME";

    /// Default home directory name under the user's home
    pub const DIR_NAME: &str = ".vmlaunch";

    pub const LOGS_DIR: &str = "logs";
    pub const LOG_FILE: &str = "vmlaunch.log";
    pub const LOCK_FILE: &str = ".lock";
    pub const STATE_FILE: &str = "launcher.json";
}
