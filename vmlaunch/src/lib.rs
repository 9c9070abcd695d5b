//! vmlaunch - unpack, boot and tunnel into a prebuilt VM image.
//!
//! A launch runs these stages in order:
//!
//! ```text
//! host_check ──→ archive ──→ boot ──→ readiness ──→ tunnel ──→ wait
//!                                 └────────── lifecycle (owns every child) ──┘
//! ```
//!
//! [`Launcher`] drives the stages; [`lifecycle::LifecycleController`] owns
//! the spawned processes and is the only thing that terminates them.

pub mod archive;
pub mod boot;
pub mod clock;
pub mod host_check;
pub mod launcher;
pub mod lifecycle;
pub mod options;
pub mod readiness;
pub mod tunnel;
pub mod util;

pub use launcher::{LaunchEvent, LaunchOutcome, Launcher};
pub use options::LauncherOptions;
pub use vmlaunch_shared::{LauncherError, LauncherResult};
