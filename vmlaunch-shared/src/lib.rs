//! vmlaunch shared code
//!
//! Error type and constants used by both the launcher library and the CLI.

pub mod constants;
pub mod errors;

pub use errors::{LauncherError, LauncherResult};
