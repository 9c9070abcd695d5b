mod process;

pub use process::{
    is_group_alive, is_own_group_leader, is_process_alive, process_group_of, signal_group,
    signal_process,
};

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use vmlaunch_shared::constants::home;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

/// Find an executable by name.
///
/// Names containing a path separator are checked as given; bare names are
/// searched in every `PATH` entry, in order.
///
/// # Returns
/// * `Ok(PathBuf)` - Path to the found executable
/// * `Err(...)` - Not found, with every searched location listed
pub fn find_binary(binary_name: &str) -> LauncherResult<PathBuf> {
    let candidates: Vec<PathBuf> = if binary_name.contains(std::path::MAIN_SEPARATOR) {
        vec![PathBuf::from(binary_name)]
    } else {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(binary_name))
                    .collect()
            })
            .unwrap_or_default()
    };

    for candidate in &candidates {
        tracing::trace!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if is_executable(candidate) {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(LauncherError::MissingPrerequisite(vec![format!(
        "{} (searched:\n{})",
        binary_name, locations
    )]))
}

/// Regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Default home directory: `$VMLAUNCH_HOME`, else `~/.vmlaunch`.
pub fn default_home_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(home::ENV_VAR) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(home::DIR_NAME)
}

/// Initialize tracing.
///
/// Human-readable events go to stderr, filtered by `RUST_LOG` or
/// `default_filter`. When `logs_dir` is given, everything at `debug` and
/// above is also written to a daily rotated file there.
///
/// Returns the appender guard; it must live until the process exits or
/// buffered lines are lost.
pub fn init_logging(logs_dir: Option<&Path>, default_filter: &str) -> Option<WorkerGuard> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let (file_layer, guard) = match logs_dir.and_then(open_log_appender) {
        Some((non_blocking, guard)) => {
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn open_log_appender(
    logs_dir: &Path,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!(
            "Warning: cannot create log directory {}: {}",
            logs_dir.display(),
            e
        );
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(logs_dir, home::LOG_FILE);
    Some(tracing_appender::non_blocking(file_appender))
}
