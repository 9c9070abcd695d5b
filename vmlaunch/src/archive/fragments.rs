//! Split archive fragments (`<archive>.part_*`).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use vmlaunch_shared::constants::files;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

/// Find the fragments of `archive`, sorted by file name.
///
/// Fragments live next to the archive and are named
/// `<archive file name>.part_<suffix>`. Directory enumeration order is
/// unspecified, so the result is always sorted lexicographically by name;
/// that order is what reassembles the original bytes.
pub fn discover_fragments(archive: &Path) -> LauncherResult<Vec<PathBuf>> {
    let Some(archive_name) = archive.file_name().and_then(|n| n.to_str()) else {
        return Err(LauncherError::Config(format!(
            "Archive path has no usable file name: {}",
            archive.display()
        )));
    };
    let prefix = format!("{}{}", archive_name, files::FRAGMENT_MARKER);

    let parent = match archive.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LauncherError::Storage(format!(
                "Failed to list {}: {}",
                parent.display(),
                e
            )));
        }
    };

    let mut fragments: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.starts_with(&prefix).then(|| (name, entry.path()))
        })
        .collect();

    fragments.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(fragments.into_iter().map(|(_, path)| path).collect())
}

/// Concatenate `fragments` in the given order into `archive`.
///
/// Returns the number of bytes written. A partially written archive is
/// removed on failure so the next run starts from the fragments again.
pub fn merge_fragments(fragments: &[PathBuf], archive: &Path) -> LauncherResult<u64> {
    let result = write_concatenated(fragments, archive);
    if result.is_err() {
        let _ = fs::remove_file(archive);
    }
    result
}

fn write_concatenated(fragments: &[PathBuf], archive: &Path) -> LauncherResult<u64> {
    let out = File::create(archive).map_err(|e| {
        LauncherError::Extract(format!("Failed to create {}: {}", archive.display(), e))
    })?;
    let mut out = BufWriter::new(out);

    let mut total = 0u64;
    for fragment in fragments {
        let mut input = File::open(fragment).map_err(|e| {
            LauncherError::Extract(format!("Failed to open {}: {}", fragment.display(), e))
        })?;
        let copied = io::copy(&mut input, &mut out).map_err(|e| {
            LauncherError::Extract(format!("Failed to append {}: {}", fragment.display(), e))
        })?;
        tracing::debug!(fragment = %fragment.display(), bytes = copied, "Merged fragment");
        total += copied;
    }

    out.flush()
        .map_err(|e| LauncherError::Extract(format!("Failed to flush {}: {}", archive.display(), e)))?;

    Ok(total)
}
