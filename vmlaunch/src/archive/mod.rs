//! Image archive preparation.
//!
//! Turns `vm.tar.zst` (or its `vm.tar.zst.part_*` fragments) into the
//! unpacked project directory. Running it again once the directory exists
//! does nothing.

mod fragments;
mod unpack;

pub use fragments::{discover_fragments, merge_fragments};
pub use unpack::{Compression, detect_compression, unpack_archive};

use std::path::{Path, PathBuf};

use vmlaunch_shared::errors::{LauncherError, LauncherResult};

use crate::options::LauncherOptions;

/// What [`ArchivePreparer::prepare`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The project directory was already there; nothing was touched.
    AlreadyPresent,
    /// The archive was unpacked.
    Extracted {
        /// Number of fragments merged first (0 when the archive existed).
        fragments_merged: usize,
        /// Tar entries unpacked.
        entries: u64,
        /// Whether the primary archive was deleted afterwards.
        archive_removed: bool,
    },
}

pub struct ArchivePreparer {
    project_dir: PathBuf,
    archive: PathBuf,
    keep_archive: bool,
}

impl ArchivePreparer {
    pub fn new(project_dir: impl Into<PathBuf>, archive: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            archive: archive.into(),
            keep_archive: false,
        }
    }

    pub fn from_options(options: &LauncherOptions) -> Self {
        Self::new(&options.project_dir, options.archive_path()).keep_archive(options.keep_archive)
    }

    /// Keep the primary archive after extraction instead of deleting it.
    pub fn keep_archive(mut self, keep: bool) -> Self {
        self.keep_archive = keep;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Make sure the project directory exists, unpacking the archive if not.
    ///
    /// Blocking; run it on a blocking thread from async code.
    pub fn prepare(&self) -> LauncherResult<PrepareOutcome> {
        if self.project_dir.exists() {
            tracing::info!(
                project_dir = %self.project_dir.display(),
                "Project directory present, skipping extraction"
            );
            return Ok(PrepareOutcome::AlreadyPresent);
        }

        let fragments_merged = if self.archive.is_file() {
            0
        } else {
            let fragments = discover_fragments(&self.archive)?;
            if fragments.is_empty() {
                return Err(LauncherError::MissingInput(format!(
                    "neither {} nor {} exists, and no {}.part_* fragments were found",
                    self.project_dir.display(),
                    self.archive.display(),
                    self.archive.display()
                )));
            }

            tracing::info!(
                count = fragments.len(),
                archive = %self.archive.display(),
                "Merging archive fragments"
            );
            let bytes = merge_fragments(&fragments, &self.archive)?;
            tracing::debug!(bytes, "Fragments merged");
            fragments.len()
        };

        let dest = extraction_root(&self.project_dir);
        tracing::info!(
            archive = %self.archive.display(),
            dest = %dest.display(),
            "Extracting image archive"
        );
        let entries = unpack_archive(&self.archive, &dest)?;

        if !self.project_dir.is_dir() {
            return Err(LauncherError::Extract(format!(
                "{} did not contain {}",
                self.archive.display(),
                self.project_dir.display()
            )));
        }

        let archive_removed = if self.keep_archive {
            false
        } else {
            match std::fs::remove_file(&self.archive) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        archive = %self.archive.display(),
                        error = %e,
                        "Failed to remove archive after extraction"
                    );
                    false
                }
            }
        };

        tracing::info!(entries, archive_removed, "Extraction complete");

        Ok(PrepareOutcome::Extracted {
            fragments_merged,
            entries,
            archive_removed,
        })
    }
}

/// The archive carries the project directory itself, so it unpacks into the
/// project directory's parent.
fn extraction_root(project_dir: &Path) -> PathBuf {
    match project_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_root_of_relative_dir_is_cwd() {
        assert_eq!(extraction_root(Path::new("vm")), PathBuf::from("."));
        assert_eq!(
            extraction_root(Path::new("/srv/images/vm")),
            PathBuf::from("/srv/images")
        );
    }
}
