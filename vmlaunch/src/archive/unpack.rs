//! Streaming decompression and unpacking of the image tarball.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;
use vmlaunch_shared::errors::{LauncherError, LauncherResult};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: [u8; 3] = [b'B', b'Z', b'h'];

/// Compression wrapped around the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Gzip,
    None,
}

/// Sniff the compression format from the first bytes of a file.
///
/// Formats we recognize but cannot decode in-process are reported as
/// [`LauncherError::Unsupported`].
pub fn detect_compression(header: &[u8]) -> LauncherResult<Compression> {
    if header.starts_with(&ZSTD_MAGIC) {
        Ok(Compression::Zstd)
    } else if header.starts_with(&GZIP_MAGIC) {
        Ok(Compression::Gzip)
    } else if header.starts_with(&XZ_MAGIC) {
        Err(LauncherError::Unsupported("xz-compressed archives".into()))
    } else if header.starts_with(&BZIP2_MAGIC) {
        Err(LauncherError::Unsupported("bzip2-compressed archives".into()))
    } else {
        Ok(Compression::None)
    }
}

/// Decompress and unpack `archive_path` into `dest`.
///
/// Entry permissions are preserved so the boot script stays executable.
/// Returns the number of entries unpacked. Nothing is cleaned up on
/// failure; a half-extracted tree is left for inspection.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> LauncherResult<u64> {
    let mut file = File::open(archive_path).map_err(|e| {
        LauncherError::Extract(format!(
            "Failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;

    let mut header = [0u8; 6];
    let read = read_header(&mut file, &mut header).map_err(|e| {
        LauncherError::Extract(format!("Failed to read archive header: {}", e))
    })?;
    let compression = detect_compression(&header[..read])?;
    debug!(
        archive = %archive_path.display(),
        ?compression,
        "Detected archive compression"
    );

    // Reopen rather than seek so the decoder sees the stream from byte zero
    let file = File::open(archive_path).map_err(|e| {
        LauncherError::Extract(format!(
            "Failed to reopen archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    let buffered = BufReader::new(file);

    let reader: Box<dyn Read> = match compression {
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(buffered).map_err(
            |e| LauncherError::Extract(format!("Failed to initialize zstd decoder: {}", e)),
        )?),
        Compression::Gzip => Box::new(GzDecoder::new(buffered)),
        Compression::None => Box::new(buffered),
    };

    unpack_tar(reader, dest)
}

fn read_header(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> LauncherResult<u64> {
    fs::create_dir_all(dest).map_err(|e| {
        LauncherError::Extract(format!(
            "Failed to create destination directory {}: {}",
            dest.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| LauncherError::Extract(format!("Failed to read tar entries: {}", e)))?;

    let mut count = 0u64;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| LauncherError::Extract(format!("Corrupt tar entry: {}", e)))?;

        // unpack_in refuses paths escaping dest and reports them as Ok(false)
        let unpacked = entry.unpack_in(dest).map_err(|e| {
            let path = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "<invalid path>".into());
            LauncherError::Extract(format!("Failed to unpack {}: {}", path, e))
        })?;

        if unpacked {
            count += 1;
        } else {
            tracing::warn!("Skipped tar entry outside destination");
        }
    }

    Ok(count)
}
