use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::warn;

/// Sidecar path holding the uploaded-byte counter for `destination`.
pub fn stats_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".stats");
    destination.with_file_name(name)
}

/// Reads the uploaded counter. A missing or unreadable sidecar counts as zero.
pub fn load_uploaded(path: &Path) -> u64 {
    match fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse().unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring malformed stats file");
            0
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read stats file");
            0
        }
    }
}

pub fn save_uploaded(path: &Path, uploaded: u64) -> io::Result<()> {
    fs::write(path, format!("{}\n", uploaded))
}
