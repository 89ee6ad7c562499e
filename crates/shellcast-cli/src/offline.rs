//! Helpers for the commands that work on recordings without a daemon.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use shellcast_core::recording::{self, MERGED_EXTENSION, RECORDING_EXTENSION};
use tracing::{info, warn};

/// `path` with `.scr` appended unless it already ends in it.
fn with_merged_extension(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == MERGED_EXTENSION) {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(MERGED_EXTENSION);
    PathBuf::from(name)
}

/// Where `shellcast merge` writes: the requested path with `.scr` appended
/// when missing, or `merged_<unix secs hex>.scr`.
pub fn merge_output_path(requested: Option<&Path>, now: SystemTime) -> PathBuf {
    match requested {
        Some(path) => with_merged_extension(path),
        None => {
            let secs = now
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            PathBuf::from(format!("merged_{:x}.{}", secs, MERGED_EXTENSION))
        }
    }
}

/// One recording file on disk.
#[derive(Debug, Clone)]
pub struct RecordingEntry {
    pub path: PathBuf,
    pub size: u64,
    /// Recorded duration in whole seconds; `None` when the file is unreadable.
    pub seconds: Option<u64>,
    pub modified: Option<DateTime<Local>>,
}

impl RecordingEntry {
    pub fn size_kib(&self) -> u64 {
        self.size / 1024
    }
}

fn is_recording(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == RECORDING_EXTENSION || ext == MERGED_EXTENSION)
}

/// Recordings in `dir`, sorted by file name. A missing directory is empty.
pub fn list_recordings(dir: &Path) -> Result<Vec<RecordingEntry>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", dir.display()));
        }
    };

    let mut recordings = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        let path = entry.path();
        if !is_recording(&path) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let seconds = match recording::summarize(&path) {
            Ok(summary) => Some(summary.display_seconds()),
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                None
            }
        };

        recordings.push(RecordingEntry {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Local>::from),
            seconds,
            path,
        });
    }

    recordings.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(recordings)
}

/// Resolve a bare recording file name inside `dir`.
///
/// Names with path separators, `..` or a leading dot are refused so the
/// management commands never reach outside the directory.
fn recording_in(dir: &Path, name: &str) -> Result<PathBuf> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && Path::new(name).file_name().is_some_and(|n| n == name);
    if !plain {
        anyhow::bail!("Invalid recording name '{}': expected a file name", name);
    }
    Ok(dir.join(name))
}

/// Delete recording `name` from `dir`. Only `.rec` and `.scr` files are removed.
pub fn delete_recording(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = recording_in(dir, name)?;
    if !is_recording(&path) {
        anyhow::bail!(
            "'{}' is not a recording (.{} or .{})",
            name,
            RECORDING_EXTENSION,
            MERGED_EXTENSION
        );
    }
    std::fs::remove_file(&path)
        .with_context(|| format!("Failed to delete {}", path.display()))?;
    info!("Deleted recording {}", path.display());
    Ok(path)
}

/// Rename recording `old` to `new` inside `dir`.
///
/// `.scr` is appended to `new` when missing. An existing target is never
/// replaced.
pub fn rename_recording(dir: &Path, old: &str, new: &str) -> Result<PathBuf> {
    let from = recording_in(dir, old)?;
    if !is_recording(&from) {
        anyhow::bail!(
            "'{}' is not a recording (.{} or .{})",
            old,
            RECORDING_EXTENSION,
            MERGED_EXTENSION
        );
    }
    let to = with_merged_extension(&recording_in(dir, new)?);

    if std::fs::symlink_metadata(&to).is_ok() {
        anyhow::bail!("{} already exists", to.display());
    }
    std::fs::rename(&from, &to)
        .with_context(|| format!("Failed to rename {} to {}", from.display(), to.display()))?;
    info!("Renamed recording {} to {}", from.display(), to.display());
    Ok(to)
}

/// Size of the terminal attached to stdout, as (columns, rows).
pub fn terminal_size() -> Option<(u16, u16)> {
    // SAFETY: winsize is plain old data; all-zero is a valid value.
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes a winsize into the pointer we pass, which
    // points at a live, correctly typed local.
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut size) };
    if rc != 0 || size.ws_col == 0 || size.ws_row == 0 {
        return None;
    }
    Some((size.ws_col, size.ws_row))
}
