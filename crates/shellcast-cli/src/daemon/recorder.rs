//! Per-session recording state driven by the fan-out loop.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use shellcast_core::recording::{RecordingWriter, RECORDING_EXTENSION};
use tracing::{error, info, warn};

/// Recording commands delivered to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCommand {
    Start,
    Stop,
}

/// Names tried for one start before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

/// File name for a recording of `session` started at `now`:
/// `<id>_<unix secs hex>.rec`, or `<id>_<unix secs hex>_<n>.rec` for the
/// `n`th further take started within the same second.
pub fn recording_path(dir: &Path, session: &str, now: SystemTime, take: usize) -> PathBuf {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    if take == 0 {
        dir.join(format!("{}_{:x}.{}", session, secs, RECORDING_EXTENSION))
    } else {
        dir.join(format!(
            "{}_{:x}_{}.{}",
            session, secs, take, RECORDING_EXTENSION
        ))
    }
}

struct Active {
    writer: RecordingWriter,
    last_chunk: Instant,
}

/// Recording state of one session.
///
/// Any file fault disables recording for the rest of the session; the
/// session itself keeps running.
pub struct SessionRecorder {
    session: String,
    dir: PathBuf,
    active: Option<Active>,
    faulted: bool,
}

impl SessionRecorder {
    pub fn new(session: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            session: session.into(),
            dir: dir.into(),
            active: None,
            faulted: false,
        }
    }

    #[cfg(test)]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    #[cfg(test)]
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Apply a control command. Returns the finished file for `Stop`.
    pub fn apply(&mut self, command: RecordCommand) -> Option<PathBuf> {
        match command {
            RecordCommand::Start => {
                self.start();
                None
            }
            RecordCommand::Stop => {
                if self.active.is_none() {
                    info!("Session {} is not recording, ignoring stop", self.session);
                }
                self.finish()
            }
        }
    }

    /// Open a new recording file. Ignored while one is already active.
    pub fn start(&mut self) {
        if self.active.is_some() {
            info!("Session {} is already recording, ignoring start", self.session);
            return;
        }
        if self.faulted {
            warn!(
                "Recording disabled for session {} after an earlier failure",
                self.session
            );
            return;
        }

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            error!(
                "Failed to create recordings directory {}: {}",
                self.dir.display(),
                e
            );
            self.faulted = true;
            return;
        }

        let now = SystemTime::now();
        for take in 0..MAX_NAME_ATTEMPTS {
            let path = recording_path(&self.dir, &self.session, now, take);
            match RecordingWriter::begin_new(&path) {
                Ok(writer) => {
                    info!("Recording session {} to {}", self.session, path.display());
                    self.active = Some(Active {
                        writer,
                        last_chunk: Instant::now(),
                    });
                    return;
                }
                Err(e) if e.is_already_exists() => continue,
                Err(e) => {
                    error!("Failed to start recording for {}: {}", self.session, e);
                    self.faulted = true;
                    return;
                }
            }
        }

        error!(
            "Failed to start recording for {}: no free file name in {}",
            self.session,
            self.dir.display()
        );
        self.faulted = true;
    }

    /// Append an output block, timed against the previous one.
    ///
    /// The write is a plain blocking write on the calling task with no
    /// fsync. Output blocks are at most 1 KiB.
    pub fn record(&mut self, data: &[u8]) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let now = Instant::now();
        let elapsed = now.duration_since(active.last_chunk);
        active.last_chunk = now;

        if let Err(e) = active.writer.append(elapsed, data) {
            error!(
                "Recording for session {} failed, disabling: {}",
                self.session, e
            );
            self.faulted = true;
            self.finish();
        }
    }

    /// Close the active recording, if any, and return its path.
    pub fn finish(&mut self) -> Option<PathBuf> {
        let active = self.active.take()?;
        match active.writer.end() {
            Ok(path) => {
                info!("Saved recording {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to finalize recording for {}: {}", self.session, e);
                self.faulted = true;
                None
            }
        }
    }
}
