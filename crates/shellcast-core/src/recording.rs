//! Streaming codec for session recordings.
//!
//! Writers never buffer a whole session: [`RecordingWriter::begin`] writes the
//! opening `[`, every [`RecordingWriter::append`] writes one encoded chunk
//! followed by a `,`, and [`RecordingWriter::end`] truncates the trailing `,`
//! before writing the closing `]`. Until `end` runs the file is not valid
//! JSON, and readers report it as corrupt instead of guessing at a repair.
//!
//! Reading comes in two strengths. [`open`] checks the array framing up front
//! and then decodes elements lazily, logging and skipping any element that
//! does not decode. [`read_all`] is strict and fails on the first bad element.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Extension used for live session recordings.
pub const RECORDING_EXTENSION: &str = "rec";

/// Extension used for merged recordings.
pub const MERGED_EXTENSION: &str = "scr";

/// Errors produced while writing or reading a recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("I/O error on recording {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode chunk: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("recording {} is corrupt or incomplete: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write replay output: {0}")]
    Output(#[source] io::Error),
}

impl RecordingError {
    /// True when a new recording was refused because the file already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            RecordingError::Io { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
        )
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RecordingError + '_ {
    move |source| RecordingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One recorded block of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Time since the previous chunk, or since recording start for the first.
    #[serde(rename = "Duration", with = "nanos")]
    pub elapsed: Duration,
    /// Raw output bytes, unaltered.
    #[serde(rename = "Data", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(elapsed: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            elapsed,
            payload: payload.into(),
        }
    }
}

/// Borrowed form of [`Chunk`] so appends do not copy the output block.
#[derive(Serialize)]
struct ChunkRef<'a> {
    #[serde(rename = "Duration", serialize_with = "nanos::serialize")]
    elapsed: Duration,
    #[serde(rename = "Data", serialize_with = "base64_bytes::serialize")]
    payload: &'a [u8],
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    /// `null` is accepted as an empty payload (nil byte slices encode that way).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// An open recording being appended to.
pub struct RecordingWriter {
    file: File,
    path: PathBuf,
    chunks: usize,
}

impl RecordingWriter {
    /// Create (or truncate) `path` and write the opening delimiter.
    pub fn begin(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        Self::begin_with(path.as_ref(), &options)
    }

    /// Like [`begin`](Self::begin), but fails instead of replacing an
    /// existing file.
    pub fn begin_new(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        Self::begin_with(path.as_ref(), &options)
    }

    fn begin_with(path: &Path, options: &OpenOptions) -> Result<Self, RecordingError> {
        let mut file = options.open(path).map_err(io_error(path))?;
        file.write_all(b"[").map_err(io_error(path))?;

        debug!("Recording started at {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            chunks: 0,
        })
    }

    /// Encode one chunk and write it followed by a separator.
    pub fn append(&mut self, elapsed: Duration, payload: &[u8]) -> Result<(), RecordingError> {
        let mut encoded = serde_json::to_vec(&ChunkRef { elapsed, payload })?;
        encoded.push(b',');
        self.file
            .write_all(&encoded)
            .map_err(io_error(&self.path))?;
        self.chunks += 1;
        Ok(())
    }

    /// Strip the trailing separator, close the array and the file.
    ///
    /// Returns the path of the finished recording.
    pub fn end(mut self) -> Result<PathBuf, RecordingError> {
        if self.chunks > 0 {
            let len = self
                .file
                .metadata()
                .map_err(io_error(&self.path))?
                .len();
            self.file
                .set_len(len.saturating_sub(1))
                .map_err(io_error(&self.path))?;
            // set_len leaves the cursor where it was
            self.file
                .seek(SeekFrom::End(0))
                .map_err(io_error(&self.path))?;
        }
        self.file.write_all(b"]").map_err(io_error(&self.path))?;
        self.file.flush().map_err(io_error(&self.path))?;

        debug!(
            "Recording finished at {} ({} chunks)",
            self.path.display(),
            self.chunks
        );
        Ok(self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunks appended so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }
}

/// Lazily decoded chunks of a recording. Malformed elements are skipped.
pub struct Chunks {
    path: PathBuf,
    elements: std::vec::IntoIter<serde_json::Value>,
    index: usize,
    skipped: usize,
}

impl Chunks {
    /// Number of elements skipped so far because they failed to decode.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            let element = self.elements.next()?;
            let index = self.index;
            self.index += 1;

            match serde_json::from_value::<Chunk>(element) {
                Ok(chunk) => return Some(chunk),
                Err(e) => {
                    warn!(
                        "Skipping malformed chunk #{} in {}: {}",
                        index,
                        self.path.display(),
                        e
                    );
                    self.skipped += 1;
                }
            }
        }
    }
}

/// Open a recording for lenient decoding.
///
/// The file is read and split into raw elements up front, so a broken array
/// framing (such as a recording that was never ended) fails here rather
/// than partway through playback. Only the typed decode of each element is
/// lazy. Fails when the file cannot be read or its framing is broken.
pub fn open(path: impl AsRef<Path>) -> Result<Chunks, RecordingError> {
    let path = path.as_ref();
    let raw = fs::read(path).map_err(io_error(path))?;
    let elements: Vec<serde_json::Value> =
        serde_json::from_slice(&raw).map_err(|source| RecordingError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(Chunks {
        path: path.to_path_buf(),
        elements: elements.into_iter(),
        index: 0,
        skipped: 0,
    })
}

/// Decode every chunk of a recording, failing on any malformed element.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Chunk>, RecordingError> {
    let path = path.as_ref();
    let raw = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&raw).map_err(|source| RecordingError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a complete recording through the begin/append/end sequence.
pub fn write_all<'a>(
    path: impl AsRef<Path>,
    chunks: impl IntoIterator<Item = &'a Chunk>,
) -> Result<PathBuf, RecordingError> {
    let mut writer = RecordingWriter::begin(path)?;
    for chunk in chunks {
        writer.append(chunk.elapsed, &chunk.payload)?;
    }
    writer.end()
}

/// Totals for a recording, as shown in a recordings listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub chunks: usize,
    pub bytes: usize,
    pub duration: Duration,
    pub skipped: usize,
}

impl RecordingSummary {
    /// Whole seconds of playback, rounded up the way the status listing shows it.
    pub fn display_seconds(&self) -> u64 {
        let millis = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        millis / 1000 + 1
    }
}

/// Sum up a recording without keeping its payloads.
pub fn summarize(path: impl AsRef<Path>) -> Result<RecordingSummary, RecordingError> {
    let mut chunks = open(path)?;
    let mut summary = RecordingSummary::default();

    for chunk in chunks.by_ref() {
        summary.chunks += 1;
        summary.bytes += chunk.payload.len();
        summary.duration += chunk.elapsed;
    }
    summary.skipped = chunks.skipped();

    Ok(summary)
}
