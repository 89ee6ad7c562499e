//! Paced playback of a recording.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::recording::{self, RecordingError};

/// Written to the sink before the first chunk.
pub const BEGIN_BANNER: &str = "\r\n\r\n---beginning of replay---\r\n\r\n";

/// Written to the sink after the last chunk.
pub const END_BANNER: &str = "\r\n\r\n---end of replay---\r\n\r\n";

/// Default cap on the pause before any single chunk.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(1000);

/// What a replay emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub chunks: usize,
    pub bytes: usize,
    pub skipped: usize,
    /// Total time spent pausing between chunks.
    pub paced: Duration,
}

/// Replay `path` into `sink`, sleeping `min(elapsed, max_wait)` before each chunk.
pub fn replay<W: Write>(
    path: impl AsRef<Path>,
    max_wait: Duration,
    sink: &mut W,
) -> Result<ReplayStats, RecordingError> {
    replay_with(path, max_wait, sink, std::thread::sleep)
}

/// Like [`replay`] with a caller-supplied pause function.
pub fn replay_with<W, F>(
    path: impl AsRef<Path>,
    max_wait: Duration,
    sink: &mut W,
    mut pause: F,
) -> Result<ReplayStats, RecordingError>
where
    W: Write,
    F: FnMut(Duration),
{
    let path = path.as_ref();
    let mut chunks = recording::open(path)?;
    let mut stats = ReplayStats::default();

    emit(sink, BEGIN_BANNER.as_bytes())?;

    for chunk in chunks.by_ref() {
        let wait = chunk.elapsed.min(max_wait);
        if !wait.is_zero() {
            pause(wait);
            stats.paced += wait;
        }
        emit(sink, &chunk.payload)?;
        stats.chunks += 1;
        stats.bytes += chunk.payload.len();
    }
    stats.skipped = chunks.skipped();

    emit(sink, END_BANNER.as_bytes())?;

    debug!(
        "Replayed {} chunks ({} bytes, {} skipped) from {}",
        stats.chunks,
        stats.bytes,
        stats.skipped,
        path.display()
    );
    Ok(stats)
}

fn emit<W: Write>(sink: &mut W, bytes: &[u8]) -> Result<(), RecordingError> {
    sink.write_all(bytes).map_err(RecordingError::Output)?;
    sink.flush().map_err(RecordingError::Output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{write_all, Chunk};
    use std::time::Instant;

    #[test]
    fn test_replay_writes_banners_around_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.rec");
        write_all(
            &path,
            &[
                Chunk::new(Duration::ZERO, b"hel".to_vec()),
                Chunk::new(Duration::ZERO, b"lo\r\n".to_vec()),
            ],
        )
        .unwrap();

        let mut out = Vec::new();
        let stats = replay_with(&path, DEFAULT_MAX_WAIT, &mut out, |_| {}).unwrap();

        let expected = format!("{}hello\r\n{}", BEGIN_BANNER, END_BANNER);
        assert_eq!(out, expected.into_bytes());
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.bytes, 7);
    }

    #[test]
    fn test_pauses_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paced.rec");
        write_all(
            &path,
            &[
                Chunk::new(Duration::from_millis(50), b"a".to_vec()),
                Chunk::new(Duration::from_millis(5000), b"b".to_vec()),
                Chunk::new(Duration::ZERO, b"c".to_vec()),
            ],
        )
        .unwrap();

        let mut pauses = Vec::new();
        let mut out = Vec::new();
        let stats = replay_with(&path, Duration::from_millis(1000), &mut out, |d| {
            pauses.push(d)
        })
        .unwrap();

        assert_eq!(
            pauses,
            vec![Duration::from_millis(50), Duration::from_millis(1000)]
        );
        assert_eq!(stats.paced, Duration::from_millis(1050));
    }

    #[test]
    fn test_real_pacing_uses_clamped_wall_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wall.rec");
        write_all(
            &path,
            &[
                Chunk::new(Duration::from_millis(50), b"x".to_vec()),
                Chunk::new(Duration::from_millis(5000), b"y".to_vec()),
            ],
        )
        .unwrap();

        let start = Instant::now();
        let mut out = Vec::new();
        replay(&path, Duration::from_millis(1000), &mut out).unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(1050), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3000), "{:?}", elapsed);
    }

    #[test]
    fn test_malformed_chunk_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rec");
        std::fs::write(
            &path,
            r#"[{"Duration":0,"Data":"b2s="},{"Duration":0,"Data":"!!not base64!!"},{"Duration":0,"Data":"IQ=="}]"#,
        )
        .unwrap();

        let mut out = Vec::new();
        let stats = replay_with(&path, DEFAULT_MAX_WAIT, &mut out, |_| {}).unwrap();

        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.skipped, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ok!"));
    }

    #[test]
    fn test_incomplete_file_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.rec");
        std::fs::write(&path, r#"[{"Duration":0,"Data":"eA=="},"#).unwrap();

        let mut out = Vec::new();
        let result = replay_with(&path, DEFAULT_MAX_WAIT, &mut out, |_| {});
        assert!(matches!(result, Err(RecordingError::Corrupt { .. })));
        assert!(out.is_empty());
    }
}
