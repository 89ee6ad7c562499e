//! Concatenation of segmented recordings.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::recording::{self, RecordingError, RecordingWriter};

/// Outcome of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub inputs: usize,
    pub chunks: usize,
    pub output: PathBuf,
}

/// Merge `inputs` into `output` in the order given.
///
/// Every input is decoded strictly before the output is created, so a corrupt
/// input aborts the merge without leaving a partial file behind. Elapsed
/// values are carried over unchanged.
pub fn merge<P: AsRef<Path>>(
    inputs: &[P],
    output: impl AsRef<Path>,
) -> Result<MergeSummary, RecordingError> {
    let mut sequences = Vec::with_capacity(inputs.len());
    for input in inputs {
        sequences.push(recording::read_all(input)?);
    }

    let mut writer = RecordingWriter::begin(output)?;
    for chunk in sequences.iter().flatten() {
        writer.append(chunk.elapsed, &chunk.payload)?;
    }
    let chunks = writer.chunks();
    let output = writer.end()?;

    info!(
        "Merged {} recordings ({} chunks) into {}",
        inputs.len(),
        chunks,
        output.display()
    );
    Ok(MergeSummary {
        inputs: inputs.len(),
        chunks,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{read_all, write_all, Chunk};
    use std::time::Duration;

    #[test]
    fn test_merge_keeps_input_order_and_durations() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rec");
        let b = dir.path().join("b.rec");
        let out = dir.path().join("out.scr");

        let a1 = Chunk::new(Duration::from_millis(10), b"a1".to_vec());
        let a2 = Chunk::new(Duration::from_millis(20), b"a2".to_vec());
        let b1 = Chunk::new(Duration::from_secs(7), b"b1".to_vec());
        let b2 = Chunk::new(Duration::ZERO, b"b2".to_vec());
        write_all(&a, [&a1, &a2]).unwrap();
        write_all(&b, [&b1, &b2]).unwrap();

        let summary = merge(&[&a, &b], &out).unwrap();
        assert_eq!(summary.inputs, 2);
        assert_eq!(summary.chunks, 4);
        assert_eq!(summary.output, out);

        assert_eq!(read_all(&out).unwrap(), vec![a1, a2, b1, b2]);
    }

    #[test]
    fn test_merge_of_empty_inputs_is_empty_recording() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rec");
        let b = dir.path().join("b.rec");
        let out = dir.path().join("out.scr");
        write_all(&a, &[] as &[Chunk]).unwrap();
        write_all(&b, &[] as &[Chunk]).unwrap();

        let summary = merge(&[a, b], &out).unwrap();
        assert_eq!(summary.chunks, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "[]");
    }

    #[test]
    fn test_corrupt_input_aborts_merge() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.rec");
        let bad = dir.path().join("bad.rec");
        let out = dir.path().join("out.scr");
        write_all(&good, &[Chunk::new(Duration::ZERO, b"x".to_vec())]).unwrap();
        std::fs::write(&bad, r#"[{"Duration":1,"Data":"eA=="},"#).unwrap();

        let result = merge(&[&good, &bad], &out);
        assert!(matches!(result, Err(RecordingError::Corrupt { .. })));
        assert!(!out.exists());
    }
}
