//! Split a container file at millisecond boundaries
//!
//! Each segment becomes its own valid file with the source's format. Samples
//! are copied unchanged; boundaries snap to the nearest whole frame.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Split `source` at `boundaries_ms` (strictly ascending, inside the file)
/// into `boundaries_ms.len() + 1` files in `out_dir`, named
/// `<stem>_part<n>.wav` from 1.
pub fn split_file(
    source: impl AsRef<Path>,
    boundaries_ms: &[i64],
    out_dir: impl AsRef<Path>,
) -> EngineResult<Vec<PathBuf>> {
    let source = source.as_ref();
    let out_dir = out_dir.as_ref();

    let mut reader = hound::WavReader::open(source)?;
    let spec = reader.spec();
    let total_frames = reader.duration() as u64;
    let rate = spec.sample_rate as u64;

    let mut cuts = Vec::with_capacity(boundaries_ms.len() + 2);
    cuts.push(0u64);
    for &ms in boundaries_ms {
        if ms <= 0 {
            return Err(EngineError::InvalidSplit(format!(
                "boundary {}ms is not after the start",
                ms
            )));
        }
        // Nearest frame
        let frame = (ms as u64 * rate + 500) / 1000;
        let previous = cuts.last().copied().unwrap_or(0);
        if frame <= previous {
            return Err(EngineError::InvalidSplit(format!(
                "boundaries must be strictly ascending, got {}ms",
                ms
            )));
        }
        if frame >= total_frames {
            return Err(EngineError::InvalidSplit(format!(
                "boundary {}ms is past the end of the file",
                ms
            )));
        }
        cuts.push(frame);
    }
    cuts.push(total_frames);

    std::fs::create_dir_all(out_dir)?;
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "split".to_string());

    let channels = spec.channels as usize;
    let mut samples = reader.samples::<i32>();
    let mut outputs = Vec::with_capacity(cuts.len() - 1);

    for (index, window) in cuts.windows(2).enumerate() {
        let path = out_dir.join(format!("{}_part{}.wav", stem, index + 1));
        let mut writer = hound::WavWriter::create(&path, spec)?;
        let count = (window[1] - window[0]) as usize * channels;
        for sample in samples.by_ref().take(count) {
            writer.write_sample(sample?)?;
        }
        writer.finalize()?;

        log::debug!(
            "Wrote segment {} ({} frames)",
            path.display(),
            window[1] - window[0]
        );
        outputs.push(path);
    }

    log::info!(
        "Split {} into {} segments",
        source.display(),
        outputs.len()
    );
    Ok(outputs)
}
