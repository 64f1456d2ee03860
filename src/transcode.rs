//! Audio transcoding to the canonical transcription format: 16 kHz, mono,
//! 16-bit little-endian PCM WAV. Operates on already-downloaded local files;
//! its failures never touch media asset download state.

use crate::error::{truncate_error, TranscodeError};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;
pub const TARGET_CHANNELS: u32 = 1;

/// Sibling output path for the transcoded file. A `.wav` input gets the
/// `.pcm.wav` suffix so the output never collides with the input.
pub fn transcoded_path(input: &Path) -> PathBuf {
    match input.extension().and_then(|e| e.to_str()) {
        Some("wav") => input.with_extension("pcm.wav"),
        _ => input.with_extension("wav"),
    }
}

pub async fn transcode_to_pcm(input: &Path) -> Result<PathBuf, TranscodeError> {
    if !input.exists() {
        return Err(TranscodeError::MissingInput(input.to_path_buf()));
    }

    let output = transcoded_path(input);
    debug!(input = %input.display(), output = %output.display(), "transcoding audio");

    let result = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg(TARGET_CHANNELS.to_string())
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg(&output)
        .output()
        .await
        .map_err(|err| TranscodeError::Conversion(format!("ffmpeg spawn failed: {err}")))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(TranscodeError::Conversion(format!(
            "ffmpeg exited with {}: {}",
            result.status,
            truncate_error(&stderr)
        )));
    }

    // ffmpeg can report success without materializing the file, e.g. on an
    // unwritable target. That is a distinct failure from a bad conversion.
    if !output.exists() {
        return Err(TranscodeError::MissingOutput(output));
    }

    info!(input = %input.display(), output = %output.display(), "audio transcoded");
    Ok(output)
}
