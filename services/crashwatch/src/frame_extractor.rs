//! Frame extraction through an external ffmpeg process.
//!
//! ffmpeg is a black box here: video bytes and a frame rate go in, numbered
//! JPEG files come out. The zero-padded output names carry emission order,
//! so a lexicographic sort recovers it.

use crate::config::FrameRate;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Output file name pattern handed to ffmpeg
const FRAME_PATTERN: &str = "frame_%06d.jpg";
const FRAME_FILE_PREFIX: &str = "frame_";
const FRAME_FILE_EXTENSION: &str = "jpg";

/// Decomposes a video into an ordered sequence of still images.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Extract frames at `frame_rate` frames per second of source video.
    ///
    /// Returns at least one frame, in emission order.
    async fn extract(
        &self,
        video: &[u8],
        frame_rate: FrameRate,
    ) -> Result<Vec<Vec<u8>>, PipelineError>;
}

/// Extractor running the ffmpeg binary in a scratch directory
pub struct FfmpegExtractor {
    ffmpeg_path: String,
}

impl FfmpegExtractor {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        output_dir: &Path,
        frame_rate: FrameRate,
    ) -> Result<(), PipelineError> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(format!("fps={frame_rate}"))
            .arg(output_dir.join(FRAME_PATTERN))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PipelineError::Extraction(format!("failed to spawn {}: {e}", self.ffmpeg_path))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "ffmpeg failed");
            return Err(PipelineError::Extraction(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                last_line(&stderr)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    #[instrument(skip(self, video), fields(video_bytes = video.len(), frame_rate = %frame_rate))]
    async fn extract(
        &self,
        video: &[u8],
        frame_rate: FrameRate,
    ) -> Result<Vec<Vec<u8>>, PipelineError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| PipelineError::Extraction(format!("failed to create scratch dir: {e}")))?;

        let input = scratch.path().join("input");
        let output_dir = scratch.path().join("frames");

        tokio::fs::write(&input, video)
            .await
            .map_err(|e| PipelineError::Extraction(format!("failed to stage video: {e}")))?;
        tokio::fs::create_dir(&output_dir)
            .await
            .map_err(|e| PipelineError::Extraction(format!("failed to create frame dir: {e}")))?;

        self.run_ffmpeg(&input, &output_dir, frame_rate).await?;

        let paths = list_frame_files(&output_dir).await?;
        if paths.is_empty() {
            return Err(PipelineError::Extraction(
                "ffmpeg produced no frames".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let data = tokio::fs::read(path).await.map_err(|e| {
                PipelineError::Extraction(format!("failed to read {}: {e}", path.display()))
            })?;
            frames.push(data);
        }

        info!(frames = frames.len(), "Frames extracted");
        Ok(frames)
    }
}

/// Frame files in `dir`, sorted into emission order
async fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PipelineError::Extraction(format!("failed to read frame dir: {e}")))?;

    let mut frames = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::Extraction(format!("failed to read frame dir: {e}")))?
    {
        let path = entry.path();
        if is_frame_file(&path) {
            frames.push(path);
        } else {
            debug!(path = %path.display(), "Ignoring unexpected file");
        }
    }

    frames.sort();
    Ok(frames)
}

fn is_frame_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FRAME_FILE_PREFIX))
        .unwrap_or(false);
    let extension_matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(FRAME_FILE_EXTENSION))
        .unwrap_or(false);
    name_matches && extension_matches
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("no diagnostic output")
}

/// Prefix under which every frame of `video_key` is stored:
/// `<prefix>/<video-basename>/`
pub fn frame_prefix(prefix: &str, video_key: &str) -> String {
    let basename = video_key.rsplit('/').next().unwrap_or(video_key);
    format!("{prefix}/{basename}/")
}

/// Storage key of the frame at 1-based `ordinal` within `video_key`
pub fn frame_key(prefix: &str, video_key: &str, ordinal: usize) -> String {
    format!(
        "{}{FRAME_FILE_PREFIX}{ordinal:06}.{FRAME_FILE_EXTENSION}",
        frame_prefix(prefix, video_key)
    )
}
