use super::{VideoBackend, VideoSink};
use crate::error::{CaptureError, Result};
use image::RgbImage;
use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

/// Encodes raw RGB frames into a video file through an `ffmpeg` child process
pub struct FfmpegVideoWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FfmpegVideoWriter {
    pub fn new<P: AsRef<Path>>(path: P, width: u32, height: u32, fps: u32) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(
            "Opening video writer at {} ({}x{} @ {} fps)",
            path.display(),
            width,
            height,
            fps
        );

        // Frames arrive as packed rgb24 on stdin
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{}x{}", width, height)])
            .args(["-r", &fps.to_string()])
            .args(["-i", "-"])
            .args(["-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Video(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdin = child.stdin.take();

        Ok(Self {
            child,
            stdin,
            width,
            height,
        })
    }
}

impl VideoSink for FfmpegVideoWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CaptureError::Video("video writer already finished".into()))?;

        // The encoder was told a fixed frame size up front
        let frame = if frame.dimensions() != (self.width, self.height) {
            image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            frame.clone()
        };

        stdin
            .write_all(frame.as_raw())
            .map_err(|e| CaptureError::Video(format!("failed to append frame: {}", e)))
    }

    fn finish(&mut self) -> Result<()> {
        // Closing stdin lets ffmpeg write the container trailer
        if self.stdin.take().is_none() {
            return Ok(());
        }

        let status = self
            .child
            .wait()
            .map_err(|e| CaptureError::Video(format!("failed to wait for ffmpeg: {}", e)))?;

        if status.success() {
            tracing::debug!("Video writer closed");
            Ok(())
        } else {
            Err(CaptureError::Video(format!("ffmpeg exited with {}", status)))
        }
    }
}

impl Drop for FfmpegVideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("Video writer did not close cleanly: {}", e);
        }
    }
}

/// Default backend, one ffmpeg process per recorded run
pub struct FfmpegBackend;

impl VideoBackend for FfmpegBackend {
    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoSink>> {
        let writer = FfmpegVideoWriter::new(path, width, height, fps)?;
        Ok(Box::new(writer))
    }
}
