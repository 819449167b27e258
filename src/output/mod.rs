mod video;

pub use video::FfmpegBackend;

use crate::error::{CaptureError, Result};
use chrono::{Datelike, NaiveDateTime, Timelike};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Destination for frames recorded into a video artifact
pub trait VideoSink {
    /// Append a frame to the video
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the artifact. Safe to call more than once.
    fn finish(&mut self) -> Result<()>;
}

/// Creates video sinks for a capture run
pub trait VideoBackend {
    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoSink>>;
}

/// Return `base_dir/year/month/day` for `now`, creating it if missing.
pub fn ensure_daily_path(base_dir: &Path, now: NaiveDateTime) -> Result<PathBuf> {
    let path = base_dir
        .join(now.year().to_string())
        .join(now.month().to_string())
        .join(now.day().to_string());

    if path.is_dir() {
        tracing::debug!("Directory already exists for {}", now.date());
    } else {
        tracing::info!("Creating new directory for {}", now.date());
    }

    std::fs::create_dir_all(&path).map_err(|source| CaptureError::Directory {
        path: path.clone(),
        source,
    })?;

    Ok(path)
}

/// `12pm`, `3pm`, `9am`. Midnight is `0am`.
pub fn hour_bucket(hour: u32) -> String {
    match hour {
        12 => "12pm".to_string(),
        h if h > 12 => format!("{}pm", h - 12),
        h => format!("{}am", h),
    }
}

/// Deterministic artifact names for one capture run.
///
/// The date and hour bucket are fixed when the run starts, so a run that
/// crosses an hour boundary keeps writing into the same bucket.
#[derive(Debug, Clone)]
pub struct ArtifactNames {
    dir: PathBuf,
    prefix: String,
}

impl ArtifactNames {
    pub fn new(dir: &Path, started: NaiveDateTime) -> Self {
        let prefix = format!(
            "{}_{}",
            started.format("%Y_%m_%d"),
            hour_bucket(started.hour())
        );
        Self {
            dir: dir.to_path_buf(),
            prefix,
        }
    }

    /// Still image path; `sequence` starts at 1.
    pub fn snapshot(&self, sequence: u32) -> PathBuf {
        self.dir
            .join(format!("{}_snapshot_{}.png", self.prefix, sequence))
    }

    pub fn video(&self, container: &str) -> PathBuf {
        self.dir.join(format!("{}_video.{}", self.prefix, container))
    }
}
