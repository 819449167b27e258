use super::CameraSource;
use crate::error::{CaptureError, Result};
use image::RgbImage;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

/// Socket timeout handed to ffmpeg/ffprobe, in microseconds
const STREAM_TIMEOUT_US: &str = "10000000";

/// First ffmpeg release whose RTSP `-timeout` is the socket timeout
const RTSP_TIMEOUT_SINCE: u32 = 5;

static FFMPEG_MAJOR: OnceLock<Option<u32>> = OnceLock::new();

/// Network camera stream (RTSP/HTTP) decoded by an `ffmpeg` child process.
///
/// Frame size is probed with `ffprobe` on open; ffmpeg then emits packed
/// rgb24 frames of exactly `width * height * 3` bytes on stdout, already
/// thinned to the rate the caller reads at so the pipe never backs up.
pub struct StreamCapture {
    url: String,
    read_interval: Duration,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    width: u32,
    height: u32,
    frame_len: usize,
}

impl StreamCapture {
    pub fn new(url: String, read_interval: Duration) -> Self {
        Self {
            url,
            read_interval,
            child: None,
            stdout: None,
            width: 0,
            height: 0,
            frame_len: 0,
        }
    }

    fn input_args(&self) -> Vec<&'static str> {
        input_args(&self.url, ffmpeg_major())
    }

    fn probe_resolution(&self) -> Result<(u32, u32)> {
        let output = Command::new("ffprobe")
            .args(["-v", "error"])
            .args(self.input_args())
            .args(["-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height"])
            .args(["-of", "csv=s=x:p=0"])
            .arg(&self.url)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CaptureError::unavailable(&self.url, format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::unavailable(&self.url, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_dimensions(&stdout).ok_or_else(|| {
            CaptureError::unavailable(&self.url, format!("unexpected ffprobe output {:?}", stdout.trim()))
        })
    }
}

/// Installed ffmpeg major version, asked once per process
fn ffmpeg_major() -> Option<u32> {
    *FFMPEG_MAJOR.get_or_init(|| {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        let major = parse_major_version(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!("Detected ffmpeg major version {:?}", major);
        major
    })
}

/// Major version from the first line of `ffmpeg -version`
/// (`ffmpeg version 4.4.2-0ubuntu0.22.04.1 ...`, `ffmpeg version n6.1 ...`)
fn parse_major_version(text: &str) -> Option<u32> {
    let (_, rest) = text.lines().next()?.split_once("version ")?;
    let digits: String = rest
        .trim_start_matches('n')
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Transport and connect-timeout options placed before `-i`.
///
/// Before ffmpeg 5 the RTSP demuxer reads `-timeout` as a listen timeout
/// and switches to listen mode; the socket timeout there is `-stimeout`.
/// Unknown versions get the current spelling.
fn input_args(url: &str, major: Option<u32>) -> Vec<&'static str> {
    if !url.starts_with("rtsp://") {
        return vec!["-timeout", STREAM_TIMEOUT_US];
    }
    let timeout = match major {
        Some(major) if major < RTSP_TIMEOUT_SINCE => "-stimeout",
        _ => "-timeout",
    };
    vec!["-rtsp_transport", "tcp", timeout, STREAM_TIMEOUT_US]
}

/// `fps` filter rate matching one frame per `read_interval`
fn output_rate(read_interval: Duration) -> String {
    format!("fps=1000/{}", read_interval.as_millis().max(1))
}

/// Bytes in one packed rgb24 frame
fn frame_len(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(3)
}

/// Parse ffprobe's `WIDTHxHEIGHT` line
fn parse_dimensions(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().trim_end_matches(',').parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

impl CameraSource for StreamCapture {
    fn open(&mut self) -> Result<()> {
        tracing::info!("Initializing network camera stream {}", self.url);

        let (width, height) = self.probe_resolution()?;
        let frame_len = frame_len(width, height).ok_or_else(|| {
            CaptureError::unavailable(&self.url, format!("frame size {}x{} too large", width, height))
        })?;

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-fflags", "nobuffer"])
            .args(self.input_args())
            .args(["-i", &self.url])
            .args(["-an", "-vf"])
            .arg(output_rate(self.read_interval))
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::unavailable(&self.url, format!("failed to spawn ffmpeg: {}", e)))?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.width = width;
        self.height = height;
        self.frame_len = frame_len;

        tracing::info!("Stream opened at {}x{}", width, height);
        Ok(())
    }

    fn is_live(&self) -> bool {
        // stdout is dropped once a read observes the decoder has exited
        self.child.is_some() && self.stdout.is_some()
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| CaptureError::Read("stream is not open".into()))?;

        let mut buf = vec![0u8; self.frame_len];
        if let Err(e) = stdout.read_exact(&mut buf) {
            // ffmpeg exited; the pipe will not deliver any more frames
            let exited = self
                .child
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten());
            if let Some(status) = exited {
                tracing::warn!("Stream decoder exited with {}", status);
                self.stdout = None;
            }
            return Err(CaptureError::Read(format!("failed to read frame: {}", e)));
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| CaptureError::Read("short frame buffer".into()))
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("ffmpeg already stopped: {}", e);
            }
            if let Err(e) = child.wait() {
                tracing::warn!("Failed to reap ffmpeg: {}", e);
            }
        }
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.child.as_ref().map(|_| (self.width, self.height))
    }
}
