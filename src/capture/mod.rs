mod session;
mod stream;
mod v4l_capture;

pub use session::CameraSession;
pub use stream::StreamCapture;
pub use v4l_capture::WebcamCapture;

use crate::error::Result;
use image::RgbImage;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Trait for camera capture sources
///
/// A source starts out unopened. The capture routine wraps it in a
/// [`CameraSession`], which guarantees `release` runs once however the
/// routine exits.
pub trait CameraSource {
    /// Connect to the device or stream
    fn open(&mut self) -> Result<()>;

    /// Whether the connection is still delivering frames
    fn is_live(&self) -> bool;

    /// Pull a single frame. A failure here is not fatal by itself.
    fn read_frame(&mut self) -> Result<RgbImage>;

    /// Drop the connection. Must tolerate being called on an unopened source.
    fn release(&mut self);

    /// Frame dimensions, known once the source is open
    fn resolution(&self) -> Option<(u32, u32)>;
}

/// Where frames come from, fixed at configuration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraAddress {
    /// Local capture device by index
    LocalDevice(u32),
    /// Network stream URL, e.g. `rtsp://host:554/main`
    NetworkStream(String),
}

impl FromStr for CameraAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u32>() {
            Ok(index) => CameraAddress::LocalDevice(index),
            Err(_) => CameraAddress::NetworkStream(s.to_string()),
        })
    }
}

impl fmt::Display for CameraAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraAddress::LocalDevice(index) => write!(f, "device {}", index),
            CameraAddress::NetworkStream(url) => f.write_str(url),
        }
    }
}

/// Build an unopened source for `address` that will be read about once
/// per `read_interval`
pub fn create_source(address: &CameraAddress, read_interval: Duration) -> Box<dyn CameraSource> {
    match address {
        CameraAddress::LocalDevice(index) => {
            tracing::debug!("Using local camera device {}", index);
            Box::new(WebcamCapture::new(*index))
        }
        CameraAddress::NetworkStream(url) => {
            tracing::debug!("Using network stream {}", url);
            Box::new(StreamCapture::new(url.clone(), read_interval))
        }
    }
}
