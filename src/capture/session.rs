use super::CameraSource;
use crate::error::Result;
use image::RgbImage;

/// Scoped ownership of one camera for the length of a capture run.
///
/// Wraps the source from the moment the run starts, opened or not, and
/// releases it exactly once: explicitly through [`release`](Self::release)
/// or implicitly on drop.
pub struct CameraSession {
    source: Box<dyn CameraSource>,
    resolution: Option<(u32, u32)>,
    opened: bool,
    released: bool,
}

impl CameraSession {
    pub fn new(source: Box<dyn CameraSource>) -> Self {
        Self {
            source,
            resolution: None,
            opened: false,
            released: false,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.source.open()?;
        self.opened = true;
        self.resolution = self.source.resolution();
        if let Some((width, height)) = self.resolution {
            tracing::debug!("Camera opened at {}x{}", width, height);
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.opened && !self.released && self.source.is_live()
    }

    pub fn read_frame(&mut self) -> Result<RgbImage> {
        self.source.read_frame()
    }

    /// Frame dimensions read once at open time
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::info!("Closing connection to camera");
        self.source.release();
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.release();
    }
}
