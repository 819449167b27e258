use super::CameraSource;
use crate::error::{CaptureError, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

/// Local webcam opened by device index
pub struct WebcamCapture {
    device_index: u32,
    camera: Option<Camera>,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    pub fn new(device_index: u32) -> Self {
        Self {
            device_index,
            camera: None,
            width: 0,
            height: 0,
        }
    }
}

impl CameraSource for WebcamCapture {
    fn open(&mut self) -> Result<()> {
        tracing::info!("Initializing default camera (webcam) device {}", self.device_index);

        let address = format!("device {}", self.device_index);
        let index = CameraIndex::Index(self.device_index);
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

        let mut camera =
            Camera::new(index, requested).map_err(|e| CaptureError::unavailable(&address, e))?;

        camera
            .open_stream()
            .map_err(|e| CaptureError::unavailable(&address, e))?;

        let resolution = camera.resolution();
        self.width = resolution.width();
        self.height = resolution.height();
        self.camera = Some(camera);

        tracing::info!("Webcam initialized at {}x{}", self.width, self.height);
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.camera
            .as_ref()
            .map(|camera| camera.is_stream_open())
            .unwrap_or(false)
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| CaptureError::Read("camera is not open".into()))?;

        let frame = camera
            .frame()
            .map_err(|e| CaptureError::Read(format!("failed to capture frame: {}", e)))?;

        frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Read(format!("failed to decode frame: {}", e)))
    }

    fn release(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                tracing::warn!("Failed to stop webcam stream: {}", e);
            }
        }
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.camera.as_ref().map(|_| (self.width, self.height))
    }
}
