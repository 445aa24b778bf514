//! Capture seams: an opened frame producer and the device that opens it.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;

/// A blocking producer of camera frames. Each call waits for the next frame.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// An exclusively-owned capture device. `open` acquires it; dropping the
/// returned source releases it.
pub trait CaptureDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;

    /// Human-readable device identifier for logs.
    fn name(&self) -> &str;
}

/// A V4L2 device opened at a fixed path and resolution.
#[derive(Debug, Clone)]
pub struct V4lDevice {
    path: String,
    width: u32,
    height: u32,
}

impl V4lDevice {
    pub fn new(path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
        }
    }
}

impl CaptureDevice for V4lDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.path, self.width, self.height)?;
        tracing::info!(
            device = %self.path,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera acquired"
        );
        Ok(Box::new(camera.into_stream()?))
    }

    fn name(&self) -> &str {
        &self.path
    }
}
