//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, pixel format conversion to RGB and
//! the `FrameSource` / `CaptureDevice` seams the session manager drives.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CaptureDevice, FrameSource, V4lDevice};
