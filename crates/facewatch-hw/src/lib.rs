//! facewatch-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based continuous capture behind the [`FrameSource`] trait
//! and pixel-format conversion to RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{device_path, Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
