//! Continuous V4L2 capture.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture resolution; the driver may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Highest `/dev/videoN` index probed by [`Camera::list_devices`].
const MAX_PROBED_DEVICES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
}

/// Anything that yields frames continuously: a V4L2 camera or a test double.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Negotiated `(width, height)`.
    fn resolution(&self) -> (u32, u32);
}

/// A V4L2 capture device found on the system.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can be read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, the usual webcam format.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// `/dev/videoN` path for a camera index.
pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

/// Streaming V4L2 camera. The device is released when this is dropped.
pub struct Camera {
    // Field order matters: the stream must be torn down before the device.
    stream: MmapStream<'static>,
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a camera by index (`0` → `/dev/video0`).
    pub fn open_index(index: u32) -> Result<Self, CameraError> {
        Self::open(&device_path(index))
    }

    /// Open a capture device by path and start streaming.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
            Some(16) => CameraError::DeviceBusy, // EBUSY
            _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

        let (width, height, fourcc, pixel_format) = negotiate(&device)?;
        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to start streaming: {e}")))?;

        Ok(Self {
            stream,
            _device: device,
            width,
            height,
            device_path: path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture-capable devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_DEVICES).filter_map(probe_device).collect()
    }
}

/// Ask for YUYV at the requested size and accept whatever convertible format
/// the driver settles on.
fn negotiate(device: &Device) -> Result<(u32, u32, FourCC, PixelFormat), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = REQUESTED_WIDTH;
    fmt.height = REQUESTED_HEIGHT;

    let got = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {} (need YUYV, GREY or Y16)",
            got.fourcc
        ))
    })?;

    tracing::info!(width = got.width, height = got.height, fourcc = %got.fourcc, "negotiated format");
    Ok((got.width, got.height, got.fourcc, pixel_format))
}

fn probe_device(index: u32) -> Option<DeviceInfo> {
    let path = device_path(index);
    if !Path::new(&path).exists() {
        return None;
    }
    let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
    caps.capabilities
        .contains(Flags::VIDEO_CAPTURE)
        .then(|| DeviceInfo {
            index,
            path,
            name: caps.card,
            driver: caps.driver,
            bus: caps.bus,
        })
}

impl FrameSource for Camera {
    /// Dequeue the next buffer and convert it to RGB.
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let image = self
            .pixel_format
            .to_rgb(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion: {e}", self.pixel_format)))?;
        Ok(Frame::new(image, sequence))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "releasing camera");
    }
}
