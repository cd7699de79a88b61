//! Camera capture over V4L2.
//!
//! The mmap stream is opened once and kept for the life of the camera, so
//! the pipeline pays the buffer setup cost only at startup.

use crate::frame::{self, Frame};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Device indices scanned by [`Camera::list_devices`].
const MAX_SCANNED_DEVICES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no capture device at {0}")]
    NotFound(String),
    #[error("{path} is busy")]
    Busy { path: String },
    #[error("{0} cannot capture video")]
    NotCaptureDevice(String),
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Anything that yields grayscale frames, one per call.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// A capture-capable device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can hand us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2; luma is every other byte.
    Yuyv,
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
                .map_err(|e| CameraError::CaptureFailed(e.to_string())),
            Self::Grey => {
                let pixels = (width * height) as usize;
                buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!("short GREY buffer: {} of {pixels} bytes", buf.len()))
                })
            }
        }
    }
}

pub struct Camera {
    stream: MmapStream<'static>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    _device: Device,
}

/// `/dev/video<index>`
pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

impl Camera {
    /// Open `/dev/video<index>`.
    pub fn open_index(index: u32) -> Result<Self, CameraError> {
        Self::open(&device_path(index))
    }

    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::NotFound(path.to_string()));
        }
        let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
            Some(16) => CameraError::Busy { path: path.to_string() },
            _ => CameraError::NotFound(format!("{path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(path.to_string()));
        }

        let (width, height, format) = negotiate(&device)?;
        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width,
            height,
            format = ?format,
            "camera streaming"
        );
        Ok(Self {
            stream,
            device_path: path.to_string(),
            width,
            height,
            format,
            _device: device,
        })
    }

    /// Dequeue one buffer and convert it to a grayscale frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let data = self.format.luma(buf, self.width, self.height)?;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Capture devices among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<CaptureDevice> {
        (0..MAX_SCANNED_DEVICES)
            .map(device_path)
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| CaptureDevice {
                        path,
                        card: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Ask for 640x480 YUYV and accept whatever luma-bearing format the driver
/// settles on.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut requested = device
        .format()
        .map_err(|e| CameraError::CaptureFailed(format!("read format: {e}")))?;
    requested.fourcc = FourCC::new(b"YUYV");
    requested.width = REQUEST_WIDTH;
    requested.height = REQUEST_HEIGHT;
    let actual = device
        .set_format(&requested)
        .map_err(|e| CameraError::CaptureFailed(format!("set format: {e}")))?;
    let format = PixelFormat::from_fourcc(actual.fourcc)
        .ok_or_else(|| CameraError::UnsupportedFormat(actual.fourcc.to_string()))?;
    Ok((actual.width, actual.height, format))
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}
