//! jarvis-hw: camera capture, frame preprocessing and speech output.
//!
//! Provides V4L2-based camera access, the grayscale image operations the
//! frame pipeline needs, and the network TTS + `mpg123` speech backend.

pub mod camera;
pub mod frame;
pub mod speech;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;
pub use speech::CloudSpeech;
