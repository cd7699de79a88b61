use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Axis-aligned face rectangle in frame pixel coordinates, corner form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BoundingBox {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        (self.x1 - self.x0).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y1 - self.y0).max(0) as u32
    }

    /// Largest per-edge offset between two boxes.
    pub fn max_edge_delta(&self, other: &BoundingBox) -> u32 {
        [
            self.x0.abs_diff(other.x0),
            self.y0.abs_diff(other.y0),
            self.x1.abs_diff(other.x1),
            self.y1.abs_diff(other.y1),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// True when every edge lies within `tolerance` pixels of the other box's edge.
    pub fn is_near(&self, other: &BoundingBox, tolerance: u32) -> bool {
        self.max_edge_delta(other) <= tolerance
    }

    /// Clamp the box to an image of the given dimensions.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let w = width as i32;
        let h = height as i32;
        BoundingBox {
            x0: self.x0.clamp(0, w),
            y0: self.y0.clamp(0, h),
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{},{}]", self.x0, self.y0, self.x1, self.y1)
    }
}

/// Target face size every training image and live face crop is resized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        (self.width * self.height) as usize
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(100, 100)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unable to parse image size '{0}': expected WIDTHxHEIGHT")]
pub struct ParseSizeError(pub String);

impl FromStr for ImageSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSizeError(s.to_string());
        let (w, h) = s.split_once('x').ok_or_else(err)?;
        let width: u32 = w.trim().parse().map_err(|_| err())?;
        let height: u32 = h.trim().parse().map_err(|_| err())?;
        if width == 0 || height == 0 {
            return Err(err());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resolved identity of a detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn name(&self) -> &str {
        match self {
            Identity::Known(name) => name,
            Identity::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One candidate face found in a frame, after the model has scored it.
///
/// Lives for a single frame only.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: usize,
    /// Distance to the nearest trained sample. Lower = more similar.
    pub distance: f32,
    /// Variance of the Laplacian over the face crop. Higher = sharper.
    pub blur_score: f64,
}
