use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FrameError, RequestError};

// MARK: - SessionId

/// Identifies one capture session from start request to terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// MARK: - TargetGeometry

/// Display geometry captured by a session. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetGeometry {
    pub width: u32,
    pub height: u32,
    /// Display density in dpi.
    pub density: u32,
}

impl TargetGeometry {
    pub fn new(width: u32, height: u32, density: u32) -> Self {
        Self { width, height, density }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.width == 0 || self.height == 0 {
            return Err(RequestError::InvalidGeometry { width: self.width, height: self.height });
        }
        Ok(())
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for TargetGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}@{}dpi", self.width, self.height, self.density)
    }
}

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Red, Green, Blue, Alpha.
    Rgba8888,
    /// Blue, Green, Red, unused (GStreamer `BGRx`).
    Bgrx8888,
}

impl PixelFormat {
    /// Byte offsets of the red, green and blue channels inside one pixel.
    pub fn rgb_offsets(&self) -> [usize; 3] {
        match self {
            Self::Rgba8888 => [0, 1, 2],
            Self::Bgrx8888 => [2, 1, 0],
        }
    }
}

// MARK: - Frame

/// Raw pixel buffer delivered by a frame source.
///
/// The layout is checked once in [`Frame::new`]; every in-bounds pixel lookup
/// after that is guaranteed to stay inside `data`.
#[derive(Clone)]
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    pixel_stride: u32,
    row_stride: u32,
    format: PixelFormat,
    sequence: u64,
}

impl Frame {
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        pixel_stride: u32,
        row_stride: u32,
        format: PixelFormat,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        if pixel_stride < 3 {
            return Err(FrameError::PixelStrideTooSmall(pixel_stride));
        }
        let packed_row = width as u64 * pixel_stride as u64;
        if (row_stride as u64) < packed_row {
            return Err(FrameError::RowStrideTooSmall { row_stride, min: packed_row });
        }
        let required = (height as u64 - 1) * row_stride as u64 + packed_row;
        if (data.len() as u64) < required {
            return Err(FrameError::BufferTooShort { len: data.len(), required });
        }
        Ok(Self { data, width, height, pixel_stride, row_stride, format, sequence: 0 })
    }

    /// A tightly packed 4-byte-per-pixel frame.
    pub fn packed(data: Bytes, width: u32, height: u32, format: PixelFormat) -> Result<Self, FrameError> {
        Self::new(data, width, height, 4, width.saturating_mul(4), format)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn pixel_stride(&self) -> u32 { self.pixel_stride }
    pub fn row_stride(&self) -> u32 { self.row_stride }
    pub fn format(&self) -> PixelFormat { self.format }
    pub fn data(&self) -> &Bytes { &self.data }

    /// Delivery order within one subscription, starting at 1.
    pub fn sequence(&self) -> u64 { self.sequence }

    /// Bytes of padding at the end of every row.
    pub fn row_padding(&self) -> usize {
        (self.row_stride - self.width * self.pixel_stride) as usize
    }

    /// Red, green and blue of the pixel at `(x, y)`. Panics when out of bounds.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) outside {}x{}", self.width, self.height);
        let base = y as usize * self.row_stride as usize + x as usize * self.pixel_stride as usize;
        let [r, g, b] = self.format.rgb_offsets();
        [self.data[base + r], self.data[base + g], self.data[base + b]]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_stride", &self.pixel_stride)
            .field("row_stride", &self.row_stride)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}
