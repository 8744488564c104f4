//! Decoded video frames and regions of interest.

use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, OcrError};

/// Represents a single decoded image frame.
///
/// # Storage
/// Pixels are stored row-major as raw bytes (`Vec<u8>`), `channels` bytes per pixel:
/// - 1 channel: 8-bit grayscale.
/// - 3 channels: 8-bit RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bytes per pixel (1 or 3)
    pub channels: u8,

    /// Raw pixel data
    pub data: Vec<u8>,

    /// Position of this frame in the source's grab sequence
    pub sequence: u64,
}

impl Frame {
    /// Create a frame from raw bytes, checking the buffer length against the geometry.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> AppResult<Self> {
        if channels != 1 && channels != 3 {
            return Err(OcrError::Capture(format!(
                "unsupported channel count {channels}"
            )));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(OcrError::Capture(format!(
                "frame buffer holds {} bytes, expected {expected} for {width}x{height}x{channels}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
            sequence: 0,
        })
    }

    /// Create an 8-bit grayscale frame filled with a single value.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            channels: 1,
            data: vec![value; width as usize * height as usize],
            sequence: 0,
        }
    }

    /// True when the frame holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Number of bytes in one row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Pixel bytes at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = y as usize * self.stride() + x as usize * self.channels as usize;
        self.data.get(start..start + self.channels as usize)
    }

    /// Copy out the given region.
    ///
    /// A full-frame region returns a copy of the whole frame. The region must lie
    /// entirely inside the frame.
    pub fn crop(&self, region: &Region) -> AppResult<Frame> {
        if region.is_full_frame() {
            return Ok(self.clone());
        }
        if !region.fits_within(self.width, self.height) {
            return Err(OcrError::RegionOutOfBounds {
                region: *region,
                width: self.width,
                height: self.height,
            });
        }

        let channels = self.channels as usize;
        let row_len = region.width as usize * channels;
        let mut data = Vec::with_capacity(row_len * region.height as usize);
        for row in region.y..region.y + region.height {
            let start = row as usize * self.stride() + region.x as usize * channels;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(Frame {
            width: region.width,
            height: region.height,
            channels: self.channels,
            data,
            sequence: self.sequence,
        })
    }

    /// Encode as binary PNM (P5 for grayscale, P6 for RGB).
    pub fn to_pnm(&self) -> Vec<u8> {
        let magic = if self.channels == 1 { "P5" } else { "P6" };
        let header = format!("{magic}\n{} {}\n255\n", self.width, self.height);
        let mut out = Vec::with_capacity(header.len() + self.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Write the frame to `path` as a PNM image.
    pub fn write_pnm(&self, path: &Path) -> AppResult<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_pnm())?;
        Ok(())
    }
}

/// Rectangular region of interest in pixel coordinates.
///
/// A zero width or height means "the whole frame".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width in pixels (0 = full frame)
    pub width: u32,
    /// Height in pixels (0 = full frame)
    pub height: u32,
}

impl Region {
    /// Create a region from its corner and extent.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole-frame region.
    pub const fn full_frame() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// True when no cropping should happen.
    pub fn is_full_frame(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when the region lies inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = u64::from(self.x) + u64::from(self.width);
        let bottom = u64::from(self.y) + u64::from(self.height);
        right <= u64::from(width) && bottom <= u64::from(height)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x:{} y:{} width:{} height:{}",
            self.x, self.y, self.width, self.height
        )
    }
}
