// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;

/// Pixel layout of a raster image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Gray8,
    #[default]
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Rgb8 => "rgb8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gray8" => Ok(PixelFormat::Gray8),
            "rgb8" => Ok(PixelFormat::Rgb8),
            other => Err(format!("unknown pixel format '{}'", other)),
        }
    }
}

/// Packed pixel buffer. Cloning shares the underlying bytes.
#[derive(Debug, Clone)]
pub struct RasterImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl RasterImage {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self, CaptureError> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(CaptureError::Malformed(format!(
                "zero-sized image {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::Malformed(format!(
                "expected {} bytes for {}x{} {}, got {}",
                expected,
                width,
                height,
                format,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luma value (BT.601 weights) of the pixel at `(x, y)`
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let idx = (y as usize * self.width as usize + x as usize) * self.format.bytes_per_pixel();
        match self.format {
            PixelFormat::Gray8 => self.data[idx],
            PixelFormat::Rgb8 => {
                let r = self.data[idx] as u32;
                let g = self.data[idx + 1] as u32;
                let b = self.data[idx + 2] as u32;
                ((r * 299 + g * 587 + b * 114) / 1000) as u8
            }
        }
    }
}

/// One captured image with its capture time and sequence number.
///
/// Frames have no mutating API; every subscriber sees the same pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    captured_at: DateTime<Utc>,
    image: RasterImage,
}

impl Frame {
    pub fn new(sequence: u64, captured_at: DateTime<Utc>, image: RasterImage) -> Self {
        Self {
            sequence,
            captured_at,
            image,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RasterImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn format(&self) -> PixelFormat {
        self.image.format
    }

    pub fn data(&self) -> &[u8] {
        &self.image.data
    }
}
