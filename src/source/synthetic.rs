// Synthetic camera for development and tests.
//
// Renders a static gradient scene. Scripted frame ranges add a bright moving
// square, scripted attempt ranges fail, and an optional virtual clock stamps
// frames at exact `1/fps` steps instead of the wall clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::ops::RangeInclusive;
use std::time::Duration;

use super::{CameraDevice, CapturedImage};
use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::frame::{PixelFormat, RasterImage};

struct VirtualClock {
    start: DateTime<Utc>,
    step: ChronoDuration,
}

pub struct SyntheticCamera {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    motion: Vec<RangeInclusive<u64>>,
    failures: Vec<RangeInclusive<u64>>,
    frame_limit: Option<u64>,
    clock: Option<VirtualClock>,
    background: Vec<u8>,
    attempts: u64,
    frames: u64,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>, width: u32, height: u32, format: PixelFormat) -> Self {
        let background = render_background(width, height, format);
        Self {
            name: name.into(),
            width,
            height,
            format,
            motion: Vec::new(),
            failures: Vec::new(),
            frame_limit: None,
            clock: None,
            background,
            attempts: 0,
            frames: 0,
        }
    }

    pub fn from_config(name: &str, config: &CameraConfig) -> Self {
        Self::new(name, config.width, config.height, config.pixel_format)
    }

    /// Draw motion on the given 1-based frame numbers
    pub fn with_motion(mut self, frames: RangeInclusive<u64>) -> Self {
        self.motion.push(frames);
        self
    }

    /// Fail the given 1-based capture attempts with a timeout
    pub fn with_failures(mut self, attempts: RangeInclusive<u64>) -> Self {
        self.failures.push(attempts);
        self
    }

    /// Report a disconnect once `frames` frames have been produced
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Stamp frame `n` at `start + (n - 1) / fps`
    pub fn with_virtual_clock(mut self, start: DateTime<Utc>, fps: u32) -> Self {
        let step = ChronoDuration::microseconds(1_000_000 / fps.max(1) as i64);
        self.clock = Some(VirtualClock { start, step });
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames
    }

    fn timestamp(&self, frame_number: u64) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => i64::try_from(frame_number.saturating_sub(1))
                .ok()
                .zip(clock.step.num_microseconds())
                .and_then(|(index, step)| index.checked_mul(step))
                .map(ChronoDuration::microseconds)
                .and_then(|offset| clock.start.checked_add_signed(offset))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => Utc::now(),
        }
    }

    fn render(&self, frame_number: u64) -> Vec<u8> {
        let mut data = self.background.clone();
        if !self.motion.iter().any(|r| r.contains(&frame_number)) {
            return data;
        }

        let side = (self.height / 2).max(1).min(self.width);
        let travel = (self.width - side).max(1) as u64;
        let left = ((frame_number * 7) % travel) as u32;
        let top = (self.height - side) / 2;
        let bpp = self.format.bytes_per_pixel();

        for y in top..top + side {
            let row = (y * self.width) as usize;
            for x in left..left + side {
                let idx = (row + x as usize) * bpp;
                data[idx..idx + bpp].fill(255);
            }
        }
        data
    }
}

fn render_background(width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * format.bytes_per_pixel());
    for y in 0..height {
        for x in 0..width {
            let r = (x * 160 / width.max(1)) as u8;
            let g = (y * 160 / height.max(1)) as u8;
            let b = 64u8;
            match format {
                PixelFormat::Rgb8 => data.extend_from_slice(&[r, g, b]),
                PixelFormat::Gray8 => {
                    data.push(((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8)
                }
            }
        }
    }
    data
}

impl CameraDevice for SyntheticCamera {
    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }

    fn capture(&mut self) -> Result<CapturedImage, CaptureError> {
        self.attempts += 1;
        if self.failures.iter().any(|r| r.contains(&self.attempts)) {
            return Err(CaptureError::Timeout(Duration::from_millis(0)));
        }
        if let Some(limit) = self.frame_limit {
            if self.frames >= limit {
                return Err(CaptureError::Disconnected(format!(
                    "synthetic camera exhausted after {} frames",
                    limit
                )));
            }
        }

        self.frames += 1;
        let frame_number = self.frames;
        let image = RasterImage::new(self.width, self.height, self.format, self.render(frame_number))?;
        Ok(CapturedImage {
            image,
            captured_at: self.timestamp(frame_number),
        })
    }
}
