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

// Frame source
//
// Wraps a camera device and turns its images into sequence-numbered frames.
// The source is not shareable: exactly one capture thread owns it and calls
// `next_frame` in a loop.

pub mod raw_stream;
pub mod synthetic;

pub use raw_stream::RawStreamCamera;
pub use synthetic::SyntheticCamera;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::FrameBus;
use crate::config::CameraConfig;
use crate::error::{CaptureError, PipelineError};
use crate::frame::{Frame, RasterImage};
use crate::status::StatusTracker;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// One image as delivered by a device
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub image: RasterImage,
    pub captured_at: DateTime<Utc>,
}

/// A physical (or simulated) camera.
///
/// `capture` may block up to the device timeout and must return the newest
/// image available, never a backlog.
pub trait CameraDevice: Send {
    fn describe(&self) -> String;

    fn capture(&mut self) -> Result<CapturedImage, CaptureError>;
}

/// Open the device named by the configuration.
///
/// `stub://<name>` selects the synthetic camera; anything else is treated as
/// a raw video stream path.
pub fn open_device(config: &CameraConfig) -> Result<Box<dyn CameraDevice>, PipelineError> {
    if let Some(name) = config.device.strip_prefix("stub://") {
        info!("Using synthetic camera '{}'", name);
        return Ok(Box::new(SyntheticCamera::from_config(name, config)));
    }
    Ok(Box::new(RawStreamCamera::open(config)?))
}

/// Retry and pacing behaviour of a `FrameSource`
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub max_consecutive_failures: u32,
    pub retry_backoff: Duration,
    /// Minimum spacing between issued frames, if pacing is enabled
    pub frame_interval: Option<Duration>,
}

impl SourceOptions {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            retry_backoff: config.retry_backoff(),
            frame_interval: config.pace_to_frame_rate.then(|| config.frame_interval()),
        }
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            retry_backoff: Duration::from_millis(100),
            frame_interval: None,
        }
    }
}

pub struct FrameSource {
    device: Box<dyn CameraDevice>,
    device_name: String,
    options: SourceOptions,
    next_sequence: u64,
    consecutive_failures: u32,
    last_issued: Option<Instant>,
}

impl FrameSource {
    /// Open the configured device. Fails with `DeviceUnavailable`.
    pub fn open(config: &CameraConfig) -> Result<Self, PipelineError> {
        let device = open_device(config)?;
        Ok(Self::new(device, SourceOptions::from_config(config)))
    }

    pub fn new(device: Box<dyn CameraDevice>, options: SourceOptions) -> Self {
        let device_name = device.describe();
        Self {
            device,
            device_name,
            options,
            next_sequence: 1,
            consecutive_failures: 0,
            last_issued: None,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Capture the next frame.
    ///
    /// A failed capture is reported as `PipelineError::Capture` until the
    /// failure budget is used up, after which it becomes `DeviceLost`.
    pub fn next_frame(&mut self) -> Result<Frame, PipelineError> {
        self.pace();

        match self.device.capture() {
            Ok(captured) => {
                self.consecutive_failures = 0;
                self.last_issued = Some(Instant::now());
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                Ok(Frame::new(sequence, captured.captured_at, captured.image))
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.options.max_consecutive_failures {
                    error!(
                        "Device '{}' failed {} times in a row: {}",
                        self.device_name, self.consecutive_failures, e
                    );
                    Err(PipelineError::DeviceLost {
                        device: self.device_name.clone(),
                        attempts: self.consecutive_failures,
                    })
                } else {
                    Err(PipelineError::Capture(e))
                }
            }
        }
    }

    /// Backoff before the next attempt, doubling per consecutive failure
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        self.options
            .retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }

    fn pace(&self) {
        if let (Some(interval), Some(last)) = (self.options.frame_interval, self.last_issued) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }
}

/// Sleep for `delay`, waking early if shutdown is signalled
fn sleep_unless_shutdown(delay: Duration, shutdown: &watch::Receiver<bool>) {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if *shutdown.borrow() {
            return;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Capture loop run on the dedicated capture thread.
///
/// Publishes every frame to the bus until shutdown is signalled or the device
/// is lost, and always closes the bus on the way out so subscribers drain.
pub fn run_capture_loop(
    mut source: FrameSource,
    bus: FrameBus,
    shutdown: watch::Receiver<bool>,
    status: Arc<StatusTracker>,
) -> Result<u64, PipelineError> {
    info!("Capture loop started on '{}'", source.device_name());
    let mut published = 0u64;

    let result = loop {
        if *shutdown.borrow() {
            break Ok(published);
        }

        match source.next_frame() {
            Ok(frame) => {
                status.record_frame(frame.captured_at());
                if bus.publish(frame) {
                    published += 1;
                }
            }
            Err(PipelineError::Capture(e)) => {
                status.record_capture_failure();
                let delay = source.retry_delay();
                warn!(
                    "Capture failed on '{}' (attempt {}): {}. Retrying in {:?}",
                    source.device_name(),
                    source.consecutive_failures(),
                    e,
                    delay
                );
                sleep_unless_shutdown(delay, &shutdown);
            }
            Err(fatal) => {
                status.record_capture_failure();
                break Err(fatal);
            }
        }
    };

    bus.close();
    match &result {
        Ok(count) => info!("Capture loop stopped after {} frames", count),
        Err(e) => error!("Capture loop terminated: {}", e),
    }
    debug!("Bus stats at capture exit: {:?}", bus.stats());
    result
}
