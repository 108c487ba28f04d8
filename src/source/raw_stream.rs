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

//! Camera backed by a raw video stream.
//!
//! Reads back-to-back packed frames of `width * height * bytes_per_pixel`
//! bytes from a file or FIFO, for example the output of
//! `ffmpeg -f v4l2 -i /dev/video0 -f rawvideo -pix_fmt rgb24 /run/camera.fifo`.
//! A reader thread keeps at most two frames in flight and discards the older
//! one when full, so `capture` always sees the newest image.

use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CameraDevice, CapturedImage};
use crate::config::CameraConfig;
use crate::error::{CaptureError, PipelineError};
use crate::frame::{PixelFormat, RasterImage};

const CHANNEL_DEPTH: usize = 2;

enum ReaderEvent {
    Frame(CapturedImage),
    Failed(String),
}

pub struct RawStreamCamera {
    path: String,
    timeout: Duration,
    frames: Receiver<ReaderEvent>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    ended: bool,
}

impl RawStreamCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, PipelineError> {
        let file = File::open(&config.device).map_err(|e| PipelineError::DeviceUnavailable {
            device: config.device.clone(),
            reason: e.to_string(),
        })?;
        info!(
            "Opened raw stream {} ({}x{} {})",
            config.device, config.width, config.height, config.pixel_format
        );
        Ok(Self::from_reader(
            config.device.clone(),
            file,
            config.width,
            config.height,
            config.pixel_format,
            config.capture_timeout(),
        ))
    }

    /// Wrap any byte stream carrying packed frames
    pub fn from_reader<R: Read + Send + 'static>(
        path: String,
        reader: R,
        width: u32,
        height: u32,
        format: PixelFormat,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = channel::bounded(CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let frame_len = width as usize * height as usize * format.bytes_per_pixel();

        let thread_stop = stop.clone();
        let drain = rx.clone();
        let reader = std::thread::Builder::new()
            .name("raw-stream-reader".to_string())
            .spawn(move || {
                read_frames(reader, frame_len, width, height, format, tx, drain, thread_stop)
            })
            .map_err(|e| warn!("Failed to spawn raw stream reader: {}", e))
            .ok();

        Self {
            path,
            timeout,
            frames: rx,
            stop,
            reader,
            ended: false,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn read_frames<R: Read>(
    mut reader: R,
    frame_len: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    tx: Sender<ReaderEvent>,
    drain: Receiver<ReaderEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let mut buffer = vec![0u8; frame_len];
        let event = match reader.read_exact(&mut buffer) {
            Ok(()) => match RasterImage::new(width, height, format, buffer) {
                Ok(image) => ReaderEvent::Frame(CapturedImage {
                    image,
                    captured_at: Utc::now(),
                }),
                Err(e) => ReaderEvent::Failed(e.to_string()),
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                ReaderEvent::Failed("end of stream".to_string())
            }
            Err(e) => ReaderEvent::Failed(e.to_string()),
        };
        let terminal = matches!(event, ReaderEvent::Failed(_));

        let mut pending = event;
        loop {
            match tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    // Keep the newest: evict the oldest queued frame
                    let _ = drain.try_recv();
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }

        if terminal {
            break;
        }
    }
    debug!("Raw stream reader exiting");
}

impl CameraDevice for RawStreamCamera {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn capture(&mut self) -> Result<CapturedImage, CaptureError> {
        if self.ended {
            return Err(CaptureError::Disconnected(format!("{} closed", self.path)));
        }

        let mut newest = match self.frames.recv_timeout(self.timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Err(CaptureError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.ended = true;
                return Err(CaptureError::Disconnected(format!("{} closed", self.path)));
            }
        };

        // Skip anything older than the latest queued frame
        while let ReaderEvent::Frame(_) = newest {
            match self.frames.try_recv() {
                Ok(ReaderEvent::Failed(reason)) => {
                    debug!("Raw stream {} ended: {}", self.path, reason);
                    self.ended = true;
                    break;
                }
                Ok(next) => newest = next,
                Err(_) => break,
            }
        }

        match newest {
            ReaderEvent::Frame(captured) => Ok(captured),
            ReaderEvent::Failed(reason) => {
                self.ended = true;
                Err(CaptureError::Disconnected(reason))
            }
        }
    }
}

impl Drop for RawStreamCamera {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // The reader may be parked in a blocking read; it exits on its next wakeup
        self.reader.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_packed_frames() {
        let mut bytes = vec![10u8; 4];
        bytes.extend(vec![20u8; 4]);
        let mut camera = RawStreamCamera::from_reader(
            "cursor".to_string(),
            Cursor::new(bytes),
            2,
            2,
            PixelFormat::Gray8,
            Duration::from_secs(1),
        );

        // Both frames are buffered before the first capture; only the newest is returned
        std::thread::sleep(Duration::from_millis(50));
        let frame = camera.capture().unwrap();
        assert_eq!(frame.image.data(), &[20u8; 4]);
        assert!(matches!(camera.capture(), Err(CaptureError::Disconnected(_))));
        assert!(matches!(camera.capture(), Err(CaptureError::Disconnected(_))));
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let config = CameraConfig {
            device: "/nonexistent/camera.raw".to_string(),
            ..CameraConfig::default()
        };
        assert!(matches!(
            RawStreamCamera::open(&config),
            Err(PipelineError::DeviceUnavailable { .. })
        ));
    }
}
