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

// Configuration types for camera-recorder

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::frame::PixelFormat;
use crate::protocol::{CompressionLevel, CompressionType, FrameCodec};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub recorder: RecorderSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub live: LiveSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Capture device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    /// "stub://<name>" for the synthetic camera, otherwise a raw video stream path
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default)]
    pub pixel_format: PixelFormat,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Sleep between captures so frames are not issued faster than `frame_rate`
    #[serde(default = "default_true")]
    pub pace_to_frame_rate: bool,

    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Consecutive capture failures before the device is considered lost
    #[serde(default = "default_max_capture_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            pixel_format: PixelFormat::default(),
            frame_rate: default_frame_rate(),
            pace_to_frame_rate: true,
            capture_timeout_ms: default_capture_timeout_ms(),
            max_consecutive_failures: default_max_capture_failures(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Per-subscriber queue depths
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Default depth for live viewers and other drop-tolerant subscribers
    #[serde(default = "default_subscriber_depth")]
    pub subscriber_queue_depth: usize,

    #[serde(default = "default_recorder_depth")]
    pub recorder_queue_depth: usize,

    #[serde(default = "default_detector_depth")]
    pub detector_queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: default_subscriber_depth(),
            recorder_queue_depth: default_recorder_depth(),
            detector_queue_depth: default_detector_depth(),
        }
    }
}

/// Segment recorder settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    #[serde(default = "default_segment_dir")]
    pub segment_dir: String,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_seconds: u64,

    #[serde(default)]
    pub codec: FrameCodec,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Applies to the raw codec only
    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default = "default_write_failure_threshold")]
    pub max_consecutive_write_failures: u32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            segment_dir: default_segment_dir(),
            segment_duration_seconds: default_segment_duration(),
            codec: FrameCodec::default(),
            jpeg_quality: default_jpeg_quality(),
            compression: CompressionConfig::default(),
            max_consecutive_write_failures: default_write_failure_threshold(),
        }
    }
}

impl RecorderSettings {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub r#type: CompressionType,

    #[serde(default = "default_compression_level")]
    pub level: u8, // 0-4
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            r#type: CompressionType::default(),
            level: default_compression_level(),
        }
    }
}

impl CompressionConfig {
    pub fn level(&self) -> CompressionLevel {
        CompressionLevel::from_index(self.level).unwrap_or_default()
    }
}

/// Anomaly detector settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    /// Fraction of grid cells (0..1) that must change for a frame to trigger
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Luma difference (0..255) above which a grid cell counts as changed
    #[serde(default = "default_pixel_delta")]
    pub pixel_delta: u8,

    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: f64,

    /// Weight of a quiet frame when blending it into the baseline (0..1]
    #[serde(default = "default_refresh_rate")]
    pub baseline_refresh_rate: f32,

    /// Frames averaged into the baseline before evaluation starts
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    #[serde(default = "default_grid_width")]
    pub grid_width: u32,

    #[serde(default = "default_grid_height")]
    pub grid_height: u32,

    #[serde(default = "default_snapshot_quality")]
    pub snapshot_quality: u8,

    #[serde(default = "default_write_failure_threshold")]
    pub max_consecutive_write_failures: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_dir: default_snapshot_dir(),
            threshold: default_threshold(),
            pixel_delta: default_pixel_delta(),
            cooldown_seconds: default_cooldown(),
            baseline_refresh_rate: default_refresh_rate(),
            warmup_frames: default_warmup_frames(),
            grid_width: default_grid_width(),
            grid_height: default_grid_height(),
            snapshot_quality: default_snapshot_quality(),
            max_consecutive_write_failures: default_write_failure_threshold(),
        }
    }
}

impl DetectorSettings {
    /// Out-of-range values saturate instead of panicking
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Live MJPEG feed settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveSettings {
    /// Histogram-equalize luma and apply a gamma curve before encoding
    #[serde(default = "default_true")]
    pub enhance_low_light: bool,

    #[serde(default = "default_gamma")]
    pub gamma: f32,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            enhance_low_light: true,
            gamma: default_gamma(),
        }
    }
}

impl LiveSettings {
    /// Gamma to apply, or `None` when enhancement is off
    pub fn enhancement(&self) -> Option<f32> {
        self.enhance_low_light.then_some(self.gamma)
    }
}

/// Limits for one managed category. Unset limits are not enforced.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CategoryPolicy {
    #[serde(default)]
    pub max_age_seconds: Option<u64>,

    #[serde(default)]
    pub max_count: Option<usize>,
}

impl CategoryPolicy {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_seconds.map(Duration::from_secs)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age_seconds.is_none() && self.max_count.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionSettings {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,

    #[serde(default = "default_segment_policy")]
    pub segments: CategoryPolicy,

    #[serde(default = "default_snapshot_policy")]
    pub snapshots: CategoryPolicy,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            scan_interval_seconds: default_scan_interval(),
            segments: default_segment_policy(),
            snapshots: default_snapshot_policy(),
        }
    }
}

impl RetentionSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Time each component gets to drain and finish after shutdown is signalled
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_device() -> String { "stub://camera0".to_string() }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_frame_rate() -> u32 { 10 }
fn default_capture_timeout_ms() -> u64 { 2000 }
fn default_max_capture_failures() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 100 }
fn default_subscriber_depth() -> usize { 3 }
fn default_recorder_depth() -> usize { 64 }
fn default_detector_depth() -> usize { 4 }
fn default_segment_dir() -> String { "videos".to_string() }
fn default_segment_duration() -> u64 { 30 * 60 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_compression_level() -> u8 { 2 }
fn default_write_failure_threshold() -> u32 { 5 }
fn default_snapshot_dir() -> String { "anomalies".to_string() }
fn default_threshold() -> f32 { 0.065 }
fn default_pixel_delta() -> u8 { 25 }
fn default_cooldown() -> f64 { 5.0 }
fn default_refresh_rate() -> f32 { 0.05 }
fn default_warmup_frames() -> u32 { 5 }
fn default_grid_width() -> u32 { 64 }
fn default_grid_height() -> u32 { 48 }
fn default_snapshot_quality() -> u8 { 90 }
fn default_gamma() -> f32 { 1.5 }
fn default_scan_interval() -> u64 { 300 }
fn default_segment_policy() -> CategoryPolicy {
    CategoryPolicy { max_age_seconds: Some(12 * 60 * 60), max_count: None }
}
fn default_snapshot_policy() -> CategoryPolicy {
    CategoryPolicy { max_age_seconds: Some(12 * 60 * 60), max_count: Some(2000) }
}
fn default_grace_period() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
