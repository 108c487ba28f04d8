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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compression level (0-4) for raw segment payloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest = 0,
    Fast = 1,
    #[default]
    Default = 2,
    Slow = 3,
    Slowest = 4,
}

impl CompressionLevel {
    pub fn from_index(level: u8) -> Option<Self> {
        match level {
            0 => Some(CompressionLevel::Fastest),
            1 => Some(CompressionLevel::Fast),
            2 => Some(CompressionLevel::Default),
            3 => Some(CompressionLevel::Slow),
            4 => Some(CompressionLevel::Slowest),
            _ => None,
        }
    }

    pub fn to_zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 10,
            CompressionLevel::Slowest => 19,
        }
    }

    pub fn to_lz4_level(self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 9,
            CompressionLevel::Slowest => 12,
        }
    }
}

/// Compression type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }
}

/// How frames are stored inside a segment file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    #[default]
    Jpeg,
    Raw,
}

impl FrameCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameCodec::Jpeg => "jpeg",
            FrameCodec::Raw => "raw",
        }
    }
}

/// Lifecycle of the whole pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Liveness report handed to the HTTP boundary.
///
/// Carries no error text: viewers only learn whether the stream
/// and gallery are usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: PipelineState,
    pub stream_available: bool,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub segments_closed: u64,
    pub segments_abandoned: u64,
    pub anomalies_detected: u64,
    pub retention_deletions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// A finalized segment as seen by the recorder and the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentInfo {
    pub start: DateTime<Utc>,
    pub path: PathBuf,
    #[serde(default)]
    pub frames: Option<u64>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// A single detected deviation and its evidence snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyEvent {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub snapshot: PathBuf,
    pub score: f32,
    pub threshold: f32,
}
