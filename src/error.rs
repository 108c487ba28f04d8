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

// Error taxonomy for the capture pipeline

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by pipeline components.
///
/// Device loss or unavailability, repeated write failures, bad configuration
/// and crashed tasks are fatal. Everything else is absorbed by the component
/// that produced it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture device '{device}' unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("capture device '{device}' lost after {attempts} consecutive failures")]
    DeviceLost { device: String, attempts: u32 },

    #[error("transient capture failure: {0}")]
    Capture(#[from] CaptureError),

    #[error("write to {path} failed: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("{component} hit {count} consecutive write failures")]
    RepeatedWriteFailures { component: &'static str, count: u32 },

    #[error("failed to delete {path}: {reason}")]
    Delete { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{task} task failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

impl PipelineError {
    /// Whether the error must terminate the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceUnavailable { .. }
                | PipelineError::DeviceLost { .. }
                | PipelineError::RepeatedWriteFailures { .. }
                | PipelineError::Config(_)
                | PipelineError::TaskFailed { .. }
        )
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure reported by a camera device for a single capture attempt.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::DeviceLost {
            device: "stub://cam".to_string(),
            attempts: 3
        }
        .is_fatal());
        assert!(PipelineError::RepeatedWriteFailures {
            component: "recorder",
            count: 5
        }
        .is_fatal());
        assert!(!PipelineError::Capture(CaptureError::Timeout(Duration::from_secs(1))).is_fatal());
        assert!(!PipelineError::write("/tmp/x", "disk full").is_fatal());
        assert!(!PipelineError::Delete {
            path: PathBuf::from("/tmp/x"),
            reason: "gone".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::DeviceLost {
            device: "/dev/video0".to_string(),
            attempts: 3,
        };
        assert!(err.to_string().contains("/dev/video0"));
        assert!(err.to_string().contains("3 consecutive"));
    }
}
