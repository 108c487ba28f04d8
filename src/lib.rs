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

// Continuous single-camera recorder
//
// A long-running capture pipeline that:
// - Captures frames from one camera at a fixed target rate
// - Fans frames out to consumers through bounded drop-oldest queues
// - Records fixed-duration segments with rename-based visibility
// - Detects frame-difference anomalies and keeps evidence snapshots
// - Evicts old segments and snapshots by age and count

pub mod bus;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod live;
pub mod naming;
pub mod pipeline;
pub mod protocol;
pub mod recorder;
pub mod retention;
pub mod source;
pub mod status;
pub mod storage;

// Re-export main types
pub use bus::{FrameBus, OverflowPolicy, Subscription};
pub use catalog::{Catalog, Page};
pub use config::{load_config, load_config_with_env, RecorderConfig};
pub use detector::{AnomalyDetector, DetectorState};
pub use error::{CaptureError, PipelineError};
pub use frame::{Frame, PixelFormat, RasterImage};
pub use live::LiveFeed;
pub use pipeline::{Pipeline, PipelineBuilder, ShutdownHandle};
pub use protocol::{AnomalyEvent, PipelineState, SegmentInfo, StatusResponse};
pub use recorder::{FrameOutcome, SegmentRecorder};
pub use retention::{RetentionManager, RetentionReport};
pub use source::{CameraDevice, FrameSource};
