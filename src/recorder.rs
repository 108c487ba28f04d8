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
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::Subscription;
use crate::codec::SegmentEncoder;
use crate::config::RecorderSettings;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::protocol::SegmentInfo;
use crate::status::StatusTracker;
use crate::storage::{SegmentSink, SegmentStore};

const COMPONENT: &str = "segment recorder";

/// What happened to a frame handed to `SegmentRecorder::on_frame`
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Appended to the open segment
    Written,
    /// The previous segment was closed and this frame started the next one
    Rotated(SegmentInfo),
    /// Out of order or duplicate; never written
    Rejected,
    /// A write failed; the segment it belonged to was discarded
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub frames_written: u64,
    pub frames_rejected: u64,
    pub segments_closed: u64,
    pub segments_abandoned: u64,
    pub write_failures: u64,
}

struct OpenSegment {
    sink: Box<dyn SegmentSink>,
    start: DateTime<Utc>,
    last_timestamp: DateTime<Utc>,
    frames: u64,
    bytes: u64,
}

/// Writes frames into consecutive fixed-duration segments.
///
/// A segment starts at the capture time of its first frame and is closed by
/// the first frame captured `segment_duration` or later after that start;
/// that frame opens the next segment.
pub struct SegmentRecorder {
    store: Arc<dyn SegmentStore>,
    encoder: SegmentEncoder,
    run_id: String,
    segment_duration: Duration,
    max_consecutive_failures: u32,
    current: Option<OpenSegment>,
    last_sequence: Option<u64>,
    consecutive_failures: u32,
    stats: RecorderStats,
    status: Option<Arc<StatusTracker>>,
}

impl SegmentRecorder {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        encoder: SegmentEncoder,
        run_id: impl Into<String>,
        segment_duration: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            store,
            encoder,
            run_id: run_id.into(),
            segment_duration,
            max_consecutive_failures: max_consecutive_failures.max(1),
            current: None,
            last_sequence: None,
            consecutive_failures: 0,
            stats: RecorderStats::default(),
            status: None,
        }
    }

    pub fn from_settings(
        store: Arc<dyn SegmentStore>,
        settings: &RecorderSettings,
        run_id: impl Into<String>,
    ) -> Self {
        let encoder = SegmentEncoder::new(
            settings.codec,
            settings.jpeg_quality,
            settings.compression.r#type,
            settings.compression.level(),
        );
        Self::new(
            store,
            encoder,
            run_id,
            settings.segment_duration(),
            settings.max_consecutive_write_failures,
        )
    }

    /// Report closed and abandoned segments to a shared status tracker
    pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    /// Start time of the segment currently being written, if any
    pub fn open_segment_start(&self) -> Option<DateTime<Utc>> {
        self.current.as_ref().map(|segment| segment.start)
    }

    /// Append one frame, rotating first if the open segment is due.
    ///
    /// Only an escalated run of write failures is returned as an error.
    pub async fn on_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, PipelineError> {
        if let Some(last) = self.last_sequence {
            if frame.sequence() <= last {
                self.stats.frames_rejected += 1;
                warn!(
                    "Recorder rejected frame {} (last accepted {})",
                    frame.sequence(),
                    last
                );
                return Ok(FrameOutcome::Rejected);
            }
        }
        self.last_sequence = Some(frame.sequence());

        let mut rotated = None;
        if self.rotation_due(frame.captured_at()) {
            match self.close_current().await {
                Ok(info) => rotated = info,
                Err(e) => {
                    self.register_failure(e)?;
                }
            }
        }

        if self.current.is_none() {
            if let Err(e) = self.open_for(frame).await {
                self.register_failure(e)?;
                return Ok(FrameOutcome::Abandoned);
            }
        }

        if let Err(e) = self.append(frame).await {
            self.abandon_current().await;
            self.register_failure(e)?;
            return Ok(FrameOutcome::Abandoned);
        }

        self.consecutive_failures = 0;
        self.stats.frames_written += 1;
        Ok(match rotated {
            Some(info) => FrameOutcome::Rotated(info),
            None => FrameOutcome::Written,
        })
    }

    /// Finalize the open segment, if any. Never abandons a healthy segment.
    pub async fn finish(&mut self) -> Result<Option<SegmentInfo>, PipelineError> {
        match self.close_current().await {
            Ok(info) => Ok(info),
            Err(e) => {
                error!("Failed to finalize segment on shutdown: {}", e);
                Err(e)
            }
        }
    }

    /// Consume frames until the bus closes, then finalize the open segment
    pub async fn run(mut self, subscription: Subscription) -> Result<RecorderStats, PipelineError> {
        info!("Segment recorder started (run {})", self.run_id);

        while let Some(frame) = subscription.recv().await {
            if let Err(fatal) = self.on_frame(&frame).await {
                self.abandon_current().await;
                return Err(fatal);
            }
        }

        // A failed final rename leaves nothing visible; it is not a pipeline failure
        let _ = self.finish().await;
        info!(
            "Segment recorder stopped: {} frames, {} segments closed, {} abandoned",
            self.stats.frames_written, self.stats.segments_closed, self.stats.segments_abandoned
        );
        Ok(self.stats)
    }

    fn rotation_due(&self, captured_at: DateTime<Utc>) -> bool {
        self.current.as_ref().is_some_and(|segment| {
            (captured_at - segment.start)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.segment_duration)
        })
    }

    async fn open_for(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let start = frame.captured_at();
        let mut sink = self
            .store
            .open_segment(start)
            .await
            .map_err(|e| PipelineError::write(start.to_rfc3339(), format!("{:#}", e)))?;

        let header = self.encoder.header(&self.run_id, start, frame);
        if let Err(e) = sink.write_all(&header).await {
            let path = sink.final_path().to_path_buf();
            let _ = sink.abandon().await;
            self.note_abandoned();
            return Err(PipelineError::write(path, format!("{:#}", e)));
        }

        debug!("Started segment {}", sink.final_path().display());
        self.current = Some(OpenSegment {
            sink,
            start,
            last_timestamp: start,
            frames: 0,
            bytes: header.len() as u64,
        });
        Ok(())
    }

    async fn append(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let Some(segment) = self.current.as_mut() else {
            return Ok(());
        };
        let path = segment.sink.final_path().to_path_buf();

        // JPEG and compression are CPU-bound
        let encoder = self.encoder.clone();
        let owned = frame.clone();
        let record = tokio::task::spawn_blocking(move || encoder.encode_frame(&owned))
            .await
            .map_err(|e| PipelineError::write(&path, e.to_string()))?
            .map_err(|e| PipelineError::write(&path, format!("{:#}", e)))?;
        segment
            .sink
            .write_all(&record)
            .await
            .map_err(|e| PipelineError::write(&path, format!("{:#}", e)))?;

        segment.frames += 1;
        segment.bytes += record.len() as u64;
        segment.last_timestamp = frame.captured_at();
        Ok(())
    }

    async fn close_current(&mut self) -> Result<Option<SegmentInfo>, PipelineError> {
        let Some(mut segment) = self.current.take() else {
            return Ok(None);
        };
        let path = segment.sink.final_path().to_path_buf();

        let trailer = self.encoder.trailer(segment.frames, segment.last_timestamp);
        if let Err(e) = segment.sink.write_all(&trailer).await {
            let _ = segment.sink.abandon().await;
            self.note_abandoned();
            return Err(PipelineError::write(path, format!("{:#}", e)));
        }

        match segment.sink.finalize().await {
            Ok(final_path) => {
                self.stats.segments_closed += 1;
                if let Some(status) = &self.status {
                    status.record_segment_closed();
                }
                info!(
                    "Closed segment {} ({} frames, {} bytes)",
                    final_path.display(),
                    segment.frames,
                    segment.bytes + trailer.len() as u64
                );
                Ok(Some(SegmentInfo {
                    start: segment.start,
                    path: final_path,
                    frames: Some(segment.frames),
                    end: Some(segment.last_timestamp),
                    size_bytes: Some(segment.bytes + trailer.len() as u64),
                }))
            }
            Err(e) => {
                self.note_abandoned();
                Err(PipelineError::write(path, format!("{:#}", e)))
            }
        }
    }

    async fn abandon_current(&mut self) {
        if let Some(segment) = self.current.take() {
            let path = segment.sink.final_path().to_path_buf();
            if let Err(e) = segment.sink.abandon().await {
                warn!("Failed to discard segment {}: {:#}", path.display(), e);
            }
            self.note_abandoned();
            warn!(
                "Abandoned segment {} after {} frames",
                path.display(),
                segment.frames
            );
        }
    }

    fn note_abandoned(&mut self) {
        self.stats.segments_abandoned += 1;
        if let Some(status) = &self.status {
            status.record_segment_abandoned();
        }
    }

    /// Count a write failure; escalate once the consecutive budget is spent
    fn register_failure(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        self.stats.write_failures += 1;
        self.consecutive_failures += 1;
        error!(
            "Segment write failed ({}/{}): {}",
            self.consecutive_failures, self.max_consecutive_failures, error
        );
        if self.consecutive_failures >= self.max_consecutive_failures {
            return Err(PipelineError::RepeatedWriteFailures {
                component: COMPONENT,
                count: self.consecutive_failures,
            });
        }
        Ok(())
    }
}
