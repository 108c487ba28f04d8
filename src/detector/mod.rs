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

// Anomaly detector
//
// Frame-difference detection against a rolling luma baseline:
// - Idle while the baseline is seeded and warmed up
// - Quiet frames refresh the baseline
// - Triggered frames are persisted as snapshots, subject to a cooldown
//   measured on frame timestamps

pub mod baseline;

pub use baseline::{Baseline, LumaGrid};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::Subscription;
use crate::codec::encode_jpeg;
use crate::config::DetectorSettings;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::protocol::AnomalyEvent;
use crate::status::StatusTracker;
use crate::storage::{SnapshotDraft, SnapshotStore};

const COMPONENT: &str = "anomaly detector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// No usable baseline yet
    Idle,
    /// A frame is being scored
    Evaluating,
    Quiet,
    Triggered,
}

/// Result of scoring one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub score: f32,
    pub state: DetectorState,
    /// True when the frame should be persisted as an anomaly
    pub emit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub frames_evaluated: u64,
    pub triggered: u64,
    pub suppressed: u64,
    pub events: u64,
    pub write_failures: u64,
}

/// Tunables for `AnomalyDetector`, normally taken from `DetectorSettings`
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub threshold: f32,
    pub pixel_delta: f32,
    pub cooldown: Duration,
    pub refresh_rate: f32,
    pub warmup_frames: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub snapshot_quality: u8,
    pub max_consecutive_failures: u32,
}

impl From<&DetectorSettings> for DetectorOptions {
    fn from(settings: &DetectorSettings) -> Self {
        Self {
            threshold: settings.threshold,
            pixel_delta: settings.pixel_delta as f32,
            cooldown: settings.cooldown(),
            refresh_rate: settings.baseline_refresh_rate,
            warmup_frames: settings.warmup_frames,
            grid_width: settings.grid_width,
            grid_height: settings.grid_height,
            snapshot_quality: settings.snapshot_quality,
            max_consecutive_failures: settings.max_consecutive_write_failures.max(1),
        }
    }
}

pub struct AnomalyDetector {
    store: Arc<dyn SnapshotStore>,
    options: DetectorOptions,
    baseline: Option<Baseline>,
    state: DetectorState,
    cooldown_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    stats: DetectorStats,
    status: Option<Arc<StatusTracker>>,
    events: Option<broadcast::Sender<AnomalyEvent>>,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn SnapshotStore>, options: DetectorOptions) -> Self {
        Self {
            store,
            options,
            baseline: None,
            state: DetectorState::Idle,
            cooldown_until: None,
            consecutive_failures: 0,
            stats: DetectorStats::default(),
            status: None,
            events: None,
        }
    }

    pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    /// Publish every persisted event to a broadcast channel
    pub fn with_events(mut self, events: broadcast::Sender<AnomalyEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    /// Score a frame and advance the state machine. Performs no I/O.
    pub fn evaluate(&mut self, frame: &Frame) -> Evaluation {
        self.state = DetectorState::Evaluating;
        self.stats.frames_evaluated += 1;
        let grid = LumaGrid::from_image(
            frame.image(),
            self.options.grid_width,
            self.options.grid_height,
        );

        let baseline = match self.baseline.as_mut() {
            Some(baseline) if baseline.matches(&grid) => baseline,
            _ => {
                if self.baseline.is_some() {
                    warn!(
                        "Frame {} changed resolution, reseeding baseline",
                        frame.sequence()
                    );
                }
                self.baseline = Some(Baseline::seed(grid));
                return self.settle(0.0, DetectorState::Idle, false);
            }
        };

        if baseline.samples() <= self.options.warmup_frames {
            baseline.accumulate(&grid);
            return self.settle(0.0, DetectorState::Idle, false);
        }

        let score = baseline.score(&grid, self.options.pixel_delta);
        if score <= self.options.threshold {
            baseline.refresh(&grid, self.options.refresh_rate);
            return self.settle(score, DetectorState::Quiet, false);
        }

        // Triggered frames never touch the baseline
        self.stats.triggered += 1;
        let at = frame.captured_at();
        if self.cooldown_until.is_some_and(|until| at < until) {
            self.stats.suppressed += 1;
            debug!(
                "Frame {} triggered (score {:.4}) inside cooldown, suppressed",
                frame.sequence(),
                score
            );
            return self.settle(score, DetectorState::Triggered, false);
        }

        self.cooldown_until = Some(
            chrono::Duration::from_std(self.options.cooldown)
                .ok()
                .and_then(|cooldown| at.checked_add_signed(cooldown))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.settle(score, DetectorState::Triggered, true)
    }

    fn settle(&mut self, score: f32, state: DetectorState, emit: bool) -> Evaluation {
        self.state = state;
        Evaluation { score, state, emit }
    }

    /// Evaluate a frame and persist a snapshot if it triggers.
    ///
    /// A failed write drops the event; only an escalated run of failures is
    /// returned as an error.
    pub async fn on_frame(&mut self, frame: &Frame) -> Result<Option<AnomalyEvent>, PipelineError> {
        let evaluation = self.evaluate(frame);
        if !evaluation.emit {
            return Ok(None);
        }

        info!(
            "Anomaly at frame {} (score {:.4} > {:.4})",
            frame.sequence(),
            evaluation.score,
            self.options.threshold
        );

        match self.persist(frame, evaluation.score).await {
            Ok(event) => {
                self.consecutive_failures = 0;
                self.stats.events += 1;
                if let Some(status) = &self.status {
                    status.record_anomaly();
                }
                if let Some(events) = &self.events {
                    let _ = events.send(event.clone());
                }
                Ok(Some(event))
            }
            Err(e) => {
                self.stats.write_failures += 1;
                self.consecutive_failures += 1;
                error!(
                    "Dropping anomaly event for frame {} ({}/{}): {}",
                    frame.sequence(),
                    self.consecutive_failures,
                    self.options.max_consecutive_failures,
                    e
                );
                if self.consecutive_failures >= self.options.max_consecutive_failures {
                    return Err(PipelineError::RepeatedWriteFailures {
                        component: COMPONENT,
                        count: self.consecutive_failures,
                    });
                }
                Ok(None)
            }
        }
    }

    async fn persist(&self, frame: &Frame, score: f32) -> Result<AnomalyEvent, PipelineError> {
        let image = frame.image().clone();
        let quality = self.options.snapshot_quality;
        let target = frame.captured_at().to_rfc3339();

        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&image, quality))
            .await
            .map_err(|e| PipelineError::write(&target, e))?
            .map_err(|e| PipelineError::write(&target, format!("{:#}", e)))?;

        let draft = SnapshotDraft {
            timestamp: frame.captured_at(),
            sequence: frame.sequence(),
            score,
            threshold: self.options.threshold,
            jpeg,
        };
        self.store
            .persist(draft)
            .await
            .map_err(|e| PipelineError::write(&target, format!("{:#}", e)))
    }

    /// Consume frames until the bus closes
    pub async fn run(mut self, subscription: Subscription) -> Result<DetectorStats, PipelineError> {
        info!(
            "Anomaly detector started (threshold {:.4}, cooldown {:?})",
            self.options.threshold, self.options.cooldown
        );
        while let Some(frame) = subscription.recv().await {
            self.on_frame(&frame).await?;
        }
        info!(
            "Anomaly detector stopped: {} frames, {} events, {} suppressed",
            self.stats.frames_evaluated, self.stats.events, self.stats.suppressed
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, RasterImage};
    use crate::storage::FilesystemSnapshotStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn options() -> DetectorOptions {
        DetectorOptions {
            threshold: 0.1,
            pixel_delta: 25.0,
            cooldown: Duration::from_secs(2),
            refresh_rate: 0.5,
            warmup_frames: 2,
            grid_width: 8,
            grid_height: 8,
            snapshot_quality: 80,
            max_consecutive_failures: 2,
        }
    }

    fn frame(sequence: u64, millis: i64, value: u8) -> Frame {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
            + chrono::Duration::milliseconds(millis);
        let image = RasterImage::new(8, 8, PixelFormat::Gray8, vec![value; 64]).unwrap();
        Frame::new(sequence, at, image)
    }

    fn detector(dir: &TempDir) -> AnomalyDetector {
        AnomalyDetector::new(Arc::new(FilesystemSnapshotStore::new(dir.path())), options())
    }

    #[test]
    fn test_warmup_never_triggers() {
        let dir = TempDir::new().unwrap();
        let mut detector = detector(&dir);

        let seed = detector.evaluate(&frame(1, 0, 50));
        assert_eq!(seed.state, DetectorState::Idle);
        // Warmup frames differ wildly from the seed but stay idle
        assert_eq!(detector.evaluate(&frame(2, 100, 250)).state, DetectorState::Idle);
        assert_eq!(detector.evaluate(&frame(3, 200, 250)).state, DetectorState::Idle);
        assert_eq!(detector.baseline().unwrap().samples(), 3);
    }

    #[test]
    fn test_triggered_frame_does_not_update_baseline() {
        let dir = TempDir::new().unwrap();
        let mut detector = detector(&dir);
        for seq in 1..=3 {
            detector.evaluate(&frame(seq, seq as i64 * 100, 50));
        }
        let before = detector.baseline().unwrap().grid().clone();

        let eval = detector.evaluate(&frame(4, 400, 200));
        assert_eq!(eval.state, DetectorState::Triggered);
        assert!(eval.emit);
        assert_eq!(eval.score, 1.0);
        assert_eq!(detector.baseline().unwrap().grid(), &before);

        let quiet = detector.evaluate(&frame(5, 500, 52));
        assert_eq!(quiet.state, DetectorState::Quiet);
        assert_ne!(detector.baseline().unwrap().grid(), &before);
    }

    #[test]
    fn test_cooldown_suppresses_on_frame_time() {
        let dir = TempDir::new().unwrap();
        let mut detector = detector(&dir);
        for seq in 1..=3 {
            detector.evaluate(&frame(seq, seq as i64 * 100, 50));
        }

        assert!(detector.evaluate(&frame(4, 1_000, 200)).emit);
        assert!(!detector.evaluate(&frame(5, 2_000, 200)).emit);
        assert!(!detector.evaluate(&frame(6, 2_999, 200)).emit);
        assert!(detector.evaluate(&frame(7, 3_000, 200)).emit);
        assert_eq!(detector.stats().suppressed, 2);
        assert_eq!(detector.stats().triggered, 4);
    }

    #[tokio::test]
    async fn test_on_frame_persists_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemSnapshotStore::new(dir.path()));
        store.initialize().await.unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let mut detector = AnomalyDetector::new(store, options()).with_events(tx);

        for seq in 1..=3 {
            assert!(detector.on_frame(&frame(seq, seq as i64 * 100, 50)).await.unwrap().is_none());
        }
        let event = detector.on_frame(&frame(4, 400, 200)).await.unwrap().unwrap();
        assert!(event.snapshot.exists());
        assert_eq!(event.sequence, 4);
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn test_repeated_write_failures_escalate() {
        let dir = TempDir::new().unwrap();
        // Never initialized: the directory does not exist
        let missing = dir.path().join("missing");
        let mut options = options();
        options.cooldown = Duration::ZERO;
        let mut detector =
            AnomalyDetector::new(Arc::new(FilesystemSnapshotStore::new(&missing)), options);

        for seq in 1..=3 {
            detector.on_frame(&frame(seq, seq as i64 * 100, 50)).await.unwrap();
        }
        assert!(detector.on_frame(&frame(4, 400, 200)).await.unwrap().is_none());
        let err = detector.on_frame(&frame(5, 500, 200)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(detector.stats().write_failures, 2);
    }
}
