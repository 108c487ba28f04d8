// Shared liveness counters.
//
// Components bump these as they work; the pipeline snapshots them into a
// `StatusResponse` for the HTTP boundary.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{PipelineState, StatusResponse};

pub struct StatusTracker {
    run_id: String,
    started_at: DateTime<Utc>,
    state: RwLock<PipelineState>,
    last_frame_at: RwLock<Option<DateTime<Utc>>>,
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
    segments_closed: AtomicU64,
    segments_abandoned: AtomicU64,
    anomalies_detected: AtomicU64,
    retention_deletions: AtomicU64,
}

impl StatusTracker {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            state: RwLock::new(PipelineState::Starting),
            last_frame_at: RwLock::new(None),
            frames_captured: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            segments_closed: AtomicU64::new(0),
            segments_abandoned: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            retention_deletions: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PipelineState) {
        let mut current = self.state.write();
        // A failure is sticky; a clean stop cannot overwrite it
        if *current == PipelineState::Failed && state != PipelineState::Failed {
            return;
        }
        *current = state;
    }

    pub fn record_frame(&self, captured_at: DateTime<Utc>) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.write() = Some(captured_at);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_closed(&self) {
        self.segments_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_abandoned(&self) {
        self.segments_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletions(&self, count: u64) {
        self.retention_deletions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusResponse {
        let state = self.state();
        StatusResponse {
            state,
            stream_available: state == PipelineState::Running,
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
            segments_abandoned: self.segments_abandoned.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            retention_deletions: self.retention_deletions.load(Ordering::Relaxed),
            last_frame_at: *self.last_frame_at.read(),
        }
    }
}
