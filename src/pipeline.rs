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

// Pipeline wiring
//
// Frame Source -> Frame Bus -> { Segment Recorder, Anomaly Detector, live feeds }
// with the Retention Manager running on its own task. A single watch channel
// carries shutdown; fatal component errors are funnelled into the same path.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{FrameBus, OverflowPolicy, Subscription};
use crate::catalog::Catalog;
use crate::config::{ConfigLoader, RecorderConfig};
use crate::detector::{AnomalyDetector, DetectorOptions};
use crate::error::PipelineError;
use crate::live::LiveFeed;
use crate::protocol::{AnomalyEvent, PipelineState, StatusResponse};
use crate::recorder::SegmentRecorder;
use crate::retention::RetentionManager;
use crate::source::{open_device, run_capture_loop, CameraDevice, FrameSource, SourceOptions};
use crate::status::StatusTracker;
use crate::storage::{
    FilesystemSegmentStore, FilesystemSnapshotStore, SegmentStore, SnapshotStore,
};

const EVENT_CHANNEL_DEPTH: usize = 64;

/// Cloneable trigger for the pipeline-wide shutdown signal
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

/// First fatal error wins; raising one also requests shutdown
#[derive(Clone)]
struct FatalSlot {
    error: Arc<Mutex<Option<PipelineError>>>,
    shutdown: ShutdownHandle,
    status: Arc<StatusTracker>,
}

impl FatalSlot {
    fn raise(&self, error: PipelineError) {
        error!("Fatal pipeline error: {}", error);
        self.status.set_state(PipelineState::Failed);
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.shutdown.trigger();
    }

    fn take(&self) -> Option<PipelineError> {
        self.error.lock().take()
    }
}

fn supervise<F, T>(task: &'static str, work: F, fatal: FatalSlot) -> JoinHandle<()>
where
    F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    T: std::fmt::Debug + Send + 'static,
{
    tokio::spawn(async move {
        match work.await {
            Ok(summary) => debug!("{} task finished: {:?}", task, summary),
            Err(e) if e.is_fatal() => fatal.raise(e),
            Err(e) => warn!("{} task ended with error: {}", task, e),
        }
    })
}

/// Assembles a pipeline; storage backends can be swapped for tests
pub struct PipelineBuilder {
    config: RecorderConfig,
    device: Option<Box<dyn CameraDevice>>,
    segment_store: Option<Arc<dyn SegmentStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl PipelineBuilder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            device: None,
            segment_store: None,
            snapshot_store: None,
        }
    }

    pub fn device(mut self, device: Box<dyn CameraDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn segment_store(mut self, store: Arc<dyn SegmentStore>) -> Self {
        self.segment_store = Some(store);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Validate, prepare storage and spawn every component
    pub async fn start(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        ConfigLoader::validate(&config).map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

        let device = match self.device {
            Some(device) => device,
            None => open_device(&config.camera)?,
        };

        let segment_store: Arc<dyn SegmentStore> = match self.segment_store {
            Some(store) => store,
            None => Arc::new(FilesystemSegmentStore::new(&config.recorder.segment_dir)),
        };
        prepare_store("segment", &config.recorder.segment_dir, segment_store.as_ref()).await?;

        let snapshot_store = if config.detector.enabled {
            let store: Arc<dyn SnapshotStore> = match self.snapshot_store {
                Some(store) => store,
                None => Arc::new(FilesystemSnapshotStore::new(&config.detector.snapshot_dir)),
            };
            store
                .initialize()
                .await
                .map_err(|e| PipelineError::write(&config.detector.snapshot_dir, format!("{:#}", e)))?;
            if !store
                .health_check()
                .await
                .map_err(|e| PipelineError::write(&config.detector.snapshot_dir, format!("{:#}", e)))?
            {
                return Err(PipelineError::write(
                    &config.detector.snapshot_dir,
                    "snapshot store failed its health check",
                ));
            }
            Some(store)
        } else {
            None
        };

        let run_id = Uuid::new_v4().to_string();
        let status = Arc::new(StatusTracker::new(run_id.clone()));
        let (sender, shutdown_rx) = watch::channel(false);
        let shutdown = ShutdownHandle {
            sender: Arc::new(sender),
        };
        let fatal = FatalSlot {
            error: Arc::new(Mutex::new(None)),
            shutdown: shutdown.clone(),
            status: status.clone(),
        };
        let bus = FrameBus::new(config.bus.subscriber_queue_depth);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);

        info!(
            "Starting pipeline {} on '{}' ({}x{} @ {} fps)",
            run_id,
            device.describe(),
            config.camera.width,
            config.camera.height,
            config.camera.frame_rate
        );

        // Subscribers attach before the first frame is published
        let mut tasks = Vec::new();

        let recorder_sub = bus.subscribe_with(
            "recorder",
            config.bus.recorder_queue_depth,
            OverflowPolicy::Warn,
        );
        let recorder = SegmentRecorder::from_settings(segment_store, &config.recorder, run_id.clone())
            .with_status(status.clone());
        tasks.push((
            "recorder",
            supervise("recorder", recorder.run(recorder_sub), fatal.clone()),
        ));

        if let Some(store) = snapshot_store {
            let detector_sub = bus.subscribe_with(
                "detector",
                config.bus.detector_queue_depth,
                OverflowPolicy::Silent,
            );
            let detector = AnomalyDetector::new(store, DetectorOptions::from(&config.detector))
                .with_status(status.clone())
                .with_events(events.clone());
            tasks.push((
                "detector",
                supervise("detector", detector.run(detector_sub), fatal.clone()),
            ));
        }

        let retention = RetentionManager::from_config(&config).with_status(status.clone());
        tasks.push((
            "retention",
            supervise("retention", retention.run(shutdown_rx.clone()), fatal.clone()),
        ));

        let source = FrameSource::new(device, SourceOptions::from_config(&config.camera));
        let capture_bus = bus.clone();
        let capture_rx = shutdown_rx.clone();
        let capture_status = status.clone();
        let capture = async move {
            tokio::task::spawn_blocking(move || {
                run_capture_loop(source, capture_bus, capture_rx, capture_status)
            })
            .await
            .map_err(|e| PipelineError::TaskFailed {
                task: "capture",
                reason: e.to_string(),
            })?
        };
        // Capture goes first so that on shutdown the bus is closed before subscribers are awaited
        tasks.insert(0, ("capture", supervise("capture", capture, fatal.clone())));

        status.set_state(PipelineState::Running);

        Ok(Pipeline {
            bus,
            status,
            catalog: Catalog::from_config(&config),
            shutdown,
            shutdown_rx,
            fatal,
            events,
            tasks,
            grace: config.shutdown.grace_period(),
            live_quality: config.recorder.jpeg_quality,
            live_gamma: config.live.enhancement(),
        })
    }
}

async fn prepare_store(
    kind: &str,
    dir: &str,
    store: &dyn SegmentStore,
) -> Result<(), PipelineError> {
    store
        .initialize()
        .await
        .map_err(|e| PipelineError::write(dir, format!("{:#}", e)))?;
    let healthy = store
        .health_check()
        .await
        .map_err(|e| PipelineError::write(dir, format!("{:#}", e)))?;
    if !healthy {
        return Err(PipelineError::write(
            dir,
            format!("{} store ({}) failed its health check", kind, store.backend_type()),
        ));
    }
    Ok(())
}

/// A running pipeline
pub struct Pipeline {
    bus: FrameBus,
    status: Arc<StatusTracker>,
    catalog: Catalog,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    fatal: FatalSlot,
    events: broadcast::Sender<AnomalyEvent>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
    live_quality: u8,
    live_gamma: Option<f32>,
}

impl Pipeline {
    /// Start with the configured device
    pub async fn start(config: &RecorderConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config.clone()).start().await
    }

    /// Start with an already opened device
    pub async fn start_with_device(
        config: &RecorderConfig,
        device: Box<dyn CameraDevice>,
    ) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config.clone()).device(device).start().await
    }

    /// Attach a drop-tolerant frame subscriber
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.bus.subscribe(name)
    }

    /// MJPEG feed for one live viewer
    pub fn live_feed(&self) -> LiveFeed {
        LiveFeed::new(self.bus.subscribe("live"), self.live_quality).with_enhancement(self.live_gamma)
    }

    /// Anomaly events as they are persisted
    pub fn events(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn status(&self) -> StatusResponse {
        self.status.snapshot()
    }

    /// Shared tracker, usable after the pipeline itself has been consumed
    pub fn status_tracker(&self) -> Arc<StatusTracker> {
        self.status.clone()
    }

    pub fn run_id(&self) -> &str {
        self.status.run_id()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Request shutdown and wait for every component to stop
    pub async fn stop(self) -> Result<(), PipelineError> {
        self.shutdown.trigger();
        self.wait().await
    }

    /// Wait until shutdown is requested (or a fatal error occurs), then drain.
    ///
    /// Each task gets the grace period to finish. Stragglers are aborted and
    /// reported as `TaskFailed`, since their open work was never completed.
    /// Returns the fatal error that ended the pipeline, if any.
    pub async fn wait(mut self) -> Result<(), PipelineError> {
        while !*self.shutdown_rx.borrow_and_update() {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        self.status.set_state(PipelineState::Stopping);
        info!("Stopping pipeline {}", self.status.run_id());

        for (task, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(self.grace, &mut handle).await {
                Ok(Ok(())) => debug!("{} stopped", task),
                Ok(Err(e)) => self.fatal.raise(PipelineError::TaskFailed {
                    task,
                    reason: e.to_string(),
                }),
                Err(_) => {
                    // Work the task still held open is lost
                    handle.abort();
                    self.fatal.raise(PipelineError::TaskFailed {
                        task,
                        reason: format!("did not stop within {:?}, aborted", self.grace),
                    });
                }
            }
        }
        // Covers a capture thread that outlived its grace period
        self.bus.close();

        match self.fatal.take() {
            Some(e) => {
                self.status.set_state(PipelineState::Failed);
                error!("Pipeline {} failed: {}", self.status.run_id(), e);
                Err(e)
            }
            None => {
                self.status.set_state(PipelineState::Stopped);
                info!("Pipeline {} stopped cleanly", self.status.run_id());
                Ok(())
            }
        }
    }
}
