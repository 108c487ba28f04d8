use anyhow::{anyhow, Result};
use async_trait::async_trait;
use camera_recorder::bus::{FrameBus, OverflowPolicy};
use camera_recorder::codec::{DecodedSegment, SegmentEncoder};
use camera_recorder::naming::{list_closed, Category, PARTIAL_SUFFIX};
use camera_recorder::protocol::{CompressionLevel, CompressionType, FrameCodec};
use camera_recorder::recorder::{FrameOutcome, SegmentRecorder};
use camera_recorder::source::{FrameSource, SourceOptions, SyntheticCamera};
use camera_recorder::storage::{FilesystemSegmentStore, SegmentSink, SegmentStore};
use camera_recorder::PixelFormat;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn raw_encoder() -> SegmentEncoder {
    SegmentEncoder::new(
        FrameCodec::Raw,
        80,
        CompressionType::None,
        CompressionLevel::default(),
    )
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
}

fn source(fps: u32) -> FrameSource {
    let camera = SyntheticCamera::new("bench", 8, 6, PixelFormat::Gray8).with_virtual_clock(t0(), fps);
    FrameSource::new(Box::new(camera), SourceOptions::default())
}

async fn filesystem_store(dir: &Path) -> Arc<dyn SegmentStore> {
    let store = FilesystemSegmentStore::new(dir);
    store.initialize().await.unwrap();
    Arc::new(store)
}

fn partial_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
        .count()
}

fn decode(path: &Path) -> DecodedSegment {
    let bytes = std::fs::read(path).unwrap();
    DecodedSegment::parse(&bytes).unwrap()
}

#[tokio::test]
async fn test_one_hour_run_produces_half_hour_segments() {
    let dir = TempDir::new().unwrap();
    let store = filesystem_store(dir.path()).await;
    let duration = Duration::from_secs(30 * 60);
    let mut recorder = SegmentRecorder::new(store, raw_encoder(), "hour-run", duration, 3);
    let mut source = source(2);

    // 65 minutes at 2 fps
    for _ in 0..(65 * 60 * 2) {
        let frame = source.next_frame().unwrap();
        recorder.on_frame(&frame).await.unwrap();
    }

    assert_eq!(list_closed(dir.path(), Category::Segments).await.unwrap().len(), 2);
    assert_eq!(partial_files(dir.path()), 1);

    recorder.finish().await.unwrap();
    let closed = list_closed(dir.path(), Category::Segments).await.unwrap();
    assert_eq!(closed.len(), 3);
    assert_eq!(partial_files(dir.path()), 0);

    let window = chrono::Duration::from_std(duration).unwrap();
    let mut total = 0;
    for entry in &closed {
        let segment = decode(&entry.path);
        assert!(segment.is_finalized());
        assert_eq!(segment.header.start, entry.timestamp);
        for record in &segment.records {
            assert!(record.timestamp >= segment.header.start);
            assert!(record.timestamp < segment.header.start + window);
        }
        total += segment.records.len();
    }
    assert_eq!(total, 65 * 60 * 2);
    assert_eq!(closed[0].timestamp, t0());
    assert_eq!(closed[1].timestamp, t0() + window);
}

#[tokio::test]
async fn test_closed_segment_count_is_floor_of_elapsed_over_duration() {
    const RUN_SECONDS: u64 = 125;
    const FPS: u32 = 4;

    for segment_seconds in [7u64, 10, 60] {
        let dir = TempDir::new().unwrap();
        let store = filesystem_store(dir.path()).await;
        let mut recorder = SegmentRecorder::new(
            store,
            raw_encoder(),
            "floor-run",
            Duration::from_secs(segment_seconds),
            3,
        );
        let mut source = source(FPS);

        for _ in 0..(RUN_SECONDS * FPS as u64) {
            let frame = source.next_frame().unwrap();
            recorder.on_frame(&frame).await.unwrap();
        }

        assert_eq!(
            recorder.stats().segments_closed,
            RUN_SECONDS / segment_seconds,
            "segment duration {}s",
            segment_seconds
        );
        assert!(recorder.open_segment_start().is_some());
    }
}

/// Segment store whose sinks fail one chosen write, counted across all sinks
struct FlakyStore {
    inner: Arc<dyn SegmentStore>,
    writes: Arc<AtomicUsize>,
    fail_on: usize,
}

struct FlakySink {
    inner: Box<dyn SegmentSink>,
    writes: Arc<AtomicUsize>,
    fail_on: usize,
}

#[async_trait]
impl SegmentStore for FlakyStore {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn open_segment(&self, start: DateTime<Utc>) -> Result<Box<dyn SegmentSink>> {
        let inner = self.inner.open_segment(start).await?;
        Ok(Box::new(FlakySink {
            inner,
            writes: self.writes.clone(),
            fail_on: self.fail_on,
        }))
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    fn backend_type(&self) -> &str {
        "flaky"
    }
}

#[async_trait]
impl SegmentSink for FlakySink {
    fn final_path(&self) -> &Path {
        self.inner.final_path()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(anyhow!("injected write failure (write #{})", n));
        }
        self.inner.write_all(bytes).await
    }

    async fn finalize(self: Box<Self>) -> Result<PathBuf> {
        self.inner.finalize().await
    }

    async fn abandon(self: Box<Self>) -> Result<()> {
        self.inner.abandon().await
    }
}

#[tokio::test]
async fn test_write_failure_abandons_segment_without_stalling_other_subscribers() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SegmentStore> = Arc::new(FlakyStore {
        inner: filesystem_store(dir.path()).await,
        writes: Arc::new(AtomicUsize::new(0)),
        // header, then frames 1..=3, then frame 4 fails
        fail_on: 5,
    });
    let recorder = SegmentRecorder::new(store, raw_encoder(), "flaky-run", Duration::from_secs(10), 3);

    let bus = FrameBus::new(4);
    let recorder_sub = bus.subscribe_with("recorder", 64, OverflowPolicy::Warn);
    let archive = bus.subscribe_with("archive", 64, OverflowPolicy::Warn);

    let recorder_task = tokio::spawn(recorder.run(recorder_sub));
    let archive_task = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(frame) = archive.recv().await {
            seen.push(frame.sequence());
        }
        seen
    });

    let mut source = source(1);
    for _ in 0..30 {
        assert!(bus.publish(source.next_frame().unwrap()));
    }
    bus.close();

    let stats = recorder_task.await.unwrap().unwrap();
    let seen = archive_task.await.unwrap();

    assert_eq!(seen, (1..=30).collect::<Vec<_>>());
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.segments_abandoned, 1);
    assert_eq!(stats.segments_closed, 3);
    assert_eq!(partial_files(dir.path()), 0);

    // The abandoned segment leaves nothing behind; recording resumes at frame 5
    let closed = list_closed(dir.path(), Category::Segments).await.unwrap();
    assert_eq!(closed.len(), 3);
    assert_eq!(closed[0].timestamp, t0() + chrono::Duration::seconds(4));
    let sequences: Vec<u64> = closed
        .iter()
        .flat_map(|entry| decode(&entry.path).records)
        .map(|record| record.sequence)
        .collect();
    assert_eq!(sequences, (5..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_repeated_write_failures_escalate() {
    let dir = TempDir::new().unwrap();
    // A store rooted at a file cannot create segments
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let store: Arc<dyn SegmentStore> = Arc::new(FilesystemSegmentStore::new(&blocker));
    let mut recorder = SegmentRecorder::new(store, raw_encoder(), "broken", Duration::from_secs(10), 2);
    let mut source = source(1);

    let first = recorder.on_frame(&source.next_frame().unwrap()).await.unwrap();
    assert_eq!(first, FrameOutcome::Abandoned);
    let second = recorder.on_frame(&source.next_frame().unwrap()).await;
    assert!(matches!(
        second,
        Err(camera_recorder::PipelineError::RepeatedWriteFailures { count: 2, .. })
    ));
}
