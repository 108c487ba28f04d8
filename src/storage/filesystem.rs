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

// Filesystem backend implementation

use super::backend::{SegmentSink, SegmentStore, SnapshotDraft, SnapshotStore};
use crate::naming::{sidecar_name, Category, PARTIAL_SUFFIX};
use crate::protocol::AnomalyEvent;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

const SEGMENT_WRITE_BUFFER: usize = 1024 * 1024;

/// Ensure a directory exists and remove stale partial files left by a crash
async fn prepare_directory(dir: &Path) -> Result<()> {
    if !dir.exists() {
        info!("Creating directory: {}", dir.display());
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(PARTIAL_SUFFIX) {
            warn!("Removing unfinished file from previous run: {}", name);
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("Failed to remove {}: {}", name, e);
            }
        }
    }
    Ok(())
}

/// Write-probe, same approach for both stores
async fn probe_directory(dir: &Path) -> Result<bool> {
    match fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => {
            let test_file = dir.join(".health_check_test");
            match fs::File::create(&test_file).await {
                Ok(mut f) => {
                    if let Err(e) = f.write_all(b"test").await {
                        warn!("Health check failed - cannot write: {}", e);
                        return Ok(false);
                    }
                    let _ = fs::remove_file(&test_file).await;
                    Ok(true)
                }
                Err(e) => {
                    warn!("Health check failed - cannot create file: {}", e);
                    Ok(false)
                }
            }
        }
        Ok(_) => {
            warn!(
                "Health check failed - path is not a directory: {}",
                dir.display()
            );
            Ok(false)
        }
        Err(e) => {
            warn!(
                "Health check failed - cannot access {}: {}",
                dir.display(),
                e
            );
            Ok(false)
        }
    }
}

/// Write `data` to `partial`, sync it, then rename it to `target`
async fn write_atomically(partial: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let result = async {
        let mut file = fs::File::create(partial)
            .await
            .with_context(|| format!("Failed to create file: {}", partial.display()))?;
        file.write_all(data).await.context("Failed to write data")?;
        file.sync_all().await.context("Failed to sync data")?;
        drop(file);
        fs::rename(partial, target)
            .await
            .with_context(|| format!("Failed to publish {}", target.display()))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(partial).await;
    }
    result
}

/// Segment store writing one file per segment under a directory
pub struct FilesystemSegmentStore {
    base_path: PathBuf,
}

impl FilesystemSegmentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        info!(
            "Initializing filesystem segment store at: {}",
            base_path.display()
        );
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl SegmentStore for FilesystemSegmentStore {
    async fn initialize(&self) -> Result<()> {
        prepare_directory(&self.base_path).await
    }

    async fn open_segment(&self, start: DateTime<Utc>) -> Result<Box<dyn SegmentSink>> {
        let final_path = self.base_path.join(Category::Segments.file_name(start));
        let partial_path = self.base_path.join(Category::Segments.partial_name(start));

        if fs::try_exists(&final_path).await.unwrap_or(false) {
            bail!("Segment {} already exists", final_path.display());
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial_path)
            .await
            .with_context(|| format!("Failed to create segment {}", partial_path.display()))?;

        debug!("Opened segment {}", partial_path.display());

        Ok(Box::new(FilesystemSegmentSink {
            writer: BufWriter::with_capacity(SEGMENT_WRITE_BUFFER, file),
            partial_path,
            final_path,
        }))
    }

    async fn health_check(&self) -> Result<bool> {
        probe_directory(&self.base_path).await
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}

struct FilesystemSegmentSink {
    writer: BufWriter<fs::File>,
    partial_path: PathBuf,
    final_path: PathBuf,
}

#[async_trait]
impl SegmentSink for FilesystemSegmentSink {
    fn final_path(&self) -> &Path {
        &self.final_path
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .with_context(|| format!("Failed to write {}", self.partial_path.display()))
    }

    async fn finalize(self: Box<Self>) -> Result<PathBuf> {
        let FilesystemSegmentSink {
            mut writer,
            partial_path,
            final_path,
        } = *self;

        let published = async {
            writer.flush().await.context("Failed to flush segment")?;
            writer
                .get_ref()
                .sync_all()
                .await
                .context("Failed to sync segment")?;
            drop(writer);
            fs::rename(&partial_path, &final_path)
                .await
                .with_context(|| format!("Failed to publish {}", final_path.display()))
        }
        .await;

        match published {
            Ok(()) => {
                info!("Finalized segment {}", final_path.display());
                Ok(final_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial_path).await;
                Err(e)
            }
        }
    }

    async fn abandon(self: Box<Self>) -> Result<()> {
        let FilesystemSegmentSink {
            writer,
            partial_path,
            ..
        } = *self;
        drop(writer);
        match fs::remove_file(&partial_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove {}", partial_path.display())),
        }
    }
}

/// Snapshot store writing JPEG images plus JSON sidecars
pub struct FilesystemSnapshotStore {
    base_path: PathBuf,
}

impl FilesystemSnapshotStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        info!(
            "Initializing filesystem snapshot store at: {}",
            base_path.display()
        );
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl SnapshotStore for FilesystemSnapshotStore {
    async fn initialize(&self) -> Result<()> {
        prepare_directory(&self.base_path).await
    }

    async fn persist(&self, draft: SnapshotDraft) -> Result<AnomalyEvent> {
        let image_name = Category::Snapshots.file_name(draft.timestamp);
        let image_path = self.base_path.join(&image_name);
        if fs::try_exists(&image_path).await.unwrap_or(false) {
            bail!("Snapshot {} already exists", image_path.display());
        }

        let event = AnomalyEvent {
            timestamp: draft.timestamp,
            sequence: draft.sequence,
            snapshot: image_path.clone(),
            score: draft.score,
            threshold: draft.threshold,
        };

        // Sidecar first: the image is what makes the snapshot visible
        let sidecar = sidecar_name(&image_name);
        let sidecar_path = self.base_path.join(&sidecar);
        let metadata = serde_json::to_vec_pretty(&event).context("Failed to serialize metadata")?;
        write_atomically(
            &self.base_path.join(format!("{}{}", sidecar, PARTIAL_SUFFIX)),
            &sidecar_path,
            &metadata,
        )
        .await?;

        let image_partial = self
            .base_path
            .join(Category::Snapshots.partial_name(draft.timestamp));
        if let Err(e) = write_atomically(&image_partial, &image_path, &draft.jpeg).await {
            let _ = fs::remove_file(&sidecar_path).await;
            return Err(e);
        }

        debug!(
            "Wrote snapshot {} ({} bytes, score {:.4})",
            image_path.display(),
            draft.jpeg.len(),
            draft.score
        );
        Ok(event)
    }

    async fn health_check(&self) -> Result<bool> {
        probe_directory(&self.base_path).await
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_initialize_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemSegmentStore::new(temp_dir.path().join("videos"));
        store.initialize().await.unwrap();
        assert!(store.base_path().exists());
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_removes_partials() {
        let temp_dir = TempDir::new().unwrap();
        let stale = temp_dir.path().join("video_20261014_000000_000.seg.part");
        let kept = temp_dir.path().join("video_20261013_000000_000.seg");
        std::fs::write(&stale, b"half").unwrap();
        std::fs::write(&kept, b"done").unwrap();

        let store = FilesystemSegmentStore::new(temp_dir.path());
        store.initialize().await.unwrap();
        assert!(!stale.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_segment_invisible_until_finalized() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemSegmentStore::new(temp_dir.path());
        store.initialize().await.unwrap();

        let start = at("2026-10-14T07:00:00Z");
        let mut sink = store.open_segment(start).await.unwrap();
        sink.write_all(b"frame data").await.unwrap();

        let final_path = sink.final_path().to_path_buf();
        assert!(!final_path.exists());

        let published = sink.finalize().await.unwrap();
        assert_eq!(published, final_path);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"frame data");
        assert!(!temp_dir
            .path()
            .join("video_20261014_070000_000.seg.part")
            .exists());
    }

    #[tokio::test]
    async fn test_abandon_removes_partial() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemSegmentStore::new(temp_dir.path());
        store.initialize().await.unwrap();

        let mut sink = store.open_segment(at("2026-10-14T07:00:00Z")).await.unwrap();
        sink.write_all(b"junk").await.unwrap();
        let final_path = sink.final_path().to_path_buf();
        sink.abandon().await.unwrap();

        assert!(!final_path.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_with_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemSnapshotStore::new(temp_dir.path());
        store.initialize().await.unwrap();

        let event = store
            .persist(SnapshotDraft {
                timestamp: at("2026-10-14T07:00:01.250Z"),
                sequence: 42,
                score: 0.3,
                threshold: 0.1,
                jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            })
            .await
            .unwrap();

        assert_eq!(
            event.snapshot,
            temp_dir.path().join("anomaly_20261014_070001_250.jpg")
        );
        assert!(event.snapshot.exists());

        let sidecar = temp_dir.path().join("anomaly_20261014_070001_250.json");
        let parsed: AnomalyEvent =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn test_snapshot_collision_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemSnapshotStore::new(temp_dir.path());
        store.initialize().await.unwrap();

        let draft = SnapshotDraft {
            timestamp: at("2026-10-14T07:00:01Z"),
            sequence: 1,
            score: 0.5,
            threshold: 0.1,
            jpeg: vec![1, 2, 3],
        };
        store.persist(draft.clone()).await.unwrap();
        assert!(store.persist(draft).await.is_err());
    }
}
