// Read-only, paged listing of finalized segments and anomaly events.
//
// Only names that passed the final rename are ever listed, so a listing never
// sees a half-written artifact. Entries removed by retention between listing
// and reading are skipped.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, warn};

use crate::codec::trailer_from_tail;
use crate::config::RecorderConfig;
use crate::naming::{is_plain_file_name, list_closed, sidecar_name, Category, ClosedEntry};
use crate::protocol::{AnomalyEvent, SegmentInfo};

pub const DEFAULT_PAGE_SIZE: usize = 20;

const TRAILER_TAIL_BYTES: u64 = 128;

/// One page of a newest-first listing
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based page number actually served
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    fn empty(page: usize, per_page: usize) -> Self {
        Self {
            items: Vec::new(),
            page,
            per_page,
            total: 0,
            total_pages: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    segment_dir: PathBuf,
    snapshot_dir: PathBuf,
    per_page: usize,
}

impl Catalog {
    pub fn new(segment_dir: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            segment_dir: segment_dir.into(),
            snapshot_dir: snapshot_dir.into(),
            per_page: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(&config.recorder.segment_dir, &config.detector.snapshot_dir)
    }

    pub fn with_page_size(mut self, per_page: usize) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    /// Finalized segments, newest first. `per_page` overrides the catalog page size.
    pub async fn list_segments(&self, page: usize, per_page: Option<usize>) -> Page<SegmentInfo> {
        let mut listing = self
            .page_of(&self.segment_dir, Category::Segments, page, per_page)
            .await;
        let mut items = Vec::with_capacity(listing.items.len());
        for entry in listing.items.drain(..) {
            if let Some(info) = segment_info(entry).await {
                items.push(info);
            }
        }
        Page {
            items,
            page: listing.page,
            per_page: listing.per_page,
            total: listing.total,
            total_pages: listing.total_pages,
        }
    }

    pub async fn list_anomalies(&self, page: usize, per_page: Option<usize>) -> Page<AnomalyEvent> {
        let mut listing = self
            .page_of(&self.snapshot_dir, Category::Snapshots, page, per_page)
            .await;
        let mut items = Vec::with_capacity(listing.items.len());
        for entry in listing.items.drain(..) {
            if let Some(event) = anomaly_event(entry).await {
                items.push(event);
            }
        }
        Page {
            items,
            page: listing.page,
            per_page: listing.per_page,
            total: listing.total,
            total_pages: listing.total_pages,
        }
    }

    /// Bytes of a finalized snapshot, by bare file name
    pub async fn read_snapshot(&self, name: &str) -> Option<Vec<u8>> {
        if !is_plain_file_name(name) || Category::Snapshots.parse(name).is_none() {
            debug!("Rejected snapshot lookup for '{}'", name);
            return None;
        }
        match fs::read(self.snapshot_dir.join(name)).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read snapshot {}: {}", name, e);
                }
                None
            }
        }
    }

    async fn page_of(
        &self,
        dir: &Path,
        category: Category,
        page: usize,
        per_page: Option<usize>,
    ) -> Page<ClosedEntry> {
        let page = page.max(1);
        let per_page = per_page.map_or(self.per_page, |n| n.max(1));
        let mut entries = match list_closed(dir, category).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {}", dir.display(), e);
                return Page::empty(page, per_page);
            }
        };
        entries.reverse();

        let total = entries.len();
        let total_pages = total.div_ceil(per_page);
        let items = entries
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        Page {
            items,
            page,
            per_page,
            total,
            total_pages,
        }
    }
}

async fn segment_info(entry: ClosedEntry) -> Option<SegmentInfo> {
    let metadata = fs::metadata(&entry.path).await.ok()?;
    let trailer = read_tail(&entry.path, metadata.len())
        .await
        .ok()
        .and_then(|tail| trailer_from_tail(&tail));

    Some(SegmentInfo {
        start: entry.timestamp,
        frames: trailer.as_ref().map(|t| t.frames),
        end: trailer.map(|t| t.end),
        size_bytes: Some(metadata.len()),
        path: entry.path,
    })
}

async fn read_tail(path: &Path, len: u64) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    let offset = len.saturating_sub(TRAILER_TAIL_BYTES);
    file.seek(SeekFrom::Start(offset)).await?;
    let mut tail = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut tail).await?;
    Ok(tail)
}

async fn anomaly_event(entry: ClosedEntry) -> Option<AnomalyEvent> {
    if !fs::try_exists(&entry.path).await.unwrap_or(false) {
        return None;
    }

    let sidecar = entry.path.with_file_name(sidecar_name(&entry.name));
    match fs::read(&sidecar).await {
        Ok(bytes) => match serde_json::from_slice::<AnomalyEvent>(&bytes) {
            Ok(mut event) => {
                event.snapshot = entry.path;
                Some(event)
            }
            Err(e) => {
                warn!("Ignoring malformed sidecar {}: {}", sidecar.display(), e);
                Some(bare_event(entry))
            }
        },
        // Snapshots from older layouts carry no sidecar
        Err(_) => Some(bare_event(entry)),
    }
}

fn bare_event(entry: ClosedEntry) -> AnomalyEvent {
    AnomalyEvent {
        timestamp: entry.timestamp,
        sequence: 0,
        snapshot: entry.path,
        score: 0.0,
        threshold: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_pages_newest_first() {
        let segments = TempDir::new().unwrap();
        let snapshots = TempDir::new().unwrap();
        for minute in 0..5 {
            std::fs::write(segments.path().join(Category::Segments.file_name(at(minute))), b"x")
                .unwrap();
        }
        let catalog = Catalog::new(segments.path(), snapshots.path()).with_page_size(2);

        let first = catalog.list_segments(1, None).await;
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.items[0].start, at(4));
        assert_eq!(first.items[1].start, at(3));
        assert_eq!(first.items[0].frames, None);

        let last = catalog.list_segments(3, None).await;
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].start, at(0));
        assert!(catalog.list_segments(9, None).await.items.is_empty());

        let wide = catalog.list_segments(1, Some(4)).await;
        assert_eq!(wide.per_page, 4);
        assert_eq!(wide.total_pages, 2);
        assert_eq!(wide.items.len(), 4);
        assert_eq!(catalog.list_segments(2, Some(4)).await.items[0].start, at(0));
        assert_eq!(catalog.list_segments(1, Some(0)).await.per_page, 1);
    }

    #[tokio::test]
    async fn test_read_snapshot_rejects_paths() {
        let segments = TempDir::new().unwrap();
        let snapshots = TempDir::new().unwrap();
        let name = Category::Snapshots.file_name(at(1));
        std::fs::write(snapshots.path().join(&name), b"jpeg").unwrap();
        let catalog = Catalog::new(segments.path(), snapshots.path());

        assert_eq!(catalog.read_snapshot(&name).await.unwrap(), b"jpeg");
        assert!(catalog.read_snapshot("../secret.jpg").await.is_none());
        assert!(catalog.read_snapshot("notes.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_directories_list_empty() {
        let root = TempDir::new().unwrap();
        let catalog = Catalog::new(root.path().join("a"), root.path().join("b"));
        assert_eq!(catalog.list_anomalies(1, None).await.total, 0);
        assert_eq!(catalog.list_segments(0, None).await.page, 1);
    }
}
