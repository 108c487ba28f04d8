use camera_recorder::config::CategoryPolicy;
use camera_recorder::naming::{list_closed, sidecar_name, Category};
use camera_recorder::retention::RetentionManager;
use camera_recorder::storage::{FilesystemSnapshotStore, SnapshotDraft, SnapshotStore};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
}

fn write_segment(dir: &Path, at: DateTime<Utc>) {
    std::fs::write(dir.join(Category::Segments.file_name(at)), b"segment").unwrap();
}

fn json_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".json"))
        .count()
}

#[tokio::test]
async fn test_scan_is_idempotent() {
    let dir = TempDir::new().unwrap();
    for minutes in 0..10 {
        write_segment(dir.path(), t0() + ChronoDuration::minutes(minutes * 10));
    }
    let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
        Category::Segments,
        dir.path(),
        CategoryPolicy {
            max_age_seconds: Some(3600),
            max_count: None,
        },
    );

    // At t0 + 100min everything older than t0 + 40min is past the age limit
    let now = t0() + ChronoDuration::minutes(100);
    let first = manager.scan_at(now, None).await;
    assert_eq!(first.total_deleted(), 4);
    assert_eq!(first.category(Category::Segments).unwrap().remaining, 6);

    let second = manager.scan_at(now, None).await;
    assert_eq!(second.total_deleted(), 0);
    assert_eq!(second.category(Category::Segments).unwrap().scanned, 6);

    let left = list_closed(dir.path(), Category::Segments).await.unwrap();
    assert_eq!(left.len(), 6);
    assert_eq!(left[0].timestamp, t0() + ChronoDuration::minutes(40));
}

#[tokio::test]
async fn test_snapshot_count_never_exceeds_limit() {
    const LIMIT: usize = 5;
    let dir = TempDir::new().unwrap();
    let store = FilesystemSnapshotStore::new(dir.path());
    store.initialize().await.unwrap();
    let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
        Category::Snapshots,
        dir.path(),
        CategoryPolicy {
            max_age_seconds: None,
            max_count: Some(LIMIT),
        },
    );

    let mut sequence = 0u64;
    for round in 0..6 {
        for _ in 0..3 {
            sequence += 1;
            store
                .persist(SnapshotDraft {
                    timestamp: t0() + ChronoDuration::seconds(sequence as i64),
                    sequence,
                    score: 0.5,
                    threshold: 0.065,
                    jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
                })
                .await
                .unwrap();
        }

        let report = manager.scan_at(t0() + ChronoDuration::hours(1), None).await;
        let snapshots = list_closed(dir.path(), Category::Snapshots).await.unwrap();
        assert!(snapshots.len() <= LIMIT, "round {}: {} snapshots", round, snapshots.len());
        assert_eq!(report.category(Category::Snapshots).unwrap().remaining, snapshots.len());

        // Sidecars go with their images, and only the newest survive
        assert_eq!(json_files(dir.path()), snapshots.len());
        let newest = t0() + ChronoDuration::seconds(sequence as i64);
        assert_eq!(snapshots.last().unwrap().timestamp, newest);
        for snapshot in &snapshots {
            assert!(dir.path().join(sidecar_name(&snapshot.name)).exists());
        }
    }
}

#[tokio::test]
async fn test_unmanaged_files_are_left_alone() {
    let dir = TempDir::new().unwrap();
    write_segment(dir.path(), t0());
    std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
    std::fs::write(
        dir.path().join(Category::Segments.partial_name(t0() + ChronoDuration::minutes(1))),
        b"in progress",
    )
    .unwrap();

    let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
        Category::Segments,
        dir.path(),
        CategoryPolicy {
            max_age_seconds: Some(1),
            max_count: Some(1),
        },
    );
    let report = manager.scan_at(t0() + ChronoDuration::days(1), None).await;

    assert_eq!(report.total_deleted(), 1);
    assert!(dir.path().join("notes.txt").exists());
    assert!(dir
        .path()
        .join(Category::Segments.partial_name(t0() + ChronoDuration::minutes(1)))
        .exists());
}

#[tokio::test]
async fn test_missing_directory_scans_empty() {
    let dir = TempDir::new().unwrap();
    let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
        Category::Segments,
        dir.path().join("never-created"),
        CategoryPolicy {
            max_age_seconds: Some(60),
            max_count: None,
        },
    );
    let report = manager.scan().await;
    assert_eq!(report.total_deleted(), 0);
    assert!(!report.interrupted);
    assert_eq!(report.category(Category::Segments).unwrap().scanned, 0);
}

#[tokio::test]
async fn test_failed_delete_is_skipped_and_scan_continues() {
    let dir = TempDir::new().unwrap();
    // A directory under a segment name cannot be removed with remove_file
    std::fs::create_dir(dir.path().join(Category::Segments.file_name(t0()))).unwrap();
    for minutes in [10, 20, 40] {
        write_segment(dir.path(), t0() + ChronoDuration::minutes(minutes));
    }
    let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
        Category::Segments,
        dir.path(),
        CategoryPolicy {
            max_age_seconds: Some(20 * 60),
            max_count: None,
        },
    );

    let report = manager.scan_at(t0() + ChronoDuration::minutes(50), None).await;
    let segments = report.category(Category::Segments).unwrap();
    assert_eq!(segments.scanned, 4);
    assert_eq!(segments.failed, 1);
    assert_eq!(segments.deleted, 2);
    assert_eq!(segments.remaining, 2);
    assert!(!report.interrupted);

    let left: Vec<_> = list_closed(dir.path(), Category::Segments)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.timestamp)
        .collect();
    assert_eq!(left, vec![t0(), t0() + ChronoDuration::minutes(40)]);
}
